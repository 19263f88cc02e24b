//! # PAGI Converse - Real-Time Voice Conversation
//!
//! Wake phrase, streaming transcription, ordered speech playback and barge-in for a
//! spoken assistant. Every stage runs on its own task; the state machine ties them together.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Voice Assistant                           │
//! │  ┌──────────────┐  ┌────────────────┐  ┌──────────────────┐      │
//! │  │   Listener   │→ │ Transcription  │→ │ Detector /       │      │
//! │  │    (cpal)    │  │ Client (+mixed)│  │ Recognizer       │      │
//! │  └──────────────┘  └────────────────┘  └──────────────────┘      │
//! │                                                 ↓ events          │
//! │  ┌──────────────┐  ┌────────────────┐  ┌──────────────────┐      │
//! │  │  Audio Out   │← │    Speaker     │← │  State Machine   │      │
//! │  │   (rodio)    │  │ (ordered queue)│  │  → Responder     │      │
//! │  └──────────────┘  └────────────────┘  └──────────────────┘      │
//! │           TimeoutMonitor: listener resume, recognize deadline     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod assistant;
pub mod audio;
pub mod config;
pub mod error;
pub mod machine;
pub mod notify;
pub mod ordered_queue;
pub mod registry;
pub mod speaker;
pub mod synthesis;
pub mod text;
pub mod timeout;
pub mod transcription;

pub use agent::{AgentReply, EchoAgent, FnAgent, ResponseAgent};
pub use assistant::{
    AssistantComponents, AssistantEvent, AssistantStatus, EventPayload, VoiceAssistant,
};
pub use audio::{AudioClip, AudioConfig, AudioSink, AudioSource, MicrophoneSource, RodioSink};
pub use config::AssistantConfig;
pub use error::{VoiceError, VoiceResult};
pub use machine::{StateMachine, Transition};
pub use notify::{BroadcastNotifier, Notification, NotificationSink, TracingNotifier};
pub use ordered_queue::OrderedQueue;
pub use registry::{Registries, Registry};
pub use speaker::{EndOutcome, OrderTicket, Speaker, SpeakerConfig};
pub use synthesis::{OpenAiTts, PlaceholderTts, TtsBackend, VoiceCache};
pub use timeout::TimeoutMonitor;
pub use transcription::{
    ClientConfig, ConnectionState, LoopbackBackend, MixedBackend, StreamMeta, TranscriptEvent,
    TranscriptionBackend, TranscriptionClient,
};

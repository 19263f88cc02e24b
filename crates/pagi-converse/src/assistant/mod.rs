//! **VoiceAssistant**: wake phrase → listen → recognize → respond.
//!
//! ```text
//!             Detected / Wakeup / AskAgain
//!   Default ─────────────────────────────▶ Listening
//!      ▲  │ SubmitQuery                      │ Listened / CommitListen
//!      │  ▼                                  ▼
//!   Responding ◀──────── Recognized ──── Recognizing
//!      │  Responded / StopResponse → Default
//!      └─ Detected / AskAgain → Listening
//! ```
//!
//! Every event goes through one dispatch task, so transitions never race. Transition
//! handlers only start work (spawned tasks, timers); they never block the dispatcher.

mod detector;
mod listener;
mod recognizer;
mod responder;

pub use detector::Detector;
pub use listener::{Listener, LISTENER_TIMEOUT_KEY};
pub use recognizer::{Recognizer, RECOGNIZE_TIMEOUT_KEY};
pub use responder::Responder;

use crate::agent::ResponseAgent;
use crate::audio::{AudioSink, AudioSource};
use crate::config::AssistantConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::machine::{StateMachine, Transition};
use crate::notify::{
    notify_quietly, BroadcastNotifier, Notification, NotificationSink, StampedNotification,
};
use crate::registry::Registries;
use crate::speaker::Speaker;
use crate::synthesis::{TtsBackend, VoiceCache};
use crate::timeout::TimeoutMonitor;
use crate::transcription::{TranscriptionBackend, TranscriptionClient};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssistantStatus {
    Default,
    Listening,
    Recognizing,
    Responding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssistantEvent {
    Detected,
    Listened,
    Recognized,
    Responded,
    Wakeup,
    CommitListen,
    StopResponse,
    AskAgain,
    SubmitQuery,
}

/// Data carried by an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Text heard after the wake phrase.
    pub text: Option<String>,
    /// Whether `text` came from a final result.
    pub end: bool,
    pub query: Option<String>,
}

impl EventPayload {
    pub fn detected(text: impl Into<String>, end: bool) -> Self {
        Self {
            text: Some(text.into()),
            end,
            query: None,
        }
    }

    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Default::default()
        }
    }
}

pub type AssistantMachine = StateMachine<AssistantStatus, AssistantEvent, EventPayload>;

#[derive(Debug)]
pub(crate) struct Action {
    pub event: AssistantEvent,
    pub payload: EventPayload,
}

/// Queues events for the assistant's dispatch task.
#[derive(Debug, Clone)]
pub struct Actions {
    tx: mpsc::UnboundedSender<Action>,
}

impl Actions {
    pub fn fire(&self, event: AssistantEvent, payload: EventPayload) {
        if self.tx.send(Action { event, payload }).is_err() {
            debug!("Assistant stopped; {:?} dropped", event);
        }
    }
}

pub(crate) fn actions_channel() -> (Actions, mpsc::UnboundedReceiver<Action>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Actions { tx }, rx)
}

/// Forwards to the configured sink and to subscribers.
struct Tee {
    broadcast: BroadcastNotifier,
    downstream: Arc<dyn NotificationSink>,
}

impl NotificationSink for Tee {
    fn notify(&self, notification: &Notification) -> VoiceResult<()> {
        notify_quietly(&self.broadcast, notification.clone());
        self.downstream.notify(notification)
    }
}

/// Everything the assistant talks to.
pub struct AssistantComponents {
    pub source: Box<dyn AudioSource>,
    pub sink: Arc<dyn AudioSink>,
    pub transcription: Arc<dyn TranscriptionBackend>,
    pub tts: Arc<dyn TtsBackend>,
    pub agent: Arc<dyn ResponseAgent>,
    pub notifier: Arc<dyn NotificationSink>,
}

impl AssistantComponents {
    /// Resolve the backends named in `config` from `registries`.
    pub fn from_registries(
        config: &AssistantConfig,
        registries: &Registries,
        source: Box<dyn AudioSource>,
        sink: Arc<dyn AudioSink>,
        notifier: Arc<dyn NotificationSink>,
    ) -> VoiceResult<Self> {
        Ok(Self {
            source,
            sink,
            transcription: registries
                .create_transcription(&config.transcription.backend, &config.transcription.settings)?,
            tts: registries
                .tts
                .create(&config.speaker.tts.backend, &config.speaker.tts.settings)?,
            agent: registries
                .agents
                .create(&config.agent.backend, &config.agent.settings)?,
            notifier,
        })
    }
}

/// Collaborators shared by the transition handlers.
struct Parts {
    detector: Arc<Detector>,
    recognizer: Arc<Recognizer>,
    responder: Arc<Responder>,
    listener: Arc<Listener>,
    notifier: Arc<dyn NotificationSink>,
    commit_pause: std::time::Duration,
}

/// The assistant. Must be created inside a tokio runtime.
pub struct VoiceAssistant {
    config: AssistantConfig,
    machine: Arc<AssistantMachine>,
    actions: Actions,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Action>>>,
    source: Mutex<Option<Box<dyn AudioSource>>>,
    broadcast: BroadcastNotifier,
    speaker: Arc<Speaker>,
    client: Arc<TranscriptionClient>,
    timeouts: Arc<TimeoutMonitor>,
    recognizer: Arc<Recognizer>,
    responder: Arc<Responder>,
    listener: Arc<Listener>,
    cache: Option<VoiceCache>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

impl VoiceAssistant {
    pub fn new(config: AssistantConfig, components: AssistantComponents) -> VoiceResult<Self> {
        let (actions, inbox) = actions_channel();
        let broadcast = BroadcastNotifier::default();
        let notifier: Arc<dyn NotificationSink> = Arc::new(Tee {
            broadcast: broadcast.clone(),
            downstream: components.notifier,
        });

        let mut speaker = Speaker::new(
            components.tts,
            components.sink,
            Arc::clone(&notifier),
            config.speaker_config(),
        );
        let cache = match &config.speaker.cache_dir {
            Some(dir) => Some(VoiceCache::open(dir)?),
            None => None,
        };
        if let Some(cache) = &cache {
            speaker = speaker.with_cache(cache.clone());
        }
        let speaker = Arc::new(speaker);

        let timeouts = Arc::new(TimeoutMonitor::spawn());
        let client = Arc::new(TranscriptionClient::new(
            components.transcription,
            config.client_config(),
        ));

        let detector = Arc::new(Detector::new(
            config.detector.keywords.clone(),
            actions.clone(),
        ));
        let recognizer = Arc::new(Recognizer::new(
            config.recognizer.clone(),
            config.detector.keywords.clone(),
            actions.clone(),
            Arc::clone(&notifier),
            Arc::clone(&timeouts),
        ));
        let responder = Arc::new(Responder::new(
            Arc::clone(&speaker),
            components.agent,
            actions.clone(),
            &config.agent,
        ));
        let listener = Arc::new(Listener::new(Arc::clone(&client), Arc::clone(&timeouts)));

        let parts = Arc::new(Parts {
            detector: Arc::clone(&detector),
            recognizer: Arc::clone(&recognizer),
            responder: Arc::clone(&responder),
            listener: Arc::clone(&listener),
            notifier,
            commit_pause: config.listener.commit_pause(),
        });
        let machine = Arc::new(build_machine(&parts)?);

        {
            let machine = Arc::clone(&machine);
            client.add_handler(move |event| match machine.status() {
                AssistantStatus::Default | AssistantStatus::Responding => {
                    detector.on_transcript(event);
                }
                AssistantStatus::Listening | AssistantStatus::Recognizing => {
                    parts.recognizer.on_transcript(event);
                }
            });
        }

        Ok(Self {
            config,
            machine,
            actions,
            inbox: Mutex::new(Some(inbox)),
            source: Mutex::new(Some(components.source)),
            broadcast,
            speaker,
            client,
            timeouts,
            recognizer,
            responder,
            listener,
            cache,
            dispatcher: Mutex::new(None),
            janitor: Mutex::new(None),
        })
    }

    /// Connect transcription, start the audio pump and begin dispatching events.
    pub fn start(&self) -> VoiceResult<()> {
        let inbox = self
            .inbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let source = self
            .source
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let (Some(mut inbox), Some(source)) = (inbox, source) else {
            return Err(VoiceError::Config("voice assistant already started".to_string()));
        };

        self.machine.init(AssistantStatus::Default);
        self.speaker.start();
        self.client.connect();
        self.listener
            .start(source, self.config.listener.read_timeout())?;

        let machine = Arc::clone(&self.machine);
        let dispatcher = tokio::spawn(async move {
            while let Some(action) = inbox.recv().await {
                machine.fire(action.event, action.payload);
            }
            debug!("Assistant dispatcher finished");
        });
        *self.dispatcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(dispatcher);

        if let Some(cache) = &self.cache {
            let janitor = cache.spawn_janitor(
                self.config.speaker.cache_max_age(),
                self.config.speaker.cache_prune_interval(),
            );
            *self.janitor.lock().unwrap_or_else(|e| e.into_inner()) = Some(janitor);
        }

        info!(
            "🤖 Voice assistant started (wake phrases: {:?})",
            self.config.detector.keywords
        );
        Ok(())
    }

    /// Stop everything. Pending timers and playback are dropped.
    pub async fn shutdown(&self) {
        self.listener.stop().await;
        self.recognizer.stop();
        self.responder.stop();
        self.client.disconnect().await;
        self.speaker.shutdown();
        self.timeouts.shutdown();
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }
        let janitor = self.janitor.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(janitor) = janitor {
            janitor.abort();
        }
        info!("🛑 Voice assistant stopped");
    }

    /// Queue a (usually manual) event.
    pub fn action(&self, event: AssistantEvent, payload: EventPayload) {
        self.actions.fire(event, payload);
    }

    pub fn status(&self) -> AssistantStatus {
        self.machine.status()
    }

    /// Stream of every notification the assistant emits.
    pub fn subscribe(&self) -> broadcast::Receiver<StampedNotification> {
        self.broadcast.subscribe()
    }

    pub fn speaker(&self) -> &Arc<Speaker> {
        &self.speaker
    }

    pub fn transcription(&self) -> &Arc<TranscriptionClient> {
        &self.client
    }

    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }
}

type Step = fn(&Parts, &EventPayload);

fn build_machine(parts: &Arc<Parts>) -> VoiceResult<AssistantMachine> {
    use AssistantEvent as E;
    use AssistantStatus as S;

    let table: [(S, E, S, Step); 11] = [
        (S::Default, E::Detected, S::Listening, |p, payload| {
            p.recognizer.listen(payload, false)
        }),
        (S::Listening, E::Listened, S::Recognizing, |p, _| {
            p.listener.resume();
            p.recognizer.recognize();
        }),
        (S::Recognizing, E::Recognized, S::Responding, |p, payload| {
            p.detector.reset();
            p.responder
                .respond(payload.query.clone().unwrap_or_default());
        }),
        (S::Responding, E::Responded, S::Default, |_, _| {}),
        (S::Responding, E::Detected, S::Listening, |p, payload| {
            p.responder.stop();
            p.recognizer.listen(payload, false);
        }),
        (S::Default, E::Wakeup, S::Listening, |p, payload| {
            p.recognizer.listen(payload, true)
        }),
        (S::Listening, E::CommitListen, S::Recognizing, |p, _| {
            p.listener.pause(p.commit_pause);
            p.recognizer.recognize();
        }),
        (S::Responding, E::StopResponse, S::Default, |p, _| {
            p.responder.stop()
        }),
        (S::Responding, E::AskAgain, S::Listening, |p, payload| {
            p.responder.stop();
            p.recognizer.listen(payload, true);
        }),
        (S::Default, E::AskAgain, S::Listening, |p, payload| {
            p.recognizer.listen(payload, true)
        }),
        (S::Default, E::SubmitQuery, S::Responding, |p, payload| {
            p.responder
                .respond(payload.query.clone().unwrap_or_default());
        }),
    ];

    let mut machine = AssistantMachine::new(S::Default);
    for (from, event, to, step) in table {
        let parts = Arc::clone(parts);
        machine.register(from, event, to, move |t: Transition<S, E>, payload: EventPayload| {
            announce(&parts, t);
            step(&parts, &payload);
        })?;
    }
    Ok(machine)
}

fn announce(parts: &Parts, t: Transition<AssistantStatus, AssistantEvent>) {
    info!("🔁 {:?} --{:?}--> {:?}", t.from, t.event, t.to);
    notify_quietly(
        parts.notifier.as_ref(),
        Notification::StatusChanged {
            from: format!("{:?}", t.from),
            to: format!("{:?}", t.to),
            event: format!("{:?}", t.event),
        },
    );
    if t.to == AssistantStatus::Listening {
        notify_quietly(parts.notifier.as_ref(), Notification::ListeningStarted);
    }
}

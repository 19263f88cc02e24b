//! Voice Assistant Demo: microphone → transcription → agent → ordered speech.
//!
//! Backends come from the registries, selected by configuration:
//! - **Transcription**: `transcription.backend` (default `placeholder`, which never hears anything;
//!   use the Wakeup/SubmitQuery controls below to drive a turn by hand).
//! - **TTS**: `speaker.tts.backend`; set it to `openai` with `TTS_API_KEY` in `.env` to hear replies.
//! - **Agent**: `agent.backend` (default `echo`).
//!
//! Type `w` + Enter to wake the assistant, `c` to commit, `s` to stop a reply, or any other
//! text to submit it as a query. Press Ctrl+C to stop.

use anyhow::Context;
use pagi_converse::assistant::{AssistantComponents, AssistantEvent, EventPayload};
use pagi_converse::{
    AssistantConfig, MicrophoneSource, Registries, RodioSink, TracingNotifier, VoiceAssistant,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("🤖 PAGI Converse - voice assistant demo");
    let config = AssistantConfig::load().context("loading configuration")?;
    let registries = Registries::with_defaults()?;
    info!(
        "Backends: transcription={} tts={} agent={}",
        config.transcription.backend, config.speaker.tts.backend, config.agent.backend
    );

    let mic = MicrophoneSource::open(config.audio_config()).context("opening microphone")?;
    let speakers = RodioSink::open().context("opening audio output")?;
    let components = AssistantComponents::from_registries(
        &config,
        &registries,
        Box::new(mic),
        Arc::new(speakers),
        Arc::new(TracingNotifier),
    )?;

    let assistant = Arc::new(VoiceAssistant::new(config, components)?);
    assistant.start()?;

    let mut notes = assistant.subscribe();
    tokio::spawn(async move {
        while let Ok(note) = notes.recv().await {
            if let Ok(json) = serde_json::to_string(&note) {
                println!("{}", json);
            }
        }
    });

    let controls = {
        let assistant = Arc::clone(&assistant);
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match line.trim() {
                    "" => {}
                    "w" => assistant.action(AssistantEvent::Wakeup, EventPayload::default()),
                    "c" => assistant.action(AssistantEvent::CommitListen, EventPayload::default()),
                    "s" => assistant.action(AssistantEvent::StopResponse, EventPayload::default()),
                    query => assistant.action(AssistantEvent::SubmitQuery, EventPayload::query(query)),
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    controls.abort();
    assistant.shutdown().await;
    info!("👋 Goodbye!");
    Ok(())
}

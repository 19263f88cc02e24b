//! Fakes shared by the integration tests: a scripted microphone, a TTS backend with
//! per-text latency, and a sink that records what it played.

#![allow(dead_code)]

use pagi_converse::{AudioClip, AudioSink, AudioSource, Notification, VoiceError, VoiceResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("pagi_converse=debug")
        .with_test_writer()
        .try_init();
}

/// Silence in fixed-size chunks, paced like a real microphone.
pub struct SilentMic {
    pub chunk_bytes: usize,
    pub pace: Duration,
}

impl Default for SilentMic {
    fn default() -> Self {
        Self {
            chunk_bytes: 320,
            pace: Duration::from_millis(10),
        }
    }
}

impl AudioSource for SilentMic {
    fn read(&mut self, _timeout: Duration) -> VoiceResult<Option<Vec<u8>>> {
        std::thread::sleep(self.pace);
        Ok(Some(vec![0; self.chunk_bytes]))
    }
}

/// Synthesizes instantly unless a latency is scripted for the text.
#[derive(Default)]
pub struct ScriptedTts {
    pub latency: HashMap<String, Duration>,
    pub failing: Vec<String>,
    pub calls: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedTts {
    pub fn with_latency(pairs: &[(&str, u64)]) -> Self {
        Self {
            latency: pairs
                .iter()
                .map(|(text, ms)| (text.to_string(), Duration::from_millis(*ms)))
                .collect(),
            ..Default::default()
        }
    }

    pub fn texts(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(t, _)| t.clone())
            .collect()
    }
}

impl pagi_converse::TtsBackend for ScriptedTts {
    fn synthesize(&self, text: &str) -> VoiceResult<AudioClip> {
        self.calls
            .lock()
            .unwrap()
            .push((text.to_string(), Instant::now()));
        if let Some(latency) = self.latency.get(text) {
            std::thread::sleep(*latency);
        }
        if self.failing.iter().any(|t| t == text) {
            return Err(VoiceError::Synthesis(format!("scripted failure: {}", text)));
        }
        Ok(AudioClip::new(text, text.as_bytes().to_vec()))
    }
}

/// Records played clips; each play takes `play_time` unless stopped.
#[derive(Default)]
pub struct RecordingSink {
    pub play_time: Duration,
    pub played: Mutex<Vec<String>>,
    stops: AtomicUsize,
}

impl RecordingSink {
    pub fn new(play_time: Duration) -> Self {
        Self {
            play_time,
            ..Default::default()
        }
    }

    pub fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl AudioSink for RecordingSink {
    fn play(&self, clip: &AudioClip) -> VoiceResult<()> {
        let generation = self.stops.load(Ordering::SeqCst);
        let started = Instant::now();
        while started.elapsed() < self.play_time {
            if self.stops.load(Ordering::SeqCst) != generation {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.played.lock().unwrap().push(clip.text.clone());
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn is_playing(&self) -> bool {
        false
    }
}

/// Receive notifications until `matches` accepts one. Returns everything seen, or
/// `None` if nothing matched within `timeout`.
pub async fn wait_for<R>(
    rx: &mut broadcast::Receiver<R>,
    timeout: Duration,
    mut matches: impl FnMut(&R) -> bool,
) -> Option<Vec<R>>
where
    R: Clone,
{
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let next = tokio::time::timeout_at(deadline, rx.recv()).await.ok()?;
        match next {
            Ok(item) => {
                let done = matches(&item);
                seen.push(item);
                if done {
                    return Some(seen);
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

pub fn status_change(notification: &Notification, to: &str, event: &str) -> bool {
    matches!(
        notification,
        Notification::StatusChanged { to: t, event: e, .. } if t == to && e == event
    )
}

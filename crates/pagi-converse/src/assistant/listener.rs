//! Audio pump: microphone chunks into the transcription client.
//!
//! The source is read on a dedicated thread (capture APIs block). While paused the pump
//! keeps the stream going with silence of the same length, which makes the backend
//! settle its final result.

use crate::audio::AudioSource;
use crate::error::VoiceResult;
use crate::timeout::TimeoutMonitor;
use crate::transcription::TranscriptionClient;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// TimeoutMonitor key of the scheduled resume.
pub const LISTENER_TIMEOUT_KEY: &str = "listener";

/// Chunks buffered between the capture thread and the forwarder.
const PUMP_BUFFER: usize = 64;

pub struct Listener {
    client: Arc<TranscriptionClient>,
    timeouts: Arc<TimeoutMonitor>,
    paused: Arc<AtomicBool>,
    forwarded: Arc<AtomicUsize>,
    cancel: CancellationToken,
    tasks: Mutex<Option<(std::thread::JoinHandle<()>, JoinHandle<()>)>>,
}

impl Listener {
    pub fn new(client: Arc<TranscriptionClient>, timeouts: Arc<TimeoutMonitor>) -> Self {
        Self {
            client,
            timeouts,
            paused: Arc::new(AtomicBool::new(false)),
            forwarded: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(None),
        }
    }

    /// Start pumping `source`. Each read waits at most `read_timeout`.
    pub fn start(&self, mut source: Box<dyn AudioSource>, read_timeout: Duration) -> VoiceResult<()> {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(PUMP_BUFFER);

        let cancel = self.cancel.clone();
        let reader = std::thread::Builder::new()
            .name("pagi-listener".to_string())
            .spawn(move || {
                while !cancel.is_cancelled() {
                    match source.read(read_timeout) {
                        Ok(Some(chunk)) => {
                            if tx.blocking_send(chunk).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!("Audio source failed: {}", e);
                            break;
                        }
                    }
                }
                debug!("Audio reader finished");
            })?;

        let client = Arc::clone(&self.client);
        let paused = Arc::clone(&self.paused);
        let forwarded = Arc::clone(&self.forwarded);
        let cancel = self.cancel.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                let chunk = tokio::select! {
                    chunk = rx.recv() => chunk,
                    _ = cancel.cancelled() => None,
                };
                let Some(mut chunk) = chunk else {
                    break;
                };
                if paused.load(Ordering::SeqCst) {
                    chunk.fill(0);
                }
                if client.send_audio(&chunk).await {
                    forwarded.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        *self.tasks.lock().unwrap_or_else(|e| e.into_inner()) = Some((reader, forwarder));
        info!("🎤 Listener started");
        Ok(())
    }

    /// Send silence instead of audio for `duration`, then resume.
    pub fn pause(&self, duration: Duration) {
        self.paused.store(true, Ordering::SeqCst);
        let paused = Arc::clone(&self.paused);
        self.timeouts.put(LISTENER_TIMEOUT_KEY, duration, move || {
            paused.store(false, Ordering::SeqCst);
            debug!("Listener resumed after pause");
        });
        debug!("Listener paused for {:?}", duration);
    }

    pub fn resume(&self) {
        self.timeouts.pop(LISTENER_TIMEOUT_KEY);
        if self.paused.swap(false, Ordering::SeqCst) {
            debug!("Listener resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Chunks the client accepted so far.
    pub fn forwarded(&self) -> usize {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Stop pumping and wait for the capture thread.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((reader, forwarder)) = tasks {
            forwarder.abort();
            if tokio::task::spawn_blocking(move || reader.join()).await.is_err() {
                warn!("Audio reader did not shut down cleanly");
            }
            info!("🔇 Listener stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::{ClientConfig, LoopbackBackend};

    /// Yields a fixed chunk every few milliseconds.
    struct Tone;

    impl AudioSource for Tone {
        fn read(&mut self, _timeout: Duration) -> VoiceResult<Option<Vec<u8>>> {
            std::thread::sleep(Duration::from_millis(5));
            Ok(Some(vec![7; 8]))
        }
    }

    async fn running() -> (Listener, LoopbackBackend, Arc<TranscriptionClient>) {
        let backend = LoopbackBackend::new("loop");
        let client = Arc::new(TranscriptionClient::new(
            Arc::new(backend.clone()),
            ClientConfig::default(),
        ));
        client.connect();
        assert!(client.wait_ready(Duration::from_secs(2)).await);
        let listener = Listener::new(Arc::clone(&client), Arc::new(TimeoutMonitor::spawn()));
        listener
            .start(Box::new(Tone), Duration::from_millis(50))
            .unwrap();
        (listener, backend, client)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_audio_reaches_backend() {
        let (listener, backend, client) = running().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(listener.forwarded() > 0);
        assert!(backend.audio().iter().all(|chunk| chunk == &vec![7; 8]));
        listener.stop().await;
        client.disconnect().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pause_sends_silence_then_resumes() {
        let (listener, backend, client) = running().await;
        listener.pause(Duration::from_millis(100));
        assert!(listener.is_paused());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(backend.audio().iter().any(|chunk| chunk == &vec![0; 8]));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!listener.is_paused());
        listener.stop().await;
        client.disconnect().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resume_cancels_scheduled_resume() {
        let (listener, _backend, client) = running().await;
        listener.pause(Duration::from_secs(5));
        listener.resume();
        assert!(!listener.is_paused());
        listener.stop().await;
        client.disconnect().await;
    }
}

//! In-process backend driven from the outside.
//!
//! Results are injected with [`LoopbackBackend::emit`] and the server side can be
//! hung up with [`LoopbackBackend::hang_up`]. Bridges a local recognizer running in
//! the same process, and exercises the client without a network.

use super::{StreamMeta, TranscriptEvent, TranscriptSender, TranscriptionBackend, TranscriptionConnection};
use crate::error::{VoiceError, VoiceResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Link {
    events: TranscriptSender,
    closed: CancellationToken,
}

#[derive(Default)]
struct Inner {
    name: String,
    link: Mutex<Option<Link>>,
    audio: Mutex<Vec<Vec<u8>>>,
    metas: Mutex<Vec<StreamMeta>>,
    connects: AtomicUsize,
    refuse: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Loopback transcription backend. Clones share the same state.
#[derive(Clone, Default)]
pub struct LoopbackBackend {
    inner: Arc<Inner>,
}

impl LoopbackBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                ..Default::default()
            }),
        }
    }

    /// Deliver `event` on the current connection. `false` if none is open.
    pub async fn emit(&self, event: TranscriptEvent) -> bool {
        let events = match lock(&self.inner.link).as_ref() {
            Some(link) if !link.closed.is_cancelled() => link.events.clone(),
            _ => return false,
        };
        events.send(event).await.is_ok()
    }

    /// Close the current connection from the server side.
    pub fn hang_up(&self) -> bool {
        match lock(&self.inner.link).take() {
            Some(link) => {
                debug!("{}: hanging up", self.inner.name);
                link.closed.cancel();
                true
            }
            None => false,
        }
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next(&self, n: usize) {
        self.inner.refuse.store(n, Ordering::SeqCst);
    }

    /// Connection attempts so far (including refused ones).
    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Audio chunks received, across all connections.
    pub fn audio(&self) -> Vec<Vec<u8>> {
        lock(&self.inner.audio).clone()
    }

    pub fn metas(&self) -> Vec<StreamMeta> {
        lock(&self.inner.metas).clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.link)
            .as_ref()
            .is_some_and(|link| !link.closed.is_cancelled())
    }
}

#[async_trait::async_trait]
impl TranscriptionBackend for LoopbackBackend {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn connect(&self, events: TranscriptSender)
        -> VoiceResult<Arc<dyn TranscriptionConnection>> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .inner
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(VoiceError::Transcription(format!(
                "{}: connection refused",
                self.inner.name
            )));
        }

        let closed = CancellationToken::new();
        let previous = lock(&self.inner.link).replace(Link {
            events,
            closed: closed.clone(),
        });
        if let Some(previous) = previous {
            previous.closed.cancel();
        }
        Ok(Arc::new(LoopbackConnection {
            inner: Arc::clone(&self.inner),
            closed,
        }))
    }
}

struct LoopbackConnection {
    inner: Arc<Inner>,
    closed: CancellationToken,
}

impl LoopbackConnection {
    fn check_open(&self) -> VoiceResult<()> {
        if self.closed.is_cancelled() {
            return Err(VoiceError::Transcription("connection closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl TranscriptionConnection for LoopbackConnection {
    async fn send_meta(&self, meta: &StreamMeta) -> VoiceResult<()> {
        self.check_open()?;
        lock(&self.inner.metas).push(meta.clone());
        Ok(())
    }

    async fn send_audio(&self, chunk: &[u8]) -> VoiceResult<()> {
        self.check_open()?;
        lock(&self.inner.audio).push(chunk.to_vec());
        Ok(())
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    async fn stop(&self) {
        self.closed.cancel();
    }
}

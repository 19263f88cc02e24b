//! **Real-time transcription client**: one resilient streaming session, many listeners.
//!
//! The client owns a supervisor task that keeps a connection to a
//! [`TranscriptionBackend`] alive: connect → handshake (send [`StreamMeta`]) → ready →
//! wait for close → back off → reconnect, until [`TranscriptionClient::disconnect`].
//! A failed or panicking attempt only ever triggers the next reconnect.
//!
//! ```text
//!  AudioSource ──send_audio──▶ [ready?] ──▶ connection ──▶ backend
//!                                                          │
//!  handlers ◀── dispatcher task ◀── TranscriptSender ◀─────┘
//! ```
//!
//! Audio sent while the connection is not ready is dropped, never queued: stale
//! speech is worse than a missing frame.

mod loopback;
mod mixed;

pub use loopback::LoopbackBackend;
pub use mixed::MixedBackend;

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One normalized recognition result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub text: String,
    /// `false` for an interim partial, `true` for a settled phrase.
    pub is_final: bool,
    pub sequence: Option<i64>,
    /// Name of the backend that produced it.
    pub source: Option<String>,
}

impl TranscriptEvent {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            sequence: None,
            source: None,
        }
    }

    pub fn settled(text: impl Into<String>) -> Self {
        Self {
            is_final: true,
            ..Self::partial(text)
        }
    }

    pub fn with_sequence(mut self, sequence: i64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// Handshake payload sent right after a connection opens (and again on commit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMeta {
    pub is_speaking: bool,
    /// Backend-specific fields, passed through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for StreamMeta {
    fn default() -> Self {
        Self {
            is_speaking: true,
            extra: serde_json::Map::new(),
        }
    }
}

/// Where a backend delivers its results.
///
/// Sending waits while the receiving queue is full, so a slow consumer makes delivery
/// lag instead of dropping results.
#[derive(Debug, Clone)]
pub struct TranscriptSender {
    tx: mpsc::Sender<TranscriptEvent>,
    source: Option<Arc<str>>,
    force_final: Option<bool>,
}

/// Bounded event channel between backends and a consumer.
pub fn transcript_channel(capacity: usize) -> (TranscriptSender, mpsc::Receiver<TranscriptEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        TranscriptSender {
            tx,
            source: None,
            force_final: None,
        },
        rx,
    )
}

impl TranscriptSender {
    /// A sender that stamps `source` on events and overrides their finality.
    pub fn tagged(&self, source: &str, is_final: bool) -> Self {
        Self {
            tx: self.tx.clone(),
            source: Some(Arc::from(source)),
            force_final: Some(is_final),
        }
    }

    fn prepare(&self, mut event: TranscriptEvent) -> TranscriptEvent {
        if let Some(is_final) = self.force_final {
            event.is_final = is_final;
        }
        if event.source.is_none() {
            event.source = self.source.as_deref().map(str::to_string);
        }
        event
    }

    pub async fn send(&self, event: TranscriptEvent) -> VoiceResult<()> {
        self.tx
            .send(self.prepare(event))
            .await
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }

    /// For backends that read their socket on a plain thread.
    pub fn blocking_send(&self, event: TranscriptEvent) -> VoiceResult<()> {
        self.tx
            .blocking_send(self.prepare(event))
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }
}

/// Factory for streaming recognition sessions.
#[async_trait::async_trait]
pub trait TranscriptionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Open a session; results go to `events` until the connection ends.
    async fn connect(&self, events: TranscriptSender)
        -> VoiceResult<Arc<dyn TranscriptionConnection>>;
}

/// One open recognition session.
#[async_trait::async_trait]
pub trait TranscriptionConnection: Send + Sync {
    async fn send_meta(&self, meta: &StreamMeta) -> VoiceResult<()>;

    async fn send_audio(&self, chunk: &[u8]) -> VoiceResult<()>;

    /// Resolves once the session has ended (server hangup or transport error).
    async fn closed(&self);

    async fn stop(&self);
}

/// Backend that accepts audio and never answers. Used when none is configured.
#[derive(Debug, Default)]
pub struct PlaceholderTranscriber;

struct PlaceholderConnection {
    closed: CancellationToken,
}

#[async_trait::async_trait]
impl TranscriptionBackend for PlaceholderTranscriber {
    fn name(&self) -> &str {
        "placeholder"
    }

    async fn connect(&self, _events: TranscriptSender)
        -> VoiceResult<Arc<dyn TranscriptionConnection>> {
        Ok(Arc::new(PlaceholderConnection {
            closed: CancellationToken::new(),
        }))
    }
}

#[async_trait::async_trait]
impl TranscriptionConnection for PlaceholderConnection {
    async fn send_meta(&self, _meta: &StreamMeta) -> VoiceResult<()> {
        Ok(())
    }

    async fn send_audio(&self, _chunk: &[u8]) -> VoiceResult<()> {
        Ok(())
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    async fn stop(&self) {
        self.closed.cancel();
    }
}

/// Connection lifecycle as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Transport open, handshake not yet done.
    Open,
    /// Handshake done; audio is forwarded.
    Ready,
    Closed,
}

/// Subscriber to transcript events.
pub type TranscriptHandler = Arc<dyn Fn(&TranscriptEvent) + Send + Sync>;

/// Client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Wait between a closed connection and the next attempt (default: 5s).
    pub backoff: Duration,
    /// Handshake sent on every new connection.
    pub meta: StreamMeta,
    /// Capacity of the event queue between backend and handlers (default: 1024).
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(5),
            meta: StreamMeta::default(),
            event_buffer: 1024,
        }
    }
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    /// Set only by the supervisor, and only while the connection is ready.
    connection: RwLock<Option<Arc<dyn TranscriptionConnection>>>,
    handlers: RwLock<Vec<TranscriptHandler>>,
    sessions: AtomicUsize,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn ready_connection(&self) -> Option<Arc<dyn TranscriptionConnection>> {
        self.connection
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_connection(&self, conn: Option<Arc<dyn TranscriptionConnection>>) {
        *self.connection.write().unwrap_or_else(|e| e.into_inner()) = conn;
    }
}

/// Keeps a transcription session alive and fans its events out to handlers.
pub struct TranscriptionClient {
    backend: Arc<dyn TranscriptionBackend>,
    config: ClientConfig,
    shared: Arc<Shared>,
    shutdown: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TranscriptionClient {
    pub fn new(backend: Arc<dyn TranscriptionBackend>, config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            backend,
            config,
            shared: Arc::new(Shared {
                state,
                connection: RwLock::new(None),
                handlers: RwLock::new(Vec::new()),
                sessions: AtomicUsize::new(0),
            }),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to transcript events. Each handler sees events in receipt order.
    pub fn add_handler<F>(&self, handler: F)
    where
        F: Fn(&TranscriptEvent) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(handler));
    }

    /// Start the supervisor and dispatcher. Calling it while running is a no-op.
    pub fn connect(&self) {
        let mut shutdown = self.shutdown.lock().unwrap_or_else(|e| e.into_inner());
        if shutdown.is_some() {
            debug!("Transcription client already running");
            return;
        }
        let token = CancellationToken::new();
        *shutdown = Some(token.clone());

        info!("🎧 Starting transcription client ({})", self.backend.name());
        let (events, rx) = transcript_channel(self.config.event_buffer);

        let dispatcher = tokio::spawn(dispatch_events(rx, Arc::clone(&self.shared)));
        let supervisor = tokio::spawn(supervise(
            Arc::clone(&self.backend),
            Arc::clone(&self.shared),
            events,
            self.config.clone(),
            token,
        ));

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(supervisor);
        tasks.push(dispatcher);
    }

    /// Stop reconnecting and close the current connection.
    pub async fn disconnect(&self) {
        let token = self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(token) = token else {
            return;
        };
        token.cancel();

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        let mut tasks = tasks.into_iter();
        if let Some(supervisor) = tasks.next() {
            let _ = supervisor.await;
        }
        for task in tasks {
            task.abort();
        }
        self.shared.set_state(ConnectionState::Disconnected);
        info!("🛑 Transcription client stopped");
    }

    /// Forward audio if the connection is ready. Returns whether it was sent.
    pub async fn send_audio(&self, chunk: &[u8]) -> bool {
        let Some(conn) = self.shared.ready_connection() else {
            return false;
        };
        match conn.send_audio(chunk).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Audio chunk dropped: {}", e);
                false
            }
        }
    }

    /// Send meta on the live connection (e.g. `is_speaking: false` to force a final result).
    pub async fn send_meta(&self, meta: &StreamMeta) -> VoiceResult<()> {
        let conn = self
            .shared
            .ready_connection()
            .ok_or(VoiceError::NotConnected)?;
        conn.send_meta(meta).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Wait until the connection is ready, up to `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.state.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == ConnectionState::Ready))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Number of sessions that completed the handshake since creation.
    pub fn sessions(&self) -> usize {
        self.shared.sessions.load(Ordering::SeqCst)
    }
}

async fn dispatch_events(mut rx: mpsc::Receiver<TranscriptEvent>, shared: Arc<Shared>) {
    while let Some(event) = rx.recv().await {
        let handlers = shared
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for handler in handlers {
            // A panicking handler must not take the dispatcher (and every later event) down.
            if panic::catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                error!("Transcript handler panicked on {:?}", event.text);
            }
        }
    }
}

async fn supervise(
    backend: Arc<dyn TranscriptionBackend>,
    shared: Arc<Shared>,
    events: TranscriptSender,
    config: ClientConfig,
    shutdown: CancellationToken,
) {
    while !shutdown.is_cancelled() {
        shared.set_state(ConnectionState::Connecting);

        // Each attempt runs as its own task so even a panicking backend only costs a reconnect.
        let attempt = tokio::spawn(run_session(
            Arc::clone(&backend),
            Arc::clone(&shared),
            events.clone(),
            config.meta.clone(),
            shutdown.clone(),
        ));
        match attempt.await {
            Ok(Ok(())) => debug!("Transcription session ended"),
            Ok(Err(e)) => warn!("🔌 Transcription session failed: {}", e),
            Err(e) => error!("Transcription session crashed: {}", e),
        }
        shared.set_connection(None);
        shared.set_state(ConnectionState::Disconnected);

        if shutdown.is_cancelled() {
            break;
        }
        info!("🔁 Reconnecting to {} in {:?}", backend.name(), config.backoff);
        tokio::select! {
            _ = tokio::time::sleep(config.backoff) => {}
            _ = shutdown.cancelled() => break,
        }
    }
    shared.set_state(ConnectionState::Disconnected);
}

async fn run_session(
    backend: Arc<dyn TranscriptionBackend>,
    shared: Arc<Shared>,
    events: TranscriptSender,
    meta: StreamMeta,
    shutdown: CancellationToken,
) -> VoiceResult<()> {
    let conn = tokio::select! {
        conn = backend.connect(events) => conn?,
        _ = shutdown.cancelled() => return Ok(()),
    };
    shared.set_state(ConnectionState::Open);

    if let Err(e) = conn.send_meta(&meta).await {
        conn.stop().await;
        return Err(e);
    }
    if shutdown.is_cancelled() {
        conn.stop().await;
        return Ok(());
    }

    shared.set_connection(Some(Arc::clone(&conn)));
    shared.set_state(ConnectionState::Ready);
    shared.sessions.fetch_add(1, Ordering::SeqCst);
    info!("✅ Transcription ready ({})", backend.name());

    tokio::select! {
        _ = conn.closed() => warn!("⚠️ {} closed the connection", backend.name()),
        _ = shutdown.cancelled() => {}
    }

    shared.set_connection(None);
    shared.set_state(ConnectionState::Closed);
    conn.stop().await;
    Ok(())
}

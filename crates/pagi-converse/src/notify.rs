//! Lifecycle notifications for a UI or log.
//!
//! Delivery is fire-and-forget: the engine never waits on a sink, and a failed
//! delivery is logged and dropped.

use crate::error::{VoiceError, VoiceResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// State and utterance lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    ListeningStarted,
    SpeakingStarted,
    SpeakingEnded,
    TranscriptPartial { text: String },
    TranscriptFinal { text: String },
    StatusChanged { from: String, to: String, event: String },
    /// Raw reply text as it streams in from the agent.
    ResponseDelta { text: String },
}

/// Receiver of [`Notification`]s.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &Notification) -> VoiceResult<()>;
}

/// Deliver `notification`, logging instead of failing.
pub fn notify_quietly(sink: &dyn NotificationSink, notification: Notification) {
    if let Err(e) = sink.notify(&notification) {
        debug!("Notification {:?} not delivered: {}", notification, e);
    }
}

/// Writes notifications to the tracing log.
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn notify(&self, notification: &Notification) -> VoiceResult<()> {
        match notification {
            Notification::ListeningStarted => info!("👂 Listening"),
            Notification::SpeakingStarted => info!("🗣️ Speaking started"),
            Notification::SpeakingEnded => info!("🤐 Speaking ended"),
            Notification::TranscriptFinal { text } => info!("📝 {}", text),
            Notification::StatusChanged { from, to, event } => {
                info!("🔀 {} --{}--> {}", from, event, to)
            }
            other => debug!("{:?}", other),
        }
        Ok(())
    }
}

/// A notification with the time it was emitted.
#[derive(Debug, Clone, Serialize)]
pub struct StampedNotification {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub notification: Notification,
}

/// Fans notifications out to any number of subscribers (e.g. websocket sessions).
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<StampedNotification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StampedNotification> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl NotificationSink for BroadcastNotifier {
    fn notify(&self, notification: &Notification) -> VoiceResult<()> {
        self.tx
            .send(StampedNotification {
                at: Utc::now(),
                notification: notification.clone(),
            })
            .map(|_| ())
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }
}

//! Two engines, one stream.
//!
//! A fast engine supplies interim results while a slower, more accurate one supplies
//! the final text. Both get the same meta and audio. Their results meet in one bounded
//! queue drained by a dispatcher task, so a slow consumer on one side never blocks
//! delivery from the other; when the queue is full, delivery lags but sends still succeed.

use super::{
    transcript_channel, StreamMeta, TranscriptSender, TranscriptionBackend,
    TranscriptionConnection,
};
use crate::error::VoiceResult;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Default capacity of the shared result queue.
pub const MIXED_QUEUE_CAPACITY: usize = 1024;

/// Multiplexes an interim-result engine and a final-result engine.
pub struct MixedBackend {
    interim: Arc<dyn TranscriptionBackend>,
    settled: Arc<dyn TranscriptionBackend>,
    queue_capacity: usize,
}

impl MixedBackend {
    pub fn new(interim: Arc<dyn TranscriptionBackend>, settled: Arc<dyn TranscriptionBackend>) -> Self {
        Self {
            interim,
            settled,
            queue_capacity: MIXED_QUEUE_CAPACITY,
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

#[async_trait::async_trait]
impl TranscriptionBackend for MixedBackend {
    fn name(&self) -> &str {
        "mixed"
    }

    async fn connect(&self, events: TranscriptSender)
        -> VoiceResult<Arc<dyn TranscriptionConnection>> {
        let (queue, mut queue_rx) = transcript_channel(self.queue_capacity);

        let interim = self
            .interim
            .connect(queue.tagged(self.interim.name(), false))
            .await?;
        let settled = match self
            .settled
            .connect(queue.tagged(self.settled.name(), true))
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                interim.stop().await;
                return Err(e);
            }
        };
        drop(queue);

        let dispatcher = tokio::spawn(async move {
            while let Some(event) = queue_rx.recv().await {
                if events.send(event).await.is_err() {
                    break;
                }
            }
            debug!("Mixed dispatcher finished");
        });

        info!(
            "🔀 Mixed transcription: {} (interim) + {} (final)",
            self.interim.name(),
            self.settled.name()
        );
        Ok(Arc::new(MixedConnection {
            interim,
            settled,
            dispatcher: Mutex::new(Some(dispatcher)),
        }))
    }
}

struct MixedConnection {
    interim: Arc<dyn TranscriptionConnection>,
    settled: Arc<dyn TranscriptionConnection>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait::async_trait]
impl TranscriptionConnection for MixedConnection {
    async fn send_meta(&self, meta: &StreamMeta) -> VoiceResult<()> {
        // Both sides always get it; the first error is reported.
        let interim = self.interim.send_meta(meta).await;
        let settled = self.settled.send_meta(meta).await;
        interim.and(settled)
    }

    async fn send_audio(&self, chunk: &[u8]) -> VoiceResult<()> {
        let interim = self.interim.send_audio(chunk).await;
        let settled = self.settled.send_audio(chunk).await;
        interim.and(settled)
    }

    async fn closed(&self) {
        tokio::select! {
            _ = self.interim.closed() => {}
            _ = self.settled.closed() => {}
        }
    }

    async fn stop(&self) {
        self.interim.stop().await;
        self.settled.stop().await;
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }
    }
}

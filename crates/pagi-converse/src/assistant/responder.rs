//! Turns a recognized query into spoken output.

use super::{Actions, AssistantEvent, EventPayload};
use crate::agent::{AgentReply, ResponseAgent};
use crate::config::AgentSettings;
use crate::error::VoiceResult;
use crate::speaker::{EndOutcome, Speaker};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn normalize(text: &str) -> &str {
    text.trim()
        .trim_end_matches(|c: char| "。！？!?.，,".contains(c))
}

pub struct Responder {
    speaker: Arc<Speaker>,
    agent: Arc<dyn ResponseAgent>,
    actions: Actions,
    pardon: String,
    stop_words: Vec<String>,
    current: Mutex<Option<CancellationToken>>,
}

impl Responder {
    pub fn new(
        speaker: Arc<Speaker>,
        agent: Arc<dyn ResponseAgent>,
        actions: Actions,
        settings: &AgentSettings,
    ) -> Self {
        Self {
            speaker,
            agent,
            actions,
            pardon: settings.pardon.clone(),
            stop_words: settings.stop_words.clone(),
            current: Mutex::new(None),
        }
    }

    fn is_stop_word(&self, query: &str) -> bool {
        let query = normalize(query);
        self.stop_words.iter().any(|w| normalize(w) == query)
    }

    /// Answer `query` on a new task, replacing any reply still in progress.
    /// Fires `Responded` when done, unless stopped.
    pub fn respond(self: &Arc<Self>, query: String) {
        let token = CancellationToken::new();
        let previous = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
            self.agent.interrupt();
            self.speaker.interrupt();
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.run(&query, &token).await {
                if !token.is_cancelled() {
                    warn!("Response failed: {}", e);
                }
            }
            if token.is_cancelled() {
                debug!("Response stopped; not reporting completion");
                return;
            }
            this.actions
                .fire(AssistantEvent::Responded, EventPayload::default());
        });
    }

    /// Every spoken path goes through the speaker with `token`, so a stop that lands
    /// before playback begins still silences the reply.
    async fn run(&self, query: &str, token: &CancellationToken) -> VoiceResult<()> {
        if token.is_cancelled() {
            return Ok(());
        }
        let query = query.trim();
        if query.is_empty() {
            info!("🤷 Nothing recognized; asking again");
            self.speaker.speak_with(&self.pardon, token).await?;
            return Ok(());
        }
        if self.is_stop_word(query) {
            info!("🤫 Stop word: {}", query);
            return Ok(());
        }

        let reply = tokio::select! {
            reply = self.agent.respond(query) => reply?,
            _ = token.cancelled() => return Ok(()),
        };
        if token.is_cancelled() {
            return Ok(());
        }
        let outcome = match reply {
            AgentReply::Text(text) => self.speaker.speak_with(&text, token).await?,
            AgentReply::Stream(tokens) => self.speaker.speak_stream_with(tokens, token).await?.1,
        };
        if outcome == EndOutcome::TimedOut {
            warn!("Reply playback did not finish in time");
        }
        Ok(())
    }

    /// Stop the reply in progress. It will not fire `Responded`.
    pub fn stop(&self) {
        let current = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(token) = current {
            token.cancel();
        }
        self.agent.interrupt();
        self.speaker.interrupt();
    }
}

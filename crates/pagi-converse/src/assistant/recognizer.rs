//! Collects the user's query between wake phrase and end of speech.
//!
//! Listening keeps interim results (for the silence heuristic and the UI) and final
//! results (the query). A ticker ends listening after a run of quiet ticks, or after a
//! hard cap. Recognizing then waits for the last final result, bounded by a timeout.

use super::detector::after_keyword;
use super::{Actions, AssistantEvent, EventPayload};
use crate::config::RecognizerSettings;
use crate::notify::{notify_quietly, Notification, NotificationSink};
use crate::text::strip_leading_punctuation;
use crate::timeout::TimeoutMonitor;
use crate::transcription::TranscriptEvent;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// TimeoutMonitor key of the recognize-phase deadline.
pub const RECOGNIZE_TIMEOUT_KEY: &str = "recognize";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Idle,
    Listening,
    Recognizing,
}

#[derive(Debug, Default)]
struct RecognizerState {
    phase: Phase,
    /// Bumped on every phase change; stale tickers and timers compare against it.
    round: u64,
    partials: Vec<String>,
    query: Vec<String>,
    /// An interim result arrived after the last final one.
    partial_pending: bool,
    /// The wake phrase was already stripped (or there was none).
    keyword_cleared: bool,
    manual_at: Option<Instant>,
    /// Generation of this round's recognize deadline.
    deadline: Option<u64>,
}

impl RecognizerState {
    fn heard(&self) -> usize {
        self.partials.len() + self.query.len()
    }
}

pub struct Recognizer {
    settings: RecognizerSettings,
    keywords: Vec<String>,
    actions: Actions,
    notifier: Arc<dyn NotificationSink>,
    timeouts: Arc<TimeoutMonitor>,
    state: Mutex<RecognizerState>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Recognizer {
    pub fn new(
        settings: RecognizerSettings,
        keywords: Vec<String>,
        actions: Actions,
        notifier: Arc<dyn NotificationSink>,
        timeouts: Arc<TimeoutMonitor>,
    ) -> Self {
        Self {
            settings,
            keywords,
            actions,
            notifier,
            timeouts,
            state: Mutex::new(RecognizerState::default()),
            ticker: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, RecognizerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn replace_ticker(&self, ticker: Option<JoinHandle<()>>) {
        let previous = std::mem::replace(
            &mut *self.ticker.lock().unwrap_or_else(|e| e.into_inner()),
            ticker,
        );
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Start listening. `payload.text` is what followed the wake phrase; `manual` marks a
    /// wake from the UI rather than by voice.
    pub fn listen(self: &Arc<Self>, payload: &EventPayload, manual: bool) {
        let round = {
            let mut state = self.state();
            let round = state.round + 1;
            *state = RecognizerState {
                phase: Phase::Listening,
                round,
                keyword_cleared: manual || payload.end,
                manual_at: manual.then(Instant::now),
                ..Default::default()
            };
            round
        };
        self.timeouts.pop(RECOGNIZE_TIMEOUT_KEY);
        info!("🎙️ Listening{}", if manual { " (manual)" } else { "" });

        if let Some(text) = payload.text.as_deref().filter(|t| !t.trim().is_empty()) {
            self.accept(text.trim().to_string(), payload.end);
        }

        let this = Arc::clone(self);
        self.replace_ticker(Some(tokio::spawn(async move {
            this.watch_listening(round).await
        })));
    }

    /// Listening is over; wait for the final text.
    pub fn recognize(self: &Arc<Self>) {
        self.replace_ticker(None);
        let (round, settled) = {
            let mut state = self.state();
            state.round += 1;
            state.phase = Phase::Recognizing;
            (state.round, !state.partial_pending && !state.query.is_empty())
        };

        if settled {
            debug!("Query already final; recognizing immediately");
            self.finish(round);
            return;
        }

        let this = Arc::clone(self);
        let generation = self.timeouts.put(
            RECOGNIZE_TIMEOUT_KEY,
            self.settings.recognize_timeout(),
            move || {
                debug!("Recognize timed out; using what was heard");
                this.finish(round);
            },
        );
        let mut state = self.state();
        if state.round == round {
            state.deadline = Some(generation);
        }
    }

    /// Abandon the current query.
    pub fn stop(&self) {
        self.replace_ticker(None);
        self.timeouts.pop(RECOGNIZE_TIMEOUT_KEY);
        let mut state = self.state();
        state.round += 1;
        state.phase = Phase::Idle;
    }

    pub fn is_listening(&self) -> bool {
        self.state().phase == Phase::Listening
    }

    /// Feed a transcript event. Ignored unless listening or recognizing.
    pub fn on_transcript(&self, event: &TranscriptEvent) {
        let mut text = strip_leading_punctuation(event.text.trim()).to_string();
        if text.is_empty() {
            return;
        }
        {
            let mut state = self.state();
            if state.phase == Phase::Idle {
                return;
            }
            if event.is_final && !state.keyword_cleared {
                state.keyword_cleared = true;
                text = after_keyword(&text, &self.keywords).unwrap_or(text);
            }
        }
        if !text.is_empty() {
            self.accept(text, event.is_final);
        }
    }

    fn accept(&self, text: String, is_final: bool) {
        let finish_round = {
            let mut state = self.state();
            if is_final {
                if let Some(at) = state.manual_at.take() {
                    if at.elapsed() < self.settings.interrupt_window() {
                        debug!("Ignoring final text from before the manual wake: {}", text);
                        return;
                    }
                }
                state.query.push(text.clone());
                state.partial_pending = false;
            } else {
                state.partials.push(text.clone());
                state.partial_pending = true;
            }
            (is_final && state.phase == Phase::Recognizing).then_some(state.round)
        };

        let notification = if is_final {
            Notification::TranscriptFinal { text }
        } else {
            Notification::TranscriptPartial { text }
        };
        notify_quietly(self.notifier.as_ref(), notification);

        if let Some(round) = finish_round {
            self.finish(round);
        }
    }

    /// Fire `Recognized` with the collected query, once per round.
    fn finish(&self, round: u64) {
        let (query, deadline) = {
            let mut state = self.state();
            if state.round != round || state.phase != Phase::Recognizing {
                return;
            }
            state.phase = Phase::Idle;
            (state.query.concat(), state.deadline.take())
        };
        if let Some(generation) = deadline {
            self.timeouts.pop_generation(RECOGNIZE_TIMEOUT_KEY, generation);
        }
        info!("📝 Recognized: {:?}", query);
        self.actions
            .fire(AssistantEvent::Recognized, EventPayload::query(query));
    }

    async fn watch_listening(self: Arc<Self>, round: u64) {
        let mut interval = tokio::time::interval(self.settings.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        let mut ticks = 0u32;
        let mut quiet = 0u32;
        let mut last_heard = 0usize;
        loop {
            interval.tick().await;
            ticks += 1;
            let heard = {
                let state = self.state();
                if state.round != round || state.phase != Phase::Listening {
                    return;
                }
                state.heard()
            };
            if ticks >= self.settings.max_listen_ticks {
                debug!("Listening cap reached after {} ticks", ticks);
                break;
            }
            if heard == 0 {
                continue;
            }
            if heard <= last_heard {
                quiet += 1;
            } else {
                quiet = 0;
            }
            last_heard = heard;
            if quiet >= self.settings.silence_ticks {
                debug!("{} quiet ticks; done listening", quiet);
                break;
            }
        }

        let still_listening = {
            let state = self.state();
            state.round == round && state.phase == Phase::Listening
        };
        if still_listening {
            self.actions.fire(AssistantEvent::Listened, EventPayload::default());
        }
    }
}

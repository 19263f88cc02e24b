//! **Speaker**: ordered synthesis and playback with interruption.
//!
//! A reply is cut into sentence-sized chunks. Each chunk is synthesized on a bounded
//! pool of blocking workers and lands in an [`OrderedQueue`] at its sequence index;
//! a single playback task drains the queue strictly in index order, so the listener
//! never hears that chunk 1 finished synthesizing before chunk 0.
//!
//! One utterance at a time: [`Speaker::begin_order`] waits (bounded) for the previous
//! session to drain. [`Speaker::interrupt`] cancels the session token, clears the
//! queue and stops the sink; in-flight synthesis calls finish but their audio is dropped.
//! A session that ends for any reason cancels its token, so its late chunks never
//! reach the queue of the next one.

use crate::audio::{AudioClip, AudioSink};
use crate::error::{VoiceError, VoiceResult};
use crate::notify::{notify_quietly, Notification, NotificationSink};
use crate::ordered_queue::OrderedQueue;
use crate::synthesis::{TtsBackend, VoiceCache};
use crate::text::{split_whole, StreamText};
use futures::{Stream, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Speaker settings
#[derive(Debug, Clone)]
pub struct SpeakerConfig {
    /// Concurrent synthesis calls (default: 3)
    pub max_workers: usize,

    /// Minimum chunk length for streamed replies (default: 4)
    pub min_chunk_chars: usize,

    /// How long `begin_order` waits for the previous utterance (default: 10s)
    pub begin_timeout: Duration,

    /// Bound used by `speak`/`speak_stream` when ending the order (default: 30s)
    pub end_timeout: Duration,

    /// Consult the voice cache for ordered chunks too, not only `speak_simple` (default: false)
    pub cache_ordered: bool,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            min_chunk_chars: 4,
            begin_timeout: Duration::from_secs(10),
            end_timeout: Duration::from_secs(30),
            cache_ordered: false,
        }
    }
}

/// How an ordered session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOutcome {
    /// No chunk was submitted.
    Empty,
    /// Every chunk was played (or skipped after a synthesis failure).
    Completed,
    Interrupted,
    /// Force-ended after the timeout.
    TimedOut,
}

/// Handle on the active ordered session, returned by [`Speaker::begin_order`].
#[derive(Debug)]
pub struct OrderTicket {
    id: u64,
    token: CancellationToken,
}

impl OrderTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// One queue entry. `clip: None` marks a chunk whose synthesis failed.
struct Segment {
    session: u64,
    clip: Option<AudioClip>,
}

#[derive(Debug, Default)]
struct OrderSession {
    id: u64,
    total_submitted: usize,
    completed: usize,
    active: bool,
    /// "Speaking started" was sent (on the first chunk).
    announced: bool,
    token: CancellationToken,
}

struct Shared {
    tts: Arc<dyn TtsBackend>,
    sink: Arc<dyn AudioSink>,
    notifier: Arc<dyn NotificationSink>,
    cache: Option<VoiceCache>,
    config: SpeakerConfig,
    queue: OrderedQueue<Segment>,
    /// Counters; guarded separately from the queue.
    session: Mutex<OrderSession>,
    session_changed: Notify,
    /// Interrupt token for whoever is beginning or running an order.
    interrupt: Mutex<CancellationToken>,
    workers: Arc<Semaphore>,
    next_session: AtomicU64,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, OrderSession> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install the interrupt token for a new order. With a `parent`, cancelling the
    /// parent (even before this call) also interrupts the order.
    fn fresh_interrupt(&self, parent: Option<&CancellationToken>) -> CancellationToken {
        let token = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
        *self.interrupt.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();
        token
    }

    fn is_current(&self, session: u64) -> bool {
        let s = self.session();
        s.id == session && s.active && !s.token.is_cancelled()
    }

    /// Queue a synthesized chunk unless its session is over. Checked under the session
    /// lock so a chunk can never land in the queue of the session that follows.
    fn put_segment(&self, index: usize, segment: Segment, token: &CancellationToken) -> bool {
        let s = self.session();
        if s.id != segment.session || !s.active || token.is_cancelled() {
            return false;
        }
        self.queue.put(index, segment);
        true
    }

    fn complete_chunk(&self, session: u64) {
        {
            let mut s = self.session();
            if s.id == session {
                s.completed += 1;
            }
        }
        self.session_changed.notify_waiters();
    }

    /// Blocking: cache lookup, synthesis, cache store.
    fn synthesize(&self, text: &str, use_cache: bool) -> VoiceResult<AudioClip> {
        let cache = self.cache.as_ref().filter(|_| use_cache);
        if let Some(clip) = cache.and_then(|c| c.get(text)) {
            return Ok(clip);
        }
        let clip = self.tts.synthesize(text)?;
        if let Some(cache) = cache {
            if let Err(e) = cache.put(&clip) {
                warn!("Voice cache write failed: {}", e);
            }
        }
        Ok(clip)
    }
}

/// Ordered speech output for one assistant.
pub struct Speaker {
    shared: Arc<Shared>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl Speaker {
    pub fn new(
        tts: Arc<dyn TtsBackend>,
        sink: Arc<dyn AudioSink>,
        notifier: Arc<dyn NotificationSink>,
        config: SpeakerConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            shared: Arc::new(Shared {
                tts,
                sink,
                notifier,
                cache: None,
                config,
                queue: OrderedQueue::new(),
                session: Mutex::new(OrderSession::default()),
                session_changed: Notify::new(),
                interrupt: Mutex::new(CancellationToken::new()),
                workers,
                next_session: AtomicU64::new(0),
            }),
            consumer: Mutex::new(None),
        }
    }

    /// Use `cache` for repeated phrases. Call before [`Speaker::start`].
    pub fn with_cache(mut self, cache: VoiceCache) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.cache = Some(cache);
        } else {
            warn!("Speaker already started; voice cache ignored");
        }
        self
    }

    pub fn config(&self) -> &SpeakerConfig {
        &self.shared.config
    }

    /// Spawn the playback task. Calling it again is a no-op.
    pub fn start(&self) {
        let mut consumer = self.consumer.lock().unwrap_or_else(|e| e.into_inner());
        if consumer.is_none() {
            info!(
                "🔊 Speaker started ({} synthesis workers)",
                self.shared.config.max_workers
            );
            *consumer = Some(tokio::spawn(play_in_order(Arc::clone(&self.shared))));
        }
    }

    /// Interrupt whatever is playing and stop the playback task.
    pub fn shutdown(&self) {
        self.interrupt();
        if let Some(consumer) = self
            .consumer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            consumer.abort();
        }
    }

    /// Open an ordered session.
    ///
    /// Clears any earlier interrupt, then waits for the previous session to end. Gives
    /// up with [`VoiceError::SpeakerBusy`] after `begin_timeout` or if interrupted while
    /// waiting.
    pub async fn begin_order(&self) -> VoiceResult<OrderTicket> {
        self.begin_order_linked(None).await
    }

    /// [`begin_order`](Self::begin_order) tied to `cancel`: cancelling it interrupts
    /// the order, and an already cancelled `cancel` fails at once.
    pub async fn begin_order_with(&self, cancel: &CancellationToken) -> VoiceResult<OrderTicket> {
        self.begin_order_linked(Some(cancel)).await
    }

    async fn begin_order_linked(
        &self,
        parent: Option<&CancellationToken>,
    ) -> VoiceResult<OrderTicket> {
        let shared = &self.shared;
        let token = shared.fresh_interrupt(parent);
        if token.is_cancelled() {
            return Err(VoiceError::SpeakerBusy("cancelled before the order began".to_string()));
        }
        let deadline = Instant::now() + shared.config.begin_timeout;

        let id = loop {
            let notified = shared.session_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut session = shared.session();
                if !session.active {
                    let id = shared.next_session.fetch_add(1, Ordering::SeqCst) + 1;
                    *session = OrderSession {
                        id,
                        active: true,
                        token: token.clone(),
                        ..Default::default()
                    };
                    break id;
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = token.cancelled() => {
                    return Err(VoiceError::SpeakerBusy("interrupted while waiting".to_string()));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(VoiceError::SpeakerBusy(format!(
                        "previous utterance still active after {:?}",
                        shared.config.begin_timeout
                    )));
                }
            }
        };

        shared.queue.clear();
        debug!("🗣️ Order session {} begins", id);
        Ok(OrderTicket { id, token })
    }

    /// Submit the next chunk of the session. Returns `false` if it was not dispatched
    /// (blank text, interrupted, or the session is no longer active).
    pub fn speak_in_order(&self, ticket: &OrderTicket, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() || ticket.token.is_cancelled() {
            return false;
        }

        let (index, announce) = {
            let mut session = self.shared.session();
            if session.id != ticket.id || !session.active {
                return false;
            }
            let index = session.total_submitted;
            session.total_submitted += 1;
            let announce = !session.announced;
            session.announced = true;
            (index, announce)
        };
        if announce {
            notify_quietly(self.shared.notifier.as_ref(), Notification::SpeakingStarted);
        }

        debug!("🧩 Chunk {} of session {}: {}", index, ticket.id, text);
        tokio::spawn(synthesize_chunk(
            Arc::clone(&self.shared),
            ticket.id,
            index,
            text.to_string(),
            ticket.token.clone(),
        ));
        true
    }

    /// Wait (bounded by `timeout`) for every submitted chunk to play, then close the session.
    pub async fn end_order(&self, ticket: OrderTicket, timeout: Duration) -> EndOutcome {
        let shared = &self.shared;
        let deadline = Instant::now() + timeout;

        let outcome = loop {
            let notified = shared.session_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let session = shared.session();
                if session.id != ticket.id || !session.active {
                    ticket.token.cancel();
                    return EndOutcome::Completed;
                }
                if session.total_submitted == 0 {
                    break EndOutcome::Empty;
                }
                if session.completed >= session.total_submitted {
                    break EndOutcome::Completed;
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = ticket.token.cancelled() => break EndOutcome::Interrupted,
                _ = tokio::time::sleep_until(deadline) => break EndOutcome::TimedOut,
            }
        };

        let announced = {
            let mut session = shared.session();
            session.active = false;
            session.announced
        };
        // Chunks still synthesizing for this session are dropped, not queued.
        ticket.token.cancel();
        if outcome == EndOutcome::TimedOut {
            shared.queue.clear();
            shared.sink.stop();
        }
        shared.session_changed.notify_waiters();

        match outcome {
            EndOutcome::TimedOut => warn!("⏱️ Order session {} force-ended after {:?}", ticket.id, timeout),
            EndOutcome::Interrupted => info!("⚡ Order session {} interrupted", ticket.id),
            _ => debug!("Order session {} ended: {:?}", ticket.id, outcome),
        }
        if announced {
            notify_quietly(shared.notifier.as_ref(), Notification::SpeakingEnded);
        }
        outcome
    }

    /// Stop speaking now: cancel pending synthesis, flush the queue, stop the sink.
    pub fn interrupt(&self) {
        let shared = &self.shared;
        shared
            .interrupt
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        let session_token = shared.session().token.clone();
        session_token.cancel();

        shared.queue.clear();
        shared.sink.stop();
        shared.session_changed.notify_waiters();
        info!("⚡ Speaker interrupted");
    }

    /// Speak a complete reply, split on sentence endings.
    pub async fn speak(&self, text: &str) -> VoiceResult<EndOutcome> {
        self.speak_linked(text, None).await
    }

    /// [`speak`](Self::speak), abandoned as soon as `cancel` is cancelled.
    pub async fn speak_with(&self, text: &str, cancel: &CancellationToken) -> VoiceResult<EndOutcome> {
        self.speak_linked(text, Some(cancel)).await
    }

    async fn speak_linked(
        &self,
        text: &str,
        cancel: Option<&CancellationToken>,
    ) -> VoiceResult<EndOutcome> {
        let lines = split_whole(text);
        if lines.is_empty() {
            return Ok(EndOutcome::Empty);
        }
        let ticket = self.begin_order_linked(cancel).await?;
        for line in &lines {
            if !self.speak_in_order(&ticket, line) {
                break;
            }
        }
        Ok(self.end_order(ticket, self.shared.config.end_timeout).await)
    }

    /// Speak a streamed reply as its sentences complete. Returns the full text received.
    pub async fn speak_stream<S>(&self, stream: S) -> VoiceResult<(String, EndOutcome)>
    where
        S: Stream<Item = String> + Send,
    {
        self.speak_stream_linked(stream, None).await
    }

    /// [`speak_stream`](Self::speak_stream), abandoned as soon as `cancel` is cancelled.
    pub async fn speak_stream_with<S>(
        &self,
        stream: S,
        cancel: &CancellationToken,
    ) -> VoiceResult<(String, EndOutcome)>
    where
        S: Stream<Item = String> + Send,
    {
        self.speak_stream_linked(stream, Some(cancel)).await
    }

    async fn speak_stream_linked<S>(
        &self,
        stream: S,
        cancel: Option<&CancellationToken>,
    ) -> VoiceResult<(String, EndOutcome)>
    where
        S: Stream<Item = String> + Send,
    {
        let ticket = self.begin_order_linked(cancel).await?;
        let mut splitter = StreamText::new(self.shared.config.min_chunk_chars);
        let mut full = String::new();

        tokio::pin!(stream);
        loop {
            let next = tokio::select! {
                token = stream.next() => token,
                _ = ticket.token.cancelled() => None,
            };
            let Some(token) = next else {
                break;
            };
            notify_quietly(
                self.shared.notifier.as_ref(),
                Notification::ResponseDelta {
                    text: token.clone(),
                },
            );
            full.push_str(&token);
            for line in splitter.push(&token) {
                self.speak_in_order(&ticket, &line);
            }
        }
        if let Some(rest) = splitter.finish() {
            self.speak_in_order(&ticket, &rest);
        }

        let outcome = self.end_order(ticket, self.shared.config.end_timeout).await;
        Ok((full, outcome))
    }

    /// One-shot utterance outside the chunk pipeline (greetings, prompts).
    /// Uses the voice cache when configured. Holds the session like any other order,
    /// so it never overlaps ordered playback and [`Speaker::interrupt`] stops it.
    pub async fn speak_simple(&self, text: &str) -> VoiceResult<()> {
        let text = text.trim().to_string();
        if text.is_empty() {
            return Ok(());
        }
        let ticket = self.begin_order().await?;
        self.shared.session().announced = true;
        notify_quietly(self.shared.notifier.as_ref(), Notification::SpeakingStarted);

        let shared = Arc::clone(&self.shared);
        let token = ticket.token.clone();
        let result = tokio::task::spawn_blocking(move || {
            let clip = shared.synthesize(&text, true)?;
            if token.is_cancelled() {
                return Ok(());
            }
            shared.sink.play(&clip)
        })
        .await
        .map_err(|e| VoiceError::Unknown(e.to_string()))
        .and_then(|r| r);
        self.end_order(ticket, Duration::ZERO).await;
        result
    }

    /// Whether an ordered session is open.
    pub fn is_speaking(&self) -> bool {
        self.shared.session().active
    }

    /// `(submitted, completed)` of the current session.
    pub fn progress(&self) -> (usize, usize) {
        let session = self.shared.session();
        (session.total_submitted, session.completed)
    }
}

impl Drop for Speaker {
    fn drop(&mut self) {
        if let Some(consumer) = self
            .consumer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            consumer.abort();
        }
    }
}

async fn synthesize_chunk(
    shared: Arc<Shared>,
    session: u64,
    index: usize,
    text: String,
    token: CancellationToken,
) {
    let permit = tokio::select! {
        permit = Arc::clone(&shared.workers).acquire_owned() => permit,
        _ = token.cancelled() => return,
    };
    let Ok(permit) = permit else {
        return;
    };
    if token.is_cancelled() {
        return;
    }

    let worker_shared = Arc::clone(&shared);
    let use_cache = shared.config.cache_ordered;
    let result = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        worker_shared.synthesize(&text, use_cache)
    })
    .await;

    let clip = match result {
        Ok(Ok(clip)) => Some(clip),
        Ok(Err(e)) => {
            warn!("Synthesis failed for chunk {}: {}", index, e);
            None
        }
        Err(e) => {
            error!("Synthesis worker crashed for chunk {}: {}", index, e);
            None
        }
    };
    if !shared.put_segment(index, Segment { session, clip }, &token) {
        debug!("Discarding chunk {} of finished session {}", index, session);
    }
}

async fn play_in_order(shared: Arc<Shared>) {
    loop {
        let Some(segment) = shared.queue.get().await else {
            continue;
        };
        if !shared.is_current(segment.session) {
            continue;
        }
        if let Some(clip) = segment.clip.filter(|c| !c.is_empty()) {
            let worker_shared = Arc::clone(&shared);
            let session = segment.session;
            let play = move || {
                // An interrupt may have landed while this task was being scheduled.
                if !worker_shared.is_current(session) {
                    return Ok(());
                }
                worker_shared.sink.play(&clip)
            };
            match tokio::task::spawn_blocking(play).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Playback failed: {}", e),
                Err(e) => error!("Playback worker crashed: {}", e),
            }
        }
        shared.complete_chunk(segment.session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct SlowTts {
        delays: HashMap<String, Duration>,
        calls: Mutex<Vec<String>>,
    }

    impl TtsBackend for SlowTts {
        fn synthesize(&self, text: &str) -> VoiceResult<AudioClip> {
            self.calls.lock().unwrap().push(text.to_string());
            if let Some(delay) = self.delays.get(text) {
                std::thread::sleep(*delay);
            }
            if text.contains("坏") {
                return Err(VoiceError::Synthesis("bad chunk".to_string()));
            }
            Ok(AudioClip::new(text, text.as_bytes().to_vec()))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        played: Mutex<Vec<String>>,
        stops: AtomicUsize,
        play_time: Duration,
    }

    impl AudioSink for RecordingSink {
        fn play(&self, clip: &AudioClip) -> VoiceResult<()> {
            let stops = self.stops.load(Ordering::SeqCst);
            let started = std::time::Instant::now();
            while started.elapsed() < self.play_time {
                if self.stops.load(Ordering::SeqCst) != stops {
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

    #[derive(Default)]
    struct Collector(Mutex<Vec<Notification>>);

    impl NotificationSink for Collector {
        fn notify(&self, notification: &Notification) -> VoiceResult<()> {
            self.0.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    struct Rig {
        speaker: Speaker,
        tts: Arc<SlowTts>,
        sink: Arc<RecordingSink>,
        notes: Arc<Collector>,
    }

    fn rig(delays: &[(&str, u64)], play_ms: u64, config: SpeakerConfig) -> Rig {
        let tts = Arc::new(SlowTts {
            delays: delays
                .iter()
                .map(|(t, ms)| (t.to_string(), Duration::from_millis(*ms)))
                .collect(),
            ..Default::default()
        });
        let sink = Arc::new(RecordingSink {
            play_time: Duration::from_millis(play_ms),
            ..Default::default()
        });
        let notes = Arc::new(Collector::default());
        let speaker = Speaker::new(tts.clone(), sink.clone(), notes.clone(), config);
        speaker.start();
        Rig {
            speaker,
            tts,
            sink,
            notes,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_chunks_play_in_submission_order() {
        let rig = rig(&[("一。", 120), ("二。", 10), ("三。", 60)], 5, SpeakerConfig::default());
        let ticket = rig.speaker.begin_order().await.unwrap();
        for chunk in ["一。", "二。", "三。"] {
            assert!(rig.speaker.speak_in_order(&ticket, chunk));
        }
        let outcome = rig.speaker.end_order(ticket, Duration::from_secs(5)).await;

        assert_eq!(outcome, EndOutcome::Completed);
        assert_eq!(*rig.sink.played.lock().unwrap(), vec!["一。", "二。", "三。"]);
        assert_eq!(
            *rig.notes.0.lock().unwrap(),
            vec![Notification::SpeakingStarted, Notification::SpeakingEnded]
        );
    }

    #[tokio::test]
    async fn test_empty_utterance_is_silent() {
        let rig = rig(&[], 0, SpeakerConfig::default());
        assert_eq!(rig.speaker.speak("  ").await.unwrap(), EndOutcome::Empty);

        let ticket = rig.speaker.begin_order().await.unwrap();
        assert!(!rig.speaker.speak_in_order(&ticket, "   "));
        assert_eq!(
            rig.speaker.end_order(ticket, Duration::from_secs(1)).await,
            EndOutcome::Empty
        );
        assert!(rig.notes.0.lock().unwrap().is_empty());
        assert!(!rig.speaker.is_speaking());
    }

    #[tokio::test]
    async fn test_second_begin_is_rejected_after_timeout() {
        let config = SpeakerConfig {
            begin_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let rig = rig(&[], 0, config);
        let first = rig.speaker.begin_order().await.unwrap();
        assert!(rig.speaker.is_speaking());

        let err = rig.speaker.begin_order().await.unwrap_err();
        assert!(matches!(err, VoiceError::SpeakerBusy(_)));
        // The first session is still the active one.
        assert!(rig.speaker.is_speaking());
        rig.speaker.end_order(first, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_second_begin_waits_for_first_to_end() {
        let rig = Arc::new(rig(&[], 0, SpeakerConfig::default()));
        let first = rig.speaker.begin_order().await.unwrap();

        let ender = {
            let rig = Arc::clone(&rig);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(80)).await;
                rig.speaker.end_order(first, Duration::from_secs(1)).await
            })
        };

        let started = std::time::Instant::now();
        let second = rig.speaker.begin_order().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(ender.await.unwrap(), EndOutcome::Empty);
        assert_ne!(second.id(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interrupt_releases_end_order() {
        let rig = Arc::new(rig(&[("很长的一句话。", 2_000)], 5, SpeakerConfig::default()));
        let ticket = rig.speaker.begin_order().await.unwrap();
        assert!(rig.speaker.speak_in_order(&ticket, "很长的一句话。"));

        let interrupter = {
            let rig = Arc::clone(&rig);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                rig.speaker.interrupt();
            })
        };

        let started = std::time::Instant::now();
        let outcome = rig.speaker.end_order(ticket, Duration::from_secs(10)).await;
        interrupter.await.unwrap();

        assert_eq!(outcome, EndOutcome::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!rig.speaker.is_speaking());
        assert!(rig
            .notes
            .0
            .lock()
            .unwrap()
            .contains(&Notification::SpeakingEnded));
    }

    #[tokio::test]
    async fn test_interrupt_before_first_chunk_dispatches_nothing() {
        let rig = rig(&[], 0, SpeakerConfig::default());
        let ticket = rig.speaker.begin_order().await.unwrap();
        rig.speaker.interrupt();

        assert!(!rig.speaker.speak_in_order(&ticket, "你好。"));
        assert!(ticket.is_interrupted());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rig.tts.calls.lock().unwrap().is_empty());
        rig.speaker.end_order(ticket, Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_chunk_is_skipped_not_awaited() {
        let rig = rig(&[], 0, SpeakerConfig::default());
        let outcome = rig.speaker.speak("第一句！坏掉的一句！最后一句").await.unwrap();

        assert_eq!(outcome, EndOutcome::Completed);
        assert_eq!(*rig.sink.played.lock().unwrap(), vec!["第一句", "最后一句"]);
        assert_eq!(rig.speaker.progress(), (3, 3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stream_reply_is_spoken_by_sentence() {
        let rig = rig(&[], 0, SpeakerConfig::default());
        let tokens = ["今天", "天气不错。", "我们去", "公园吧"].map(String::from);
        let (text, outcome) = rig
            .speaker
            .speak_stream(futures::stream::iter(tokens))
            .await
            .unwrap();

        assert_eq!(text, "今天天气不错。我们去公园吧");
        assert_eq!(outcome, EndOutcome::Completed);
        assert_eq!(
            *rig.sink.played.lock().unwrap(),
            vec!["今天天气不错。", "我们去公园吧"]
        );
    }

    #[tokio::test]
    async fn test_speak_simple_uses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let tts = Arc::new(SlowTts::default());
        let sink = Arc::new(RecordingSink::default());
        let speaker = Speaker::new(
            tts.clone(),
            sink.clone(),
            Arc::new(Collector::default()),
            SpeakerConfig::default(),
        )
        .with_cache(VoiceCache::open(dir.path()).unwrap());

        speaker.speak_simple("欢迎回来").await.unwrap();
        speaker.speak_simple("欢迎回来").await.unwrap();

        assert_eq!(tts.calls.lock().unwrap().len(), 1);
        assert_eq!(sink.played.lock().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interrupt_stops_simple_speech() {
        let rig = Arc::new(rig(&[], 300, SpeakerConfig::default()));
        let simple = {
            let rig = Arc::clone(&rig);
            tokio::spawn(async move { rig.speaker.speak_simple("一段很长的开场白").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rig.speaker.is_speaking());
        rig.speaker.interrupt();

        simple.await.unwrap().unwrap();
        assert!(rig.sink.played.lock().unwrap().is_empty());
        assert!(!rig.speaker.is_speaking());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_flushed_segment_is_never_played() {
        let rig = rig(&[], 0, SpeakerConfig::default());
        let ticket = rig.speaker.begin_order().await.unwrap();
        assert!(rig.speaker.speak_in_order(&ticket, "第一句。"));
        let outcome = rig.speaker.end_order(ticket, Duration::from_secs(1)).await;
        assert_eq!(outcome, EndOutcome::Completed);

        // A stale segment that slipped past the queue must not reach the sink.
        let shared = &rig.speaker.shared;
        shared.queue.put(
            shared.queue.cursor(),
            Segment {
                session: 1,
                clip: Some(AudioClip::new("过期", vec![1])),
            },
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*rig.sink.played.lock().unwrap(), vec!["第一句。"]);
    }
}

//! **TimeoutMonitor**: keyed, deadline-sorted one-shot timers on a single scheduler task.
//!
//! `put` replaces any timer with the same key, `pop` cancels it. Every `put` gets a fresh
//! generation, so a caller holding an old generation can only cancel the timer it
//! scheduled ([`TimeoutMonitor::pop_generation`]). The scheduler only ever
//! looks at the earliest deadline and is woken whenever the schedule changes, so a popped
//! or replaced deadline never fires. Expired handlers run on the blocking pool, never on
//! the scheduler task: a slow or panicking handler cannot stall later timers.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Work to run once a timer expires.
pub type TimeoutHandler = Box<dyn FnOnce() + Send + 'static>;

struct TimeoutEntry {
    key: String,
    generation: u64,
    deadline: Instant,
    handler: TimeoutHandler,
}

/// Entries sorted by deadline; keys are unique.
#[derive(Default)]
struct Schedule {
    entries: Vec<TimeoutEntry>,
    next_generation: u64,
}

impl Schedule {
    fn remove_generation(&mut self, key: &str, generation: u64) -> bool {
        match self
            .entries
            .iter()
            .position(|e| e.key == key && e.generation == generation)
        {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.iter().position(|e| e.key == key) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    fn insert(&mut self, entry: TimeoutEntry) {
        // Equal deadlines keep insertion order.
        let pos = self
            .entries
            .partition_point(|e| e.deadline <= entry.deadline);
        self.entries.insert(pos, entry);
    }

    /// Take the earliest entry if its deadline has passed.
    fn take_due(&mut self, now: Instant) -> Option<TimeoutEntry> {
        if self.entries.first()?.deadline <= now {
            Some(self.entries.remove(0))
        } else {
            None
        }
    }
}

/// Keyed timeout scheduler. Dropping it stops the scheduler task; pending timers are discarded.
pub struct TimeoutMonitor {
    schedule: Arc<Mutex<Schedule>>,
    changed: Arc<Notify>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutMonitor {
    /// Create the monitor and spawn its scheduler task on the current tokio runtime.
    pub fn spawn() -> Self {
        let schedule = Arc::new(Mutex::new(Schedule::default()));
        let changed = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run_scheduler(
            Arc::clone(&schedule),
            Arc::clone(&changed),
            shutdown.clone(),
        ));

        info!("⏲️ TimeoutMonitor started");
        Self {
            schedule,
            changed,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Run `handler` after `delay` unless `key` is popped or re-put first.
    /// Returns the generation of the new timer.
    pub fn put<F>(&self, key: impl Into<String>, delay: Duration, handler: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        let key = key.into();
        let deadline = Instant::now() + delay;
        let generation = {
            let mut schedule = lock(&self.schedule);
            if schedule.remove(&key) {
                debug!("⏲️ Timer '{}' rescheduled ({:?})", key, delay);
            }
            schedule.next_generation += 1;
            let generation = schedule.next_generation;
            schedule.insert(TimeoutEntry {
                key,
                generation,
                deadline,
                handler: Box::new(handler),
            });
            generation
        };
        self.changed.notify_one();
        generation
    }

    /// Cancel the timer for `key` only if it is still the one `put` returned
    /// `generation` for. A timer that was re-put since is left alone.
    pub fn pop_generation(&self, key: &str, generation: u64) -> bool {
        let removed = lock(&self.schedule).remove_generation(key, generation);
        if removed {
            debug!("⏲️ Timer '{}' (generation {}) cancelled", key, generation);
            self.changed.notify_one();
        }
        removed
    }

    /// Cancel the timer for `key`. Returns whether one was pending.
    pub fn pop(&self, key: &str) -> bool {
        let removed = lock(&self.schedule).remove(key);
        if removed {
            debug!("⏲️ Timer '{}' cancelled", key);
            self.changed.notify_one();
        }
        removed
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.schedule).entries.iter().any(|e| e.key == key)
    }

    pub fn len(&self) -> usize {
        lock(&self.schedule).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the scheduler task. Pending timers never fire.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        lock(&self.schedule).entries.clear();
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

impl Drop for TimeoutMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn lock(schedule: &Mutex<Schedule>) -> MutexGuard<'_, Schedule> {
    schedule.lock().unwrap_or_else(|e| e.into_inner())
}

async fn run_scheduler(
    schedule: Arc<Mutex<Schedule>>,
    changed: Arc<Notify>,
    shutdown: CancellationToken,
) {
    loop {
        let next_deadline = lock(&schedule).entries.first().map(|e| e.deadline);

        match next_deadline {
            None => {
                tokio::select! {
                    _ = changed.notified() => {}
                    _ = shutdown.cancelled() => break,
                }
            }
            Some(deadline) if deadline > Instant::now() => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = changed.notified() => {}
                    _ = shutdown.cancelled() => break,
                }
            }
            Some(_) => {
                // Re-check under the lock: the entry may have been popped meanwhile.
                let due = lock(&schedule).take_due(Instant::now());
                if let Some(entry) = due {
                    dispatch(entry);
                }
            }
        }
    }
    debug!("⏲️ TimeoutMonitor scheduler stopped");
}

fn dispatch(entry: TimeoutEntry) {
    let key = entry.key;
    debug!("⏲️ Timer '{}' (generation {}) expired", key, entry.generation);
    let worker = tokio::task::spawn_blocking(entry.handler);
    tokio::spawn(async move {
        if let Err(e) = worker.await {
            error!("Timeout handler '{}' failed: {}", key, e);
        }
    });
}

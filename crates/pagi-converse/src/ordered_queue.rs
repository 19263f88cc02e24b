//! Index-ordered queue with placeholder filling.
//!
//! Producers `put` results at the sequence index they were assigned, in any order.
//! The single consumer `get`s them strictly in index order: a slot that has been
//! reserved but not yet produced holds a placeholder, and `get` waits on it.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

enum Slot<T> {
    /// Reserved, not yet produced.
    Placeholder,
    Ready(T),
    /// Already handed to the consumer.
    Taken,
}

struct Inner<T> {
    slots: Vec<Slot<T>>,
    cursor: usize,
    /// Bumped by `clear()`; a waiting `get` that sees a new epoch returns `None`.
    epoch: u64,
}

impl<T> Inner<T> {
    fn take_at_cursor(&mut self) -> Option<T> {
        let slot = self.slots.get_mut(self.cursor)?;
        if !matches!(slot, Slot::Ready(_)) {
            return None;
        }
        self.cursor += 1;
        match std::mem::replace(slot, Slot::Taken) {
            Slot::Ready(item) => Some(item),
            _ => None,
        }
    }
}

/// Concurrent queue delivering items in index order regardless of arrival order.
pub struct OrderedQueue<T> {
    inner: Mutex<Inner<T>>,
    changed: Notify,
}

impl<T> Default for OrderedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OrderedQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                cursor: 0,
                epoch: 0,
            }),
            changed: Notify::new(),
        }
    }

    /// Store `item` at `index`.
    ///
    /// Beyond the tail the queue grows and intervening slots become placeholders;
    /// an existing slot is overwritten in place (late corrections never duplicate).
    pub fn put(&self, index: usize, item: T) {
        {
            let mut inner = self.lock();
            if index >= inner.slots.len() {
                inner.slots.resize_with(index + 1, || Slot::Placeholder);
            } else if index < inner.cursor {
                debug!("OrderedQueue: slot {} already consumed, replacing in place", index);
            }
            inner.slots[index] = Slot::Ready(item);
        }
        self.changed.notify_waiters();
    }

    /// Wait for the item at the read cursor, advance and return it.
    ///
    /// Returns `None` if the queue is cleared while waiting.
    pub async fn get(&self) -> Option<T> {
        let epoch = self.lock().epoch;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.epoch != epoch {
                    return None;
                }
                if let Some(item) = inner.take_at_cursor() {
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// [`get`](Self::get) bounded by `timeout`.
    pub async fn get_timeout(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.get()).await.ok().flatten()
    }

    /// Non-blocking: the item at the cursor if it is ready.
    pub fn try_get(&self) -> Option<T> {
        self.lock().take_at_cursor()
    }

    /// Non-blocking: skip placeholders at the cursor, then take the next ready item.
    ///
    /// Used once cancellation has made gaps permanent.
    pub fn get_if_nonnull(&self) -> Option<T> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        while inner
            .slots
            .get(inner.cursor)
            .is_some_and(|slot| !matches!(slot, Slot::Ready(_)))
        {
            inner.cursor += 1;
        }
        inner.take_at_cursor()
    }

    /// Drop everything, reset the cursor and wake blocked consumers with `None`.
    pub fn clear(&self) {
        {
            let mut inner = self.lock();
            inner.slots.clear();
            inner.cursor = 0;
            inner.epoch = inner.epoch.wrapping_add(1);
        }
        self.changed.notify_waiters();
    }

    /// Number of slots (consumed, ready or reserved).
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the next slot `get` will return.
    pub fn cursor(&self) -> usize {
        self.lock().cursor
    }

    /// Slots at or after the cursor that have not been delivered.
    pub fn pending(&self) -> usize {
        let inner = self.lock();
        inner.slots.len().saturating_sub(inner.cursor)
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn drain_in_order(order: &[usize]) -> Vec<usize> {
        let queue = Arc::new(OrderedQueue::new());
        for (delay, &index) in order.iter().enumerate() {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5 * delay as u64)).await;
                queue.put(index, index);
            });
        }

        let mut out = Vec::new();
        for _ in 0..order.len() {
            out.push(queue.get_timeout(Duration::from_secs(2)).await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_any_put_order_yields_index_order() {
        let expected: Vec<usize> = (0..5).collect();
        for order in [
            vec![0, 1, 2, 3, 4],
            vec![4, 3, 2, 1, 0],
            vec![3, 0, 4, 1, 2],
            vec![1, 0, 3, 2, 4],
        ] {
            assert_eq!(drain_in_order(&order).await, expected, "put order {:?}", order);
        }
    }

    #[tokio::test]
    async fn test_clear_resets_cursor() {
        let queue = OrderedQueue::new();
        queue.put(0, "a");
        queue.put(1, "b");
        assert_eq!(queue.get().await, Some("a"));

        queue.clear();
        assert_eq!(queue.cursor(), 0);
        assert!(queue.is_empty());

        queue.put(0, "x");
        assert_eq!(queue.get().await, Some("x"));
    }

    #[tokio::test]
    async fn test_clear_wakes_blocked_consumer() {
        let queue = Arc::new(OrderedQueue::<u32>::new());
        queue.put(1, 1); // slot 0 stays a placeholder

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.clear();

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_put_existing_index_replaces_in_place() {
        let queue = OrderedQueue::new();
        queue.put(2, "late");
        assert_eq!(queue.len(), 3);
        queue.put(0, "first");
        queue.put(0, "corrected");
        queue.put(1, "second");
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.get().await, Some("corrected"));
        assert_eq!(queue.get().await, Some("second"));
        assert_eq!(queue.get().await, Some("late"));
        assert_eq!(queue.try_get(), None);
    }

    #[test]
    fn test_get_if_nonnull_skips_placeholders() {
        let queue = OrderedQueue::new();
        queue.put(3, 'd');
        assert_eq!(queue.try_get(), None);
        assert_eq!(queue.get_if_nonnull(), Some('d'));
        assert_eq!(queue.cursor(), 4);
        assert_eq!(queue.pending(), 0);
    }
}

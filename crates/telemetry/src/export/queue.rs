//! Bounded hand-off queue between span sealing and the export dispatcher.
//!
//! Producers are synchronous (a span seals on whatever thread ended it) and
//! must never await exporter I/O. The consumer is the dispatcher thread,
//! which parks on a condvar until a batch is ready. What happens when the
//! queue is full is decided by the configured [`BackpressurePolicy`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use llmscope_config::BackpressurePolicy;
use tracing::{debug, warn};

use crate::TelemetryError;

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    /// Producers parked by the `block` policy.
    blocked: usize,
}

/// Fixed-capacity FIFO with a policy for overflow.
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    not_full: Condvar,
    ready: Condvar,
    capacity: usize,
    policy: BackpressurePolicy,
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                blocked: 0,
            }),
            not_full: Condvar::new(),
            ready: Condvar::new(),
            capacity,
            policy,
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Offer an item.
    ///
    /// With `block` this parks the calling thread until the consumer makes
    /// room or the queue closes; a parked producer wakes the consumer even
    /// if no full batch is queued. `fail_fast` reports a full queue as
    /// [`TelemetryError::QueueFull`]; the two drop policies succeed and
    /// count the discarded item.
    pub fn push(&self, item: T) -> Result<(), TelemetryError> {
        let mut state = self.lock();
        if state.closed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(TelemetryError::QueueClosed);
        }

        if state.items.len() >= self.capacity {
            match self.policy {
                BackpressurePolicy::DropOldest => {
                    state.items.pop_front();
                    self.record_drop();
                }
                BackpressurePolicy::DropNewest => {
                    self.record_drop();
                    return Ok(());
                }
                BackpressurePolicy::FailFast => {
                    self.record_drop();
                    return Err(TelemetryError::QueueFull {
                        capacity: self.capacity,
                    });
                }
                BackpressurePolicy::Block => {
                    state.blocked += 1;
                    self.ready.notify_all();
                    state = self
                        .not_full
                        .wait_while(state, |s| s.items.len() >= self.capacity && !s.closed)
                        .unwrap_or_else(PoisonError::into_inner);
                    state.blocked -= 1;
                    if state.closed {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return Err(TelemetryError::QueueClosed);
                    }
                }
            }
        }

        state.items.push_back(item);
        drop(state);
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.ready.notify_all();
        Ok(())
    }

    fn record_drop(&self) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        // Log the first drop and then every thousandth.
        if total == 1 || total % 1000 == 0 {
            warn!(
                dropped = total,
                capacity = self.capacity,
                policy = %self.policy,
                "Export queue full, dropping"
            );
        }
    }

    /// Take up to `max` items from the front.
    pub fn pop_batch(&self, max: usize) -> Vec<T> {
        let mut state = self.lock();
        let n = max.min(state.items.len());
        let batch: Vec<T> = state.items.drain(..n).collect();
        drop(state);
        if !batch.is_empty() {
            self.not_full.notify_all();
        }
        batch
    }

    /// Remove everything still queued.
    pub fn drain_all(&self) -> Vec<T> {
        let batch: Vec<T> = self.lock().items.drain(..).collect();
        self.not_full.notify_all();
        batch
    }

    /// Park until at least `min` items are queued, a producer is blocked on
    /// a full queue, the queue is closed, or `timeout` passes.
    pub fn wait_for_items(&self, min: usize, timeout: Duration) {
        let state = self.lock();
        let _ = self
            .ready
            .wait_timeout_while(state, timeout, |s| {
                let stalled = s.blocked > 0 && !s.items.is_empty();
                s.items.len() < min && !stalled && !s.closed
            })
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Producers currently parked by the `block` policy.
    pub fn blocked_producers(&self) -> usize {
        self.lock().blocked
    }

    /// Stop accepting items and wake every waiter.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        debug!("Export queue closed");
        self.not_full.notify_all();
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items accepted so far.
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Items discarded by the overflow policy or refused after close.
    /// Only ever increases.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn drop_oldest_keeps_newest_items() {
        let queue = BoundedQueue::new(3, BackpressurePolicy::DropOldest);
        for item in ["A", "B", "C", "D"] {
            queue.push(item).unwrap();
        }
        assert_eq!(queue.pop_batch(10), vec!["B", "C", "D"]);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.enqueued(), 4);
    }

    #[test]
    fn drop_newest_keeps_oldest_items() {
        let queue = BoundedQueue::new(3, BackpressurePolicy::DropNewest);
        for item in ["A", "B", "C", "D"] {
            queue.push(item).unwrap();
        }
        assert_eq!(queue.pop_batch(10), vec!["A", "B", "C"]);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn fail_fast_reports_full() {
        let queue = BoundedQueue::new(2, BackpressurePolicy::FailFast);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        let err = queue.push(3).unwrap_err();
        assert!(matches!(err, TelemetryError::QueueFull { capacity: 2 }));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn block_waits_for_room() {
        let queue = Arc::new(BoundedQueue::new(1, BackpressurePolicy::Block));
        queue.push(1).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.push(2))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.pop_batch(1), vec![1]);

        producer.join().unwrap().unwrap();
        assert_eq!(queue.pop_batch(1), vec![2]);
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn close_releases_blocked_producer() {
        let queue = Arc::new(BoundedQueue::new(1, BackpressurePolicy::Block));
        queue.push(1).unwrap();
        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.push(2))
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.close();

        let result = producer.join().unwrap();
        assert!(matches!(result, Err(TelemetryError::QueueClosed)));
        assert!(matches!(queue.push(3), Err(TelemetryError::QueueClosed)));
        assert_eq!(queue.drain_all(), vec![1]);
    }

    #[test]
    fn pop_batch_respects_max() {
        let queue = BoundedQueue::new(10, BackpressurePolicy::DropOldest);
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.pop_batch(2), vec![0, 1]);
        assert_eq!(queue.len(), 3);
        assert!(queue.pop_batch(0).is_empty());
    }

    #[test]
    fn consumer_waits_for_a_full_batch() {
        let queue = Arc::new(BoundedQueue::new(8, BackpressurePolicy::DropOldest));
        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                queue.wait_for_items(2, Duration::from_secs(30));
                queue.pop_batch(2)
            })
        };
        queue.push("a").unwrap();
        queue.push("b").unwrap();
        assert_eq!(consumer.join().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn consumer_wait_times_out_with_partial_batch() {
        let queue = BoundedQueue::new(8, BackpressurePolicy::DropOldest);
        queue.push("a").unwrap();
        queue.wait_for_items(4, Duration::from_millis(10));
        assert_eq!(queue.pop_batch(4), vec!["a"]);
    }

    #[test]
    fn blocked_producer_wakes_consumer_before_a_full_batch() {
        let queue = Arc::new(BoundedQueue::new(1, BackpressurePolicy::Block));
        queue.push(1).unwrap();
        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.push(2))
        };

        // Batch size 4 can never be reached with capacity 1; only the parked
        // producer can end this wait before the timeout.
        queue.wait_for_items(4, Duration::from_secs(30));
        assert_eq!(queue.blocked_producers(), 1);
        assert_eq!(queue.pop_batch(4), vec![1]);

        producer.join().unwrap().unwrap();
        assert_eq!(queue.pop_batch(4), vec![2]);
        assert_eq!(queue.blocked_producers(), 0);
    }
}

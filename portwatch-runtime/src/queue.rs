//! Bounded drop-oldest queue used for every inter-component handoff in the
//! worker pipeline (frame -> media publisher, latest-frame slot -> inference,
//! detections -> API). Spec.md §5: "On `put` to a full queue, the producer
//! atomically `get`s one oldest element and then `put`s the new one. This
//! never blocks the producer and guarantees the consumer always receives
//! progressively newer data."

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A fixed-capacity FIFO that evicts its oldest entry rather than blocking
/// or rejecting on overflow. `put` never blocks; `get` suspends until an
/// entry is available.
///
/// The terminal sentinel (`BusMessage::Terminal` at the call sites that use
/// this queue for bus messages) is just another value of `T` — it traverses
/// the queue via the same eviction rule as any other item, so a consumer
/// blocked in `get` is guaranteed to observe it even under backpressure.
pub struct DropOldestQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "DropOldestQueue capacity must be positive");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Never blocks. Evicts the oldest entry first if the queue is full.
    pub fn put(&self, item: T) {
        {
            let mut guard = self.inner.lock();
            if guard.len() >= self.capacity {
                guard.pop_front();
            }
            guard.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Suspends until an item is available, then returns the oldest one.
    pub async fn get(&self) -> T {
        loop {
            if let Some(item) = self.try_get() {
                return item;
            }
            // Register for notification before re-checking, so a put() that
            // races with the check above is never missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            if let Some(item) = self.try_get() {
                return item;
            }
            notified.await;
        }
    }

    /// Non-blocking variant used by loops that must also watch a stop
    /// signal or other wakeups alongside the queue.
    pub fn try_get(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Convenience alias for the shared-ownership form every worker component
/// actually holds.
pub type SharedQueue<T> = Arc<DropOldestQueue<T>>;

//! Unbounded priority queue with async, cancellable pops.
//!
//! Higher [`Priority`] pops first; within a tier entries pop oldest first,
//! though callers must not rely on that.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crawldex_core::models::Priority;

struct Entry<T> {
    priority: Priority,
    seq: u64,
    value: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Outcome of [`PriorityQueue::pop`].
pub enum Pop<T> {
    Item(T),
    Timeout,
    Cancelled,
}

pub struct PriorityQueue<T> {
    heap: Mutex<BinaryHeap<Entry<T>>>,
    notify: Notify,
    seq: AtomicU64,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }
}

impl<T> PriorityQueue<T> {
    pub fn push(&self, priority: Priority, value: T) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap.lock().unwrap().push(Entry {
            priority,
            seq,
            value,
        });
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<T> {
        self.heap.lock().unwrap().pop().map(|e| e.value)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits up to `timeout` for an entry. Returns early on cancellation.
    pub async fn pop(&self, cancel: &CancellationToken, timeout: Duration) -> Pop<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                return Pop::Cancelled;
            }
            // Register interest before checking, so a push between the
            // check and the await is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_pop() {
                return Pop::Item(value);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Pop::Cancelled,
                _ = &mut notified => continue,
                _ = tokio::time::sleep_until(deadline) => return Pop::Timeout,
            }
        }
    }
}

//! Per-key coalescing, single-flight work queue.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::cluster::PolicyKey;

#[derive(Default)]
struct QueueState {
    order: VecDeque<PolicyKey>,
    /// Keys with a pending work item (queued, or awaiting re-queue).
    dirty: HashSet<PolicyKey>,
    /// Keys currently owned by a worker.
    processing: HashSet<PolicyKey>,
    shutting_down: bool,
}

/// Multiple adds for a key before it is dequeued collapse into one item; a
/// key being processed is never handed to a second worker, and an add that
/// lands during processing re-queues the key once the worker calls
/// [`WorkQueue::done`].
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, key: PolicyKey) {
        let mut s = self.lock();
        if s.shutting_down || s.dirty.contains(&key) {
            return;
        }
        s.dirty.insert(key.clone());
        if s.processing.contains(&key) {
            return;
        }
        s.order.push_back(key);
        drop(s);
        self.notify.notify_one();
    }

    /// Wait for the next key. Returns None once the queue is shut down and
    /// drained of ready items.
    pub async fn next(&self) -> Option<PolicyKey> {
        loop {
            let notified = self.notify.notified();
            {
                let mut s = self.lock();
                if let Some(key) = s.order.pop_front() {
                    s.dirty.remove(&key);
                    s.processing.insert(key.clone());
                    return Some(key);
                }
                if s.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release ownership of a key; re-queues it if notifications arrived
    /// while it was being processed.
    pub fn done(&self, key: &PolicyKey) {
        let mut s = self.lock();
        s.processing.remove(key);
        if s.dirty.contains(key) && !s.shutting_down {
            s.order.push_back(key.clone());
            drop(s);
            self.notify.notify_one();
        }
    }

    /// Stop accepting new items and wake all waiting workers. Already-queued
    /// items still drain so in-flight state settles cleanly.
    pub fn shut_down(&self) {
        let mut s = self.lock();
        s.shutting_down = true;
        drop(s);
        self.notify.notify_waiters();
    }

    pub fn ready_len(&self) -> usize {
        self.lock().order.len()
    }
}

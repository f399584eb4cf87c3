//! Work queue with dirty/processing bookkeeping

use super::{RateLimiter, RateLimiterConfig};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct QueueState {
    /// Keys ready to hand out, in FIFO order
    queue: VecDeque<String>,
    /// Keys that need processing (queued or deferred behind an in-flight run)
    dirty: HashSet<String>,
    /// Keys currently held by a worker
    processing: HashSet<String>,
    /// Earliest pending delayed re-add per key
    waiting: HashMap<String, Instant>,
    shutting_down: bool,
}

struct QueueInner {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
    limiter: RateLimiter,
}

/// Snapshot of queue occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Keys waiting for a worker
    pub queued: usize,
    /// Keys held by a worker
    pub processing: usize,
    /// Keys re-added while processing, awaiting `done`
    pub deferred: usize,
    /// Keys with a delayed re-add pending
    pub waiting: usize,
}

/// Deduplicating, rate-limited queue of reconcile keys
///
/// Cloning is cheap; clones share the same underlying queue.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<QueueInner>,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>, limiter: RateLimiterConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                limiter: RateLimiter::new(limiter),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Mark `key` dirty.
    ///
    /// A key already waiting is not queued twice; a key currently being
    /// processed is deferred until its worker calls [`WorkQueue::done`].
    pub async fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.inner.state.lock().await;

        if state.shutting_down {
            return;
        }
        if !state.dirty.insert(key.clone()) {
            trace!(queue = %self.inner.name, key = %key, "Key already dirty, coalescing");
            return;
        }
        if state.processing.contains(&key) {
            debug!(queue = %self.inner.name, key = %key, "Key in flight, deferring");
            return;
        }

        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Wait for the next dirty key and mark it as processing.
    ///
    /// Returns `None` once the queue has been shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register interest before inspecting state so no wakeup is lost
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock().await;
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Finish processing `key`; a deferred re-add becomes eligible immediately
    pub async fn done(&self, key: &str) {
        let mut state = self.inner.state.lock().await;
        state.processing.remove(key);

        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Clear backoff history for `key` after a successful sync
    pub fn forget(&self, key: &str) {
        self.inner.limiter.forget(key);
    }

    /// Re-add `key` after its next backoff delay; returns the delay used
    pub async fn add_rate_limited(&self, key: &str) -> Duration {
        let delay = self.inner.limiter.when(key);
        self.add_after(key.to_string(), delay).await;
        delay
    }

    /// Re-add `key` once `delay` has elapsed.
    ///
    /// Only the earliest pending ready time per key is kept; a later request
    /// for a key that is already waiting is absorbed by the earlier one.
    pub async fn add_after(&self, key: String, delay: Duration) {
        if delay.is_zero() {
            self.add(key).await;
            return;
        }

        let ready_at = Instant::now() + delay;
        {
            let mut state = self.inner.state.lock().await;
            if state.shutting_down {
                return;
            }
            let pending = state.waiting.get(&key).copied();
            if pending.is_some_and(|existing| existing <= ready_at) {
                trace!(
                    queue = %self.inner.name,
                    key = %key,
                    "Delayed add already pending, coalescing"
                );
                return;
            }
            state.waiting.insert(key.clone(), ready_at);
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(ready_at).await;
            queue.fire_waiting(key, ready_at).await;
        });
    }

    /// Timer expiry: re-add `key` unless an earlier timer superseded this one
    async fn fire_waiting(&self, key: String, ready_at: Instant) {
        {
            let mut state = self.inner.state.lock().await;
            if state.waiting.get(&key) != Some(&ready_at) {
                return;
            }
            state.waiting.remove(&key);
        }
        self.add(key).await;
    }

    /// Consecutive failures recorded for `key`
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.inner.limiter.num_requeues(key)
    }

    /// Stop handing out keys; blocked `get` calls return `None`
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        if state.shutting_down {
            return;
        }
        state.shutting_down = true;
        state.waiting.clear();
        drop(state);

        debug!(queue = %self.inner.name, "Work queue shutting down");
        self.inner.notify.notify_waiters();
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().await.shutting_down
    }

    /// Number of keys waiting for a worker
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock().await;
        let deferred = state
            .dirty
            .iter()
            .filter(|key| state.processing.contains(*key))
            .count();

        QueueStats {
            queued: state.queue.len(),
            processing: state.processing.len(),
            deferred,
            waiting: state.waiting.len(),
        }
    }
}

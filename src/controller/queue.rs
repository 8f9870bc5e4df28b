// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Deduplicating, rate-limited change queue
//!
//! Keys move through three sets:
//! - `dirty`: a notice is pending for the key (at most one per key)
//! - `queue`: dirty keys that are ready to be handed to a worker
//! - `processing`: keys a worker has taken and not yet released with `done`
//!
//! A key that is dirty while processing stays out of `queue` until `done`,
//! so one key is never handled by two workers at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::trace;

use super::notice::{ChangeNotice, ObjectKey};
use super::rate_limit::{RateLimiter, default_controller_rate_limiter};

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    dirty: HashMap<ObjectKey, ChangeNotice>,
    processing: HashSet<ObjectKey>,
    shutting_down: bool,
}

pub struct ChangeQueue {
    state: Mutex<QueueState>,
    limiter: Mutex<Box<dyn RateLimiter>>,
    ready: Notify,
}

impl ChangeQueue {
    /// Create a queue with the default controller rate limiter
    pub fn new() -> Self {
        Self::with_rate_limiter(Box::new(default_controller_rate_limiter()))
    }

    pub fn with_rate_limiter(limiter: Box<dyn RateLimiter>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            limiter: Mutex::new(limiter),
            ready: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn limiter(&self) -> MutexGuard<'_, Box<dyn RateLimiter>> {
        self.limiter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a notice, replacing any notice already pending for the same key
    pub fn add(&self, notice: ChangeNotice) {
        self.insert(notice, true);
    }

    fn insert(&self, notice: ChangeNotice, replace: bool) {
        let mut state = self.state();
        if state.shutting_down {
            return;
        }

        let key = notice.key.clone();
        if let Some(pending) = state.dirty.get_mut(&key) {
            if replace {
                trace!(key = %key, kind = %notice.kind, "Coalescing pending notice");
                *pending = notice;
            }
            return;
        }

        state.dirty.insert(key.clone(), notice);
        if state.processing.contains(&key) {
            // Held until the current worker calls done()
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.ready.notify_one();
    }

    /// Wait for the next ready notice
    ///
    /// Returns None once the queue is shutting down. The returned key is
    /// marked in flight until `done` is called for it.
    pub async fn get(&self) -> Option<ChangeNotice> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            // Register before checking state so a concurrent notify is not lost
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                while let Some(key) = state.queue.pop_front() {
                    if let Some(notice) = state.dirty.remove(&key) {
                        state.processing.insert(key);
                        return Some(notice);
                    }
                }
            }

            notified.await;
        }
    }

    /// Release the in-flight mark for `key`
    ///
    /// A notice added while the key was in flight becomes ready now.
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains_key(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.ready.notify_one();
        }
    }

    /// Clear the retry history for `key`
    pub fn forget(&self, key: &ObjectKey) {
        self.limiter().forget(key);
    }

    pub fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.limiter().num_requeues(key)
    }

    /// Re-add `notice` after the rate limiter's delay for its key
    ///
    /// If a newer notice for the key is pending when the delay expires,
    /// the newer one is kept.
    pub fn add_rate_limited(self: &Arc<Self>, notice: ChangeNotice) {
        let delay = self.limiter().when(&notice.key);
        trace!(key = %notice.key, delay_ms = delay.as_millis(), "Requeue scheduled");
        if delay.is_zero() {
            self.insert(notice, false);
            return;
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.insert(notice, false);
        });
    }

    /// Stop handing out items; pending and future `get`s return None
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.ready.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Number of ready keys (excludes keys held behind an in-flight worker)
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChangeQueue {
    fn default() -> Self {
        Self::new()
    }
}

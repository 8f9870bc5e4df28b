// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Per-subscription controller lifecycle
//!
//! Initializing → Syncing → Running → ShuttingDown → Stopped. A subscription
//! whose cache does not sync within `sync_timeout` goes straight to Stopped
//! and never starts its workers.

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use kube::api::DynamicObject;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::cache::{CacheSource, Source};
use super::classify::{Classification, FilterSets};
use super::dispatch::{Dispatch, Handler, dispatch};
use super::notice::{ChangeKind, ChangeNotice};
use super::queue::ChangeQueue;
use super::{StopSignal, Subscription};
use crate::report::ReportHandle;

/// Retries per key before a failing change is dropped
pub const MAX_RETRIES: u32 = 5;

/// Default bound on the initial cache sync
const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(120);

/// How often `has_synced` is polled while syncing
const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub sync_timeout: Duration,
    /// Concurrent drain loops per subscription
    pub workers: usize,
    pub max_retries: u32,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            workers: 1,
            max_retries: MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Initializing,
    Syncing,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControllerState::Initializing => "initializing",
            ControllerState::Syncing => "syncing",
            ControllerState::Running => "running",
            ControllerState::ShuttingDown => "shutting-down",
            ControllerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

enum SyncOutcome {
    Synced,
    Stopped,
    TimedOut,
}

/// Creation timestamp from object metadata
fn creation_time(obj: &DynamicObject) -> Option<DateTime<Utc>> {
    let ts = obj.metadata.creation_timestamp.as_ref()?;
    // Serialized form is RFC 3339 regardless of the underlying time crate
    let value = serde_json::to_value(ts).ok()?;
    DateTime::parse_from_rfc3339(value.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

pub struct SubscriptionController {
    subscription: Subscription,
    cache: Arc<CacheSource>,
    queue: Arc<ChangeQueue>,
    filters: Arc<FilterSets>,
    handler: Arc<dyn Handler>,
    reports: ReportHandle,
    options: ControllerOptions,
    started_at: DateTime<Utc>,
    state: Mutex<ControllerState>,
}

impl SubscriptionController {
    /// Wire a cache and queue for `subscription`
    ///
    /// The start timestamp is taken here; creates for objects older than it
    /// are not forwarded.
    pub fn new(
        subscription: Subscription,
        source: Arc<dyn Source>,
        filters: Arc<FilterSets>,
        handler: Arc<dyn Handler>,
        reports: ReportHandle,
        options: ControllerOptions,
    ) -> Self {
        let queue = Arc::new(ChangeQueue::new());
        let cache = Arc::new(CacheSource::new(
            subscription.resource_type(),
            &subscription.namespace,
            source,
            Arc::clone(&queue),
            reports.clone(),
        ));

        Self {
            subscription,
            cache,
            queue,
            filters,
            handler,
            reports,
            options,
            started_at: Utc::now(),
            state: Mutex::new(ControllerState::Initializing),
        }
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn state(&self) -> ControllerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ControllerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        debug!(subscription = %self.subscription, state = %state, "Controller state");
    }

    /// Run until `stop` fires
    ///
    /// Returns an error only when the initial sync times out.
    pub async fn run(self: Arc<Self>, mut stop: StopSignal) -> Result<()> {
        let resource = self.subscription.resource_type();
        let namespace = self.subscription.namespace_label().to_string();
        info!(resource = %resource, namespace = %namespace, "Starting controller");
        self.reports.starting(resource, &namespace);

        let cache_task = self.cache.start(stop.clone());

        self.set_state(ControllerState::Syncing);
        let sync_start = Instant::now();
        match self.wait_for_sync(&mut stop).await {
            SyncOutcome::Synced => {}
            SyncOutcome::Stopped => {
                self.set_state(ControllerState::ShuttingDown);
                self.queue.shut_down();
                let _ = cache_task.await;
                self.finish();
                return Ok(());
            }
            SyncOutcome::TimedOut => {
                let timeout_ms = self.options.sync_timeout.as_millis() as u64;
                debug!(
                    resource = %resource,
                    namespace = %namespace,
                    timeout_ms,
                    "Timed out waiting for caches to sync"
                );
                self.reports.sync_timed_out(resource, &namespace, timeout_ms);
                self.set_state(ControllerState::ShuttingDown);
                self.queue.shut_down();
                cache_task.abort();
                let _ = cache_task.await;
                self.finish();
                return Err(anyhow!(
                    "timed out waiting for {} cache to sync after {:?}",
                    self.subscription,
                    self.options.sync_timeout
                ));
            }
        }

        self.set_state(ControllerState::Running);
        let elapsed_ms = sync_start.elapsed().as_millis() as u64;
        info!(
            resource = %resource,
            namespace = %namespace,
            elapsed_ms,
            "Controller synced and ready"
        );
        self.reports.synced(resource, &namespace, elapsed_ms);

        let workers: Vec<JoinHandle<()>> = (0..self.options.workers.max(1))
            .map(|_| {
                let controller = Arc::clone(&self);
                tokio::spawn(async move { while controller.process_next_item().await {} })
            })
            .collect();

        stop.stopped().await;

        self.set_state(ControllerState::ShuttingDown);
        self.queue.shut_down();
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                warn!(subscription = %self.subscription, error = %e, "Worker ended abnormally");
            }
        }
        let _ = cache_task.await;
        self.finish();
        Ok(())
    }

    fn finish(&self) {
        self.set_state(ControllerState::Stopped);
        info!(subscription = %self.subscription, "Controller stopped");
        self.reports
            .stopped(self.subscription.resource_type(), self.subscription.namespace_label());
    }

    async fn wait_for_sync(&self, stop: &mut StopSignal) -> SyncOutcome {
        let poll = async {
            loop {
                if self.cache.has_synced() {
                    return true;
                }
                tokio::select! {
                    _ = stop.stopped() => return false,
                    _ = tokio::time::sleep(SYNC_POLL_INTERVAL) => {}
                }
            }
        };

        match tokio::time::timeout(self.options.sync_timeout, poll).await {
            Ok(true) => SyncOutcome::Synced,
            Ok(false) => SyncOutcome::Stopped,
            Err(_) => SyncOutcome::TimedOut,
        }
    }

    /// Take one notice, process it, apply the retry policy
    ///
    /// Returns false once the queue is shutting down.
    async fn process_next_item(&self) -> bool {
        let Some(notice) = self.queue.get().await else {
            return false;
        };

        let key = notice.key.clone();
        let result = self.process_item(&notice).await;
        self.handle_result(notice, result);
        self.queue.done(&key);
        true
    }

    fn handle_result(&self, notice: ChangeNotice, result: Result<()>) {
        let Err(e) = result else {
            self.queue.forget(&notice.key);
            return;
        };

        let requeues = self.queue.num_requeues(&notice.key);
        if requeues < self.options.max_retries {
            warn!(
                resource = %notice.resource_type,
                key = %notice.key,
                attempt = requeues + 1,
                error = %e,
                "Error processing change (will retry)"
            );
            self.queue.add_rate_limited(notice);
        } else {
            debug!(
                resource = %notice.resource_type,
                key = %notice.key,
                error = %e,
                "Error processing change (giving up)"
            );
            self.queue.forget(&notice.key);
            self.reports
                .retries_exhausted(&notice.resource_type, notice.key.as_str(), &e);
        }
    }

    /// Classify against the current cached state and dispatch
    async fn process_item(&self, notice: &ChangeNotice) -> Result<()> {
        let object = self.cache.get(&notice.key);
        let creation = object.as_deref().and_then(creation_time);

        let event = match notice.kind {
            ChangeKind::Create | ChangeKind::Update if object.is_none() => {
                bail!(
                    "{} {} not found in cache",
                    notice.resource_type,
                    notice.key
                );
            }
            _ => match self.filters.classify(notice, creation, self.started_at) {
                Classification::Forward(event) => event,
                Classification::Drop => {
                    trace!(key = %notice.key, kind = %notice.kind, "Dropped by filters");
                    return Ok(());
                }
            },
        };

        let change = match (notice.kind, object.as_deref()) {
            (ChangeKind::Create, Some(obj)) => Dispatch::Created(obj),
            (ChangeKind::Update, Some(obj)) => Dispatch::Updated(obj, &event),
            (ChangeKind::Delete, _) => Dispatch::Deleted(&event),
            (_, None) => bail!("{} {} not found in cache", notice.resource_type, notice.key),
        };

        dispatch(self.handler.as_ref(), change)
            .await
            .with_context(|| format!("{} handler failed for {}", notice.kind, notice.key))
    }
}

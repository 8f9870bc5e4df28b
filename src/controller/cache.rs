// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Local mirror of one remote collection
//!
//! The cache lists the collection once, then follows the watch stream.
//! Connectivity problems never escape this module: the task backs off,
//! relists and carries on until the stop signal fires.

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use kube::api::DynamicObject;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::StopSignal;
use super::notice::{ChangeKind, ChangeNotice, ObjectKey};
use super::queue::ChangeQueue;
use crate::report::ReportHandle;

/// Initial delay before reconnecting after a list or watch failure
const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(800);

/// Upper bound for the reconnect delay
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Result of a full list of the collection
#[derive(Debug, Default)]
pub struct Listing {
    pub items: Vec<DynamicObject>,
    /// Collection version the watch resumes from
    pub resource_version: Option<String>,
}

pub type WatchStream = BoxStream<'static, Result<(ChangeKind, DynamicObject)>>;

/// Lists and streams one remote collection
#[async_trait]
pub trait Source: Send + Sync {
    async fn list(&self) -> Result<Listing>;

    /// Stream changes after `resource_version` ("" or "0" for any version)
    async fn watch(&self, resource_version: &str) -> Result<WatchStream>;
}

/// Doubling delay with an upper bound
struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            next: RECONNECT_BASE_DELAY,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(RECONNECT_MAX_DELAY);
        delay
    }

    fn reset(&mut self) {
        self.next = RECONNECT_BASE_DELAY;
    }
}

pub struct CacheSource {
    resource_type: String,
    namespace: String,
    source: Arc<dyn Source>,
    queue: Arc<ChangeQueue>,
    reports: ReportHandle,
    store: RwLock<HashMap<ObjectKey, Arc<DynamicObject>>>,
    synced: AtomicBool,
}

impl CacheSource {
    pub fn new(
        resource_type: &str,
        namespace: &str,
        source: Arc<dyn Source>,
        queue: Arc<ChangeQueue>,
        reports: ReportHandle,
    ) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            namespace: namespace.to_string(),
            source,
            queue,
            reports,
            store: RwLock::new(HashMap::new()),
            synced: AtomicBool::new(false),
        }
    }

    /// Spawn the list/watch task; it runs until `stop` fires
    pub fn start(self: &Arc<Self>, mut stop: StopSignal) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = Backoff::new();
            loop {
                tokio::select! {
                    _ = stop.stopped() => break,
                    result = cache.list_and_watch(&mut backoff) => {
                        if let Err(e) = result {
                            warn!(
                                resource = %cache.resource_type,
                                namespace = %cache.namespace,
                                error = %e,
                                "Source error, reconnecting"
                            );
                        }
                    }
                }

                let delay = backoff.next_delay();
                debug!(
                    resource = %cache.resource_type,
                    delay_ms = delay.as_millis(),
                    "Backing off before relist"
                );
                tokio::select! {
                    _ = stop.stopped() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            debug!(resource = %cache.resource_type, namespace = %cache.namespace, "Cache stopped");
        })
    }

    /// True once the initial list has been applied to the mirror
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// Current mirrored state for `key`
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<DynamicObject>> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// List, then follow the watch until it fails
    ///
    /// Only returns on error. A watch stream that closes cleanly is resumed
    /// from the last seen resource version, after a backoff delay when it
    /// delivered no events.
    async fn list_and_watch(&self, backoff: &mut Backoff) -> Result<()> {
        let listing = self.source.list().await?;
        backoff.reset();

        let count = listing.items.len();
        let mut resource_version = listing.resource_version.clone().unwrap_or_default();
        self.replace(listing.items);

        if !self.synced.swap(true, Ordering::SeqCst) {
            info!(
                resource = %self.resource_type,
                namespace = %self.namespace,
                objects = count,
                "Initial list applied"
            );
        }

        loop {
            let mut stream = self.source.watch(&resource_version).await?;
            let mut received = 0usize;
            while let Some(item) = stream.next().await {
                let (kind, obj) = item?;
                received += 1;
                if let Some(rv) = obj.metadata.resource_version.as_ref() {
                    resource_version = rv.clone();
                }
                self.apply(kind, obj);
            }

            // An empty watch that closes at once must not turn into a hot loop
            if received == 0 {
                let delay = backoff.next_delay();
                debug!(
                    resource = %self.resource_type,
                    resource_version = %resource_version,
                    delay_ms = delay.as_millis(),
                    "Watch closed without events, backing off"
                );
                tokio::time::sleep(delay).await;
            } else {
                backoff.reset();
                trace!(
                    resource = %self.resource_type,
                    resource_version = %resource_version,
                    "Watch stream closed, resuming"
                );
            }
        }
    }

    /// Replace the mirror with a fresh listing, emitting the difference
    fn replace(&self, items: Vec<DynamicObject>) {
        let mut fresh = HashMap::with_capacity(items.len());
        for obj in items {
            match ObjectKey::from_object(&obj) {
                Some(key) => {
                    fresh.insert(key, Arc::new(obj));
                }
                None => self.malformed("listed object has no name"),
            }
        }

        let mut notices = Vec::new();
        {
            let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
            for (key, obj) in &fresh {
                let kind = match store.get(key) {
                    None => Some(ChangeKind::Create),
                    Some(old) if old.metadata.resource_version != obj.metadata.resource_version => {
                        Some(ChangeKind::Update)
                    }
                    Some(_) => None,
                };
                if let Some(kind) = kind {
                    notices.push(self.notice(kind, key.clone(), obj));
                }
            }
            for (key, old) in store.iter() {
                if !fresh.contains_key(key) {
                    notices.push(self.notice(ChangeKind::Delete, key.clone(), old));
                }
            }
            *store = fresh;
        }

        for notice in notices {
            self.enqueue(notice);
        }
    }

    /// Apply one watch event to the mirror and queue its notice
    fn apply(&self, kind: ChangeKind, obj: DynamicObject) {
        let Some(key) = ObjectKey::from_object(&obj) else {
            self.malformed("watched object has no name");
            return;
        };

        let notice = self.notice(kind, key.clone(), &obj);
        {
            let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
            match kind {
                ChangeKind::Create | ChangeKind::Update => {
                    store.insert(key, Arc::new(obj));
                }
                ChangeKind::Delete => {
                    store.remove(&key);
                }
            }
        }
        self.enqueue(notice);
    }

    fn notice(&self, kind: ChangeKind, key: ObjectKey, obj: &DynamicObject) -> ChangeNotice {
        ChangeNotice::new(kind, key, &self.resource_type, obj)
    }

    fn enqueue(&self, notice: ChangeNotice) {
        info!(
            resource = %notice.resource_type,
            key = %notice.key,
            kind = %notice.kind,
            "Processing {} to {}",
            notice.kind,
            notice.resource_type
        );
        self.queue.add(notice);
    }

    fn malformed(&self, reason: &str) {
        warn!(resource = %self.resource_type, reason = %reason, "Dropping malformed object");
        self.reports.malformed_object(&self.resource_type, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use crate::controller::stop_signal;
    use crate::controller::testing::{FakeSource, object, wait_until};
    use crate::report::{ControllerReport, create_report_handle};

    fn setup(source: Arc<FakeSource>) -> (Arc<CacheSource>, Arc<ChangeQueue>) {
        let queue = Arc::new(ChangeQueue::new());
        let cache = Arc::new(CacheSource::new(
            "pod",
            "default",
            source,
            Arc::clone(&queue),
            create_report_handle(),
        ));
        (cache, queue)
    }

    async fn drain(queue: &ChangeQueue) -> Vec<ChangeNotice> {
        let mut out = Vec::new();
        while !queue.is_empty() {
            let n = queue.get().await.unwrap();
            queue.done(&n.key);
            out.push(n);
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_list_syncs_and_emits_creates() {
        let source = Arc::new(FakeSource::new());
        source.push_list(vec![object("default", "a", "1"), object("default", "b", "2")]);
        let (cache, queue) = setup(Arc::clone(&source));

        assert!(!cache.has_synced());
        let (stop_tx, stop) = stop_signal();
        let task = cache.start(stop);

        wait_until(|| cache.has_synced()).await;
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&ObjectKey::new("default", "a")).is_some());
        assert!(cache.get(&ObjectKey::new("default", "missing")).is_none());

        let notices = drain(&queue).await;
        assert_eq!(notices.len(), 2);
        assert!(notices.iter().all(|n| n.kind == ChangeKind::Create));

        stop_tx.stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_events_update_mirror() {
        let source = Arc::new(FakeSource::new());
        source.push_list(vec![object("default", "a", "1")]);
        let events = source.push_watch();
        let (cache, queue) = setup(Arc::clone(&source));

        let (stop_tx, stop) = stop_signal();
        let task = cache.start(stop);
        wait_until(|| cache.has_synced()).await;
        drain(&queue).await;

        events
            .unbounded_send(Ok((ChangeKind::Update, object("default", "a", "5"))))
            .unwrap();
        events
            .unbounded_send(Ok((ChangeKind::Create, object("default", "b", "6"))))
            .unwrap();
        wait_until(|| cache.len() == 2).await;

        let a = cache.get(&ObjectKey::new("default", "a")).unwrap();
        assert_eq!(a.metadata.resource_version.as_deref(), Some("5"));

        events
            .unbounded_send(Ok((ChangeKind::Delete, object("default", "a", "7"))))
            .unwrap();
        wait_until(|| cache.len() == 1).await;
        assert!(cache.get(&ObjectKey::new("default", "a")).is_none());

        // a's Update and Delete coalesce into the newest notice
        let notices = drain(&queue).await;
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0].key.as_str(), "default/a");
        assert_eq!(notices[0].kind, ChangeKind::Delete);
        assert_eq!(notices[0].namespace, "default");
        assert_eq!(notices[1].kind, ChangeKind::Create);

        stop_tx.stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_resumes_from_last_resource_version() {
        let source = Arc::new(FakeSource::new());
        source.push_list_at(vec![object("default", "a", "1")], "10");
        let first = source.push_watch();
        let _second = source.push_watch();
        let (cache, _queue) = setup(Arc::clone(&source));

        let (stop_tx, stop) = stop_signal();
        let task = cache.start(stop);
        wait_until(|| cache.has_synced()).await;

        first
            .unbounded_send(Ok((ChangeKind::Update, object("default", "a", "12"))))
            .unwrap();
        drop(first);

        wait_until(|| source.watch_versions().len() == 2).await;
        assert_eq!(source.watch_versions(), vec!["10", "12"]);
        assert_eq!(source.list_calls(), 1);

        stop_tx.stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_error_relists_and_diffs() {
        let source = Arc::new(FakeSource::new());
        source.push_list(vec![object("default", "a", "1"), object("default", "b", "1")]);
        let events = source.push_watch();
        // After reconnect: a changed, b gone, c new
        source.push_list(vec![object("default", "a", "2"), object("default", "c", "1")]);
        let (cache, queue) = setup(Arc::clone(&source));

        let (stop_tx, stop) = stop_signal();
        let task = cache.start(stop);
        wait_until(|| cache.has_synced()).await;
        drain(&queue).await;

        events.unbounded_send(Err(anyhow!("connection reset"))).unwrap();
        wait_until(|| source.list_calls() == 2).await;
        wait_until(|| queue.len() == 3).await;

        let notices = drain(&queue).await;
        let kinds: Vec<_> = notices
            .iter()
            .map(|n| (n.key.as_str().to_string(), n.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("default/a".to_string(), ChangeKind::Update),
                ("default/b".to_string(), ChangeKind::Delete),
                ("default/c".to_string(), ChangeKind::Create),
            ]
        );
        assert!(cache.get(&ObjectKey::new("default", "b")).is_none());

        stop_tx.stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_error_is_retried() {
        let source = Arc::new(FakeSource::new());
        source.fail_next_list("apiserver unavailable");
        source.push_list(vec![object("default", "a", "1")]);
        let (cache, _queue) = setup(Arc::clone(&source));

        let (stop_tx, stop) = stop_signal();
        let task = cache.start(stop);

        wait_until(|| cache.has_synced()).await;
        assert_eq!(source.list_calls(), 2);

        stop_tx.stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unkeyable_object_dropped_and_reported() {
        let source = Arc::new(FakeSource::new());
        let mut nameless = object("default", "x", "1");
        nameless.metadata.name = None;
        source.push_list(vec![nameless, object("default", "a", "1")]);

        let queue = Arc::new(ChangeQueue::new());
        let reports = create_report_handle();
        let mut rx = reports.subscribe();
        let cache = Arc::new(CacheSource::new(
            "pod",
            "default",
            source,
            Arc::clone(&queue),
            reports,
        ));

        let (stop_tx, stop) = stop_signal();
        let task = cache.start(stop);
        wait_until(|| cache.has_synced()).await;

        assert_eq!(cache.len(), 1);
        assert_eq!(queue.len(), 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ControllerReport::MalformedObject { .. }
        ));

        stop_tx.stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_watch_close_backs_off() {
        let source = Arc::new(FakeSource::new());
        source.push_list_at(vec![object("default", "a", "1")], "10");
        drop(source.push_watch());
        drop(source.push_watch());
        let _open = source.push_watch();
        let (cache, _queue) = setup(Arc::clone(&source));

        let (stop_tx, stop) = stop_signal();
        let started = tokio::time::Instant::now();
        let task = cache.start(stop);

        wait_until(|| source.watch_versions().len() == 3).await;
        // 800ms after the first empty close, 1600ms after the second
        assert!(started.elapsed() >= Duration::from_millis(2400));
        assert_eq!(source.watch_versions(), vec!["10", "10", "10"]);
        assert_eq!(source.list_calls(), 1);

        stop_tx.stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unkeyable_watched_object_dropped_and_reported() {
        let source = Arc::new(FakeSource::new());
        source.push_list(vec![]);
        let events = source.push_watch();

        let queue = Arc::new(ChangeQueue::new());
        let reports = create_report_handle();
        let mut rx = reports.subscribe();
        let cache = Arc::new(CacheSource::new(
            "pod",
            "default",
            source,
            Arc::clone(&queue),
            Arc::clone(&reports),
        ));

        let (stop_tx, stop) = stop_signal();
        let task = cache.start(stop);
        wait_until(|| cache.has_synced()).await;

        let mut nameless = object("default", "x", "2");
        nameless.metadata.name = None;
        events
            .unbounded_send(Ok((ChangeKind::Create, nameless)))
            .unwrap();
        events
            .unbounded_send(Ok((ChangeKind::Create, object("default", "a", "3"))))
            .unwrap();
        wait_until(|| cache.len() == 1).await;

        assert_eq!(queue.len(), 1);
        assert_eq!(reports.errors(), 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ControllerReport::MalformedObject { .. }
        ));
        assert!(cache.get(&ObjectKey::new("default", "a")).is_some());

        stop_tx.stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_sync() {
        // No scripted list: the source never answers
        let source = Arc::new(FakeSource::new());
        let (cache, _queue) = setup(source);

        let (stop_tx, stop) = stop_signal();
        let task = cache.start(stop);
        stop_tx.stop();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("cache task should observe stop")
            .unwrap();
        assert!(!cache.has_synced());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_millis(800));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1600));
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(800));
    }
}

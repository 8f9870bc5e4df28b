// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Test doubles for the source and handler seams

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use futures::StreamExt;
use futures::channel::mpsc;
use kube::api::DynamicObject;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::cache::{Listing, Source, WatchStream};
use super::classify::NormalizedEvent;
use super::dispatch::Handler;
use super::notice::{ChangeKind, ObjectKey};

pub type WatchSender = mpsc::UnboundedSender<Result<(ChangeKind, DynamicObject)>>;

/// Object created well before any controller in the tests starts
pub fn object(namespace: &str, name: &str, resource_version: &str) -> DynamicObject {
    let created = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    object_created_at(namespace, name, resource_version, created)
}

pub fn object_created_at(
    namespace: &str,
    name: &str,
    resource_version: &str,
    created: DateTime<Utc>,
) -> DynamicObject {
    let mut metadata = json!({
        "name": name,
        "resourceVersion": resource_version,
        "creationTimestamp": created.to_rfc3339_opts(SecondsFormat::Secs, true),
    });
    if !namespace.is_empty() {
        metadata["namespace"] = json!(namespace);
    }
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": metadata,
    }))
    .expect("valid test object")
}

/// Object created an hour after now
pub fn fresh_object(namespace: &str, name: &str, resource_version: &str) -> DynamicObject {
    object_created_at(
        namespace,
        name,
        resource_version,
        Utc::now() + chrono::Duration::hours(1),
    )
}

/// Poll `cond` until it holds, panicking after ~10s of (possibly paused) time
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Scripted source: lists are served in order, watches are fed by channels
///
/// With no scripted list left, `list` never completes. With no scripted
/// watch left, `watch` returns a stream that never yields.
#[derive(Default)]
pub struct FakeSource {
    lists: Mutex<VecDeque<Result<Listing>>>,
    watches: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<(ChangeKind, DynamicObject)>>>>,
    list_calls: AtomicUsize,
    watch_versions: Mutex<Vec<String>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_list(&self, items: Vec<DynamicObject>) {
        self.lists.lock().unwrap().push_back(Ok(Listing {
            items,
            resource_version: None,
        }));
    }

    pub fn push_list_at(&self, items: Vec<DynamicObject>, resource_version: &str) {
        self.lists.lock().unwrap().push_back(Ok(Listing {
            items,
            resource_version: Some(resource_version.to_string()),
        }));
    }

    pub fn fail_next_list(&self, message: &str) {
        self.lists
            .lock()
            .unwrap()
            .push_back(Err(anyhow!("{}", message)));
    }

    /// Queue a watch stream; dropping the sender ends the stream
    pub fn push_watch(&self) -> WatchSender {
        let (tx, rx) = mpsc::unbounded();
        self.watches.lock().unwrap().push_back(rx);
        tx
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn watch_versions(&self) -> Vec<String> {
        self.watch_versions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Source for FakeSource {
    async fn list(&self) -> Result<Listing> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.lists.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => futures::future::pending().await,
        }
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream> {
        self.watch_versions
            .lock()
            .unwrap()
            .push(resource_version.to_string());
        let next = self.watches.lock().unwrap().pop_front();
        Ok(match next {
            Some(rx) => rx.boxed(),
            None => futures::stream::pending().boxed(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerCall {
    Created(ObjectKey),
    Updated(NormalizedEvent),
    Deleted(NormalizedEvent),
}

/// Records successful calls; fails the first `failures` attempts
#[derive(Default)]
pub struct RecordingHandler {
    calls: Mutex<Vec<HandlerCall>>,
    attempts: AtomicUsize,
    failures: AtomicUsize,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            ..Self::default()
        }
    }

    pub fn always_failing() -> Self {
        Self::failing(usize::MAX)
    }

    pub fn calls(&self) -> Vec<HandlerCall> {
        self.calls.lock().unwrap().clone()
    }

    /// All invocations, failed ones included
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn attempt(&self, call: HandlerCall) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != usize::MAX {
                self.failures.fetch_sub(1, Ordering::SeqCst);
            }
            bail!("handler failure");
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn object_created(&self, object: &DynamicObject) -> Result<()> {
        let key = ObjectKey::from_object(object).expect("test objects are named");
        self.attempt(HandlerCall::Created(key))
    }

    async fn object_updated(&self, _object: &DynamicObject, event: &NormalizedEvent) -> Result<()> {
        self.attempt(HandlerCall::Updated(event.clone()))
    }

    async fn object_deleted(&self, event: &NormalizedEvent) -> Result<()> {
        self.attempt(HandlerCall::Deleted(event.clone()))
    }
}

// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Watch controllers
//!
//! One `SubscriptionController` per (resource kind, namespace). Each owns a
//! `CacheSource` mirroring the collection and a `ChangeQueue` of pending
//! notices; workers drain the queue, classify each change against the
//! configured filters and hand forwarded changes to the `Handler`.

mod cache;
mod classify;
mod dispatch;
mod notice;
mod queue;
mod rate_limit;
mod set;
mod subscription;
#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheSource, Listing, Source, WatchStream};
pub use classify::{Classification, FilterSets, NormalizedEvent};
pub use dispatch::{Dispatch, Handler, dispatch};
pub use notice::{ChangeKind, ChangeNotice, ObjectKey};
pub use queue::ChangeQueue;
pub use rate_limit::{
    BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter,
    default_controller_rate_limiter,
};
pub use set::{ControllerSet, RunSummary};
pub use subscription::{ControllerOptions, ControllerState, SubscriptionController};

use std::fmt;
use tokio::sync::watch;

use crate::kubernetes::ResourceKind;

/// One watched collection: a resource kind in a namespace ("" = all)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub resource: ResourceKind,
    pub namespace: String,
}

impl Subscription {
    pub fn new(resource: ResourceKind, namespace: &str) -> Self {
        Self {
            resource,
            namespace: namespace.to_string(),
        }
    }

    pub fn resource_type(&self) -> &'static str {
        self.resource.name()
    }

    /// Namespace for display ("*" when watching all namespaces)
    pub fn namespace_label(&self) -> &str {
        if self.namespace.is_empty() {
            "*"
        } else {
            &self.namespace
        }
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace_label(), self.resource_type())
    }
}

/// Triggers shutdown of every task holding a matching `StopSignal`
pub struct StopHandle(watch::Sender<bool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

/// Cooperative stop signal shared by all controller tasks
#[derive(Clone)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once stop is requested or the handle is dropped
    pub async fn stopped(&mut self) {
        let _ = self.0.wait_for(|stopped| *stopped).await;
    }
}

pub fn stop_signal() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle(tx), StopSignal(rx))
}

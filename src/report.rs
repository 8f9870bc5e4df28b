// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Operational reports from the controllers
//!
//! Lifecycle milestones and failures that need operator attention are
//! broadcast to any subscriber. The failure count is kept separately so it
//! is accurate even when no subscriber is listening.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;

/// Report message
#[derive(Clone, Debug)]
pub enum ControllerReport {
    // === Lifecycle ===
    /// Controller started, waiting for its cache
    Starting { resource: String, namespace: String },
    /// Initial cache sync complete, workers running
    Synced {
        resource: String,
        namespace: String,
        elapsed_ms: u64,
    },
    /// Controller fully stopped
    Stopped { resource: String, namespace: String },

    // === Failures ===
    /// Cache did not sync in time; the subscription never started
    SyncTimedOut {
        resource: String,
        namespace: String,
        timeout_ms: u64,
    },
    /// A change kept failing and was dropped
    RetriesExhausted {
        resource: String,
        key: String,
        error: String,
    },
    /// An object could not be keyed and was dropped
    MalformedObject { resource: String, reason: String },
}

impl ControllerReport {
    /// Whether this report signals a failure
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ControllerReport::SyncTimedOut { .. }
                | ControllerReport::RetriesExhausted { .. }
                | ControllerReport::MalformedObject { .. }
        )
    }
}

pub struct Reporter {
    sender: broadcast::Sender<ControllerReport>,
    /// Failure reports published so far
    errors: AtomicUsize,
}

impl Reporter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(100);
        Self {
            sender,
            errors: AtomicUsize::new(0),
        }
    }

    /// Subscribe to reports
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerReport> {
        self.sender.subscribe()
    }

    fn publish(&self, report: ControllerReport) {
        if report.is_error() {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        let _ = self.sender.send(report);
    }

    pub fn starting(&self, resource: &str, namespace: &str) {
        self.publish(ControllerReport::Starting {
            resource: resource.to_string(),
            namespace: namespace.to_string(),
        });
    }

    pub fn synced(&self, resource: &str, namespace: &str, elapsed_ms: u64) {
        self.publish(ControllerReport::Synced {
            resource: resource.to_string(),
            namespace: namespace.to_string(),
            elapsed_ms,
        });
    }

    pub fn stopped(&self, resource: &str, namespace: &str) {
        self.publish(ControllerReport::Stopped {
            resource: resource.to_string(),
            namespace: namespace.to_string(),
        });
    }

    pub fn sync_timed_out(&self, resource: &str, namespace: &str, timeout_ms: u64) {
        self.publish(ControllerReport::SyncTimedOut {
            resource: resource.to_string(),
            namespace: namespace.to_string(),
            timeout_ms,
        });
    }

    pub fn retries_exhausted(&self, resource: &str, key: &str, error: &anyhow::Error) {
        self.publish(ControllerReport::RetriesExhausted {
            resource: resource.to_string(),
            key: key.to_string(),
            error: format!("{:#}", error),
        });
    }

    pub fn malformed_object(&self, resource: &str, reason: &str) {
        self.publish(ControllerReport::MalformedObject {
            resource: resource.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Number of failure reports published so far
    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe handle to the reporter
pub type ReportHandle = Arc<Reporter>;

/// Create a new reporter handle
pub fn create_report_handle() -> ReportHandle {
    Arc::new(Reporter::new())
}

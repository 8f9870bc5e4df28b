// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

use std::sync::Arc;
use tracing::{debug, error, info};

use super::cache::Source;
use super::classify::FilterSets;
use super::dispatch::Handler;
use super::subscription::{ControllerOptions, SubscriptionController};
use super::{StopSignal, Subscription};
use crate::report::ReportHandle;

/// Outcome of a `ControllerSet::run`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub started: usize,
    pub failed: usize,
}

/// Runs one controller per subscription until the shared stop signal
pub struct ControllerSet {
    controllers: Vec<Arc<SubscriptionController>>,
}

impl ControllerSet {
    /// Build a controller for every subscription
    ///
    /// `source_for` supplies the list/watch capability for a subscription.
    pub fn build<F>(
        subscriptions: &[Subscription],
        mut source_for: F,
        filters: Arc<FilterSets>,
        handler: Arc<dyn Handler>,
        reports: ReportHandle,
        options: ControllerOptions,
    ) -> Self
    where
        F: FnMut(&Subscription) -> Arc<dyn Source>,
    {
        let controllers = subscriptions
            .iter()
            .map(|sub| {
                Arc::new(SubscriptionController::new(
                    sub.clone(),
                    source_for(sub),
                    Arc::clone(&filters),
                    Arc::clone(&handler),
                    reports.clone(),
                    options.clone(),
                ))
            })
            .collect();
        Self { controllers }
    }

    pub fn controllers(&self) -> &[Arc<SubscriptionController>] {
        &self.controllers
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Start every controller concurrently and wait for all of them to stop
    ///
    /// A controller that fails (sync timeout) does not affect the others.
    pub async fn run(self, stop: StopSignal) -> RunSummary {
        let started = self.controllers.len();
        info!(controllers = started, "Starting controllers");

        let handles: Vec<_> = self
            .controllers
            .into_iter()
            .map(|controller| {
                let stop = stop.clone();
                let label = controller.subscription().to_string();
                let handle = tokio::spawn(controller.run(stop));
                (label, handle)
            })
            .collect();

        let mut failed = 0;
        for (label, handle) in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // Already surfaced through the reporter
                    debug!(subscription = %label, error = %e, "Controller failed");
                    failed += 1;
                }
                Err(e) => {
                    error!(subscription = %label, error = %e, "Controller task panicked");
                    failed += 1;
                }
            }
        }

        info!(started, failed, "All controllers stopped");
        RunSummary { started, failed }
    }
}

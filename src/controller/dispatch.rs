// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

use anyhow::Result;
use async_trait::async_trait;
use kube::api::DynamicObject;

use super::classify::NormalizedEvent;

/// Notification sink
///
/// Creates receive the full object since sinks render details for them;
/// updates and deletes are identified by the normalized event.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn object_created(&self, object: &DynamicObject) -> Result<()>;

    async fn object_updated(&self, object: &DynamicObject, event: &NormalizedEvent) -> Result<()>;

    async fn object_deleted(&self, event: &NormalizedEvent) -> Result<()>;
}

/// A forwarded change, ready for the handler
#[derive(Debug, Clone, Copy)]
pub enum Dispatch<'a> {
    Created(&'a DynamicObject),
    Updated(&'a DynamicObject, &'a NormalizedEvent),
    Deleted(&'a NormalizedEvent),
}

/// Invoke the handler entry point matching the change; errors propagate
pub async fn dispatch(handler: &dyn Handler, change: Dispatch<'_>) -> Result<()> {
    match change {
        Dispatch::Created(object) => handler.object_created(object).await,
        Dispatch::Updated(object, event) => handler.object_updated(object, event).await,
        Dispatch::Deleted(event) => handler.object_deleted(event).await,
    }
}

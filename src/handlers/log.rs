// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

use anyhow::Result;
use async_trait::async_trait;
use kube::api::DynamicObject;
use tracing::info;

use super::describe;
use crate::controller::{Handler, NormalizedEvent};

/// Logs every forwarded change at info level
pub struct LogHandler;

fn resource_type(object: &DynamicObject) -> String {
    object
        .types
        .as_ref()
        .map(|t| t.kind.to_lowercase())
        .unwrap_or_else(|| "object".to_string())
}

#[async_trait]
impl Handler for LogHandler {
    async fn object_created(&self, object: &DynamicObject) -> Result<()> {
        let resource = resource_type(object);
        let namespace = object.metadata.namespace.as_deref().unwrap_or_default();
        let name = object.metadata.name.as_deref().unwrap_or_default();
        info!(
            resource = %resource,
            namespace = %namespace,
            name = %name,
            "{}",
            describe(&resource, namespace, name, "created")
        );
        Ok(())
    }

    async fn object_updated(&self, _object: &DynamicObject, event: &NormalizedEvent) -> Result<()> {
        info!(
            resource = %event.kind,
            namespace = %event.namespace,
            key = %event.name,
            "{}",
            describe(&event.kind, &event.namespace, event.name.name(), "updated")
        );
        Ok(())
    }

    async fn object_deleted(&self, event: &NormalizedEvent) -> Result<()> {
        info!(
            resource = %event.kind,
            namespace = %event.namespace,
            key = %event.name,
            "{}",
            describe(&event.kind, &event.namespace, event.name.name(), "deleted")
        );
        Ok(())
    }
}

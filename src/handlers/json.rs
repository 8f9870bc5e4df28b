// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::DynamicObject;
use serde::Serialize;
use std::io::Write;
use std::sync::{Mutex, PoisonError};

use crate::controller::{ChangeKind, Handler, NormalizedEvent, ObjectKey};

/// One line on the output per forwarded change
#[derive(Serialize)]
struct Envelope<'a> {
    time: DateTime<Utc>,
    event: ChangeKind,
    kind: &'a str,
    name: &'a str,
    namespace: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    object: Option<&'a DynamicObject>,
}

/// Writes changes as JSON lines; creates include the full object
pub struct JsonHandler {
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonHandler {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    fn emit(&self, envelope: &Envelope<'_>) -> Result<()> {
        let line = serde_json::to_string(envelope).context("Failed to serialize event")?;
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "{}", line).context("Failed to write event")?;
        out.flush().context("Failed to flush event output")?;
        Ok(())
    }

    fn emit_event(&self, kind: ChangeKind, event: &NormalizedEvent) -> Result<()> {
        self.emit(&Envelope {
            time: Utc::now(),
            event: kind,
            kind: &event.kind,
            name: event.name.as_str(),
            namespace: &event.namespace,
            object: None,
        })
    }
}

#[async_trait]
impl Handler for JsonHandler {
    async fn object_created(&self, object: &DynamicObject) -> Result<()> {
        let kind = object
            .types
            .as_ref()
            .map(|t| t.kind.to_lowercase())
            .unwrap_or_default();
        let key = ObjectKey::from_object(object)
            .map(|k| k.to_string())
            .unwrap_or_default();
        self.emit(&Envelope {
            time: Utc::now(),
            event: ChangeKind::Create,
            kind: &kind,
            name: &key,
            namespace: object.metadata.namespace.as_deref().unwrap_or_default(),
            object: Some(object),
        })
    }

    async fn object_updated(&self, _object: &DynamicObject, event: &NormalizedEvent) -> Result<()> {
        self.emit_event(ChangeKind::Update, event)
    }

    async fn object_deleted(&self, event: &NormalizedEvent) -> Result<()> {
        self.emit_event(ChangeKind::Delete, event)
    }
}

// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Forward/drop decisions for change notices

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::notice::{ChangeKind, ChangeNotice, ObjectKey};
use crate::config::EventConfig;
use crate::kubernetes::ResourceKind;

/// Sink-facing identity of a forwarded change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Resource type, e.g. "pod"
    pub kind: String,
    pub name: ObjectKey,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Forward(NormalizedEvent),
    Drop,
}

/// Resource types to notify on, per change kind
///
/// Built once from configuration. `global` applies to every change kind.
#[derive(Debug, Clone, Default)]
pub struct FilterSets {
    global: HashSet<String>,
    create: HashSet<String>,
    update: HashSet<String>,
    delete: HashSet<String>,
}

/// Canonical resource type for a configured name; unknown names pass through
fn canonical(name: &str) -> String {
    let trimmed = name.trim();
    ResourceKind::from_name(trimmed)
        .map(|k| k.name().to_string())
        .unwrap_or_else(|| trimmed.to_lowercase())
}

fn to_set(names: &[String]) -> HashSet<String> {
    names.iter().map(|n| canonical(n)).collect()
}

impl From<&EventConfig> for FilterSets {
    fn from(events: &EventConfig) -> Self {
        Self {
            global: to_set(&events.global),
            create: to_set(&events.create),
            update: to_set(&events.update),
            delete: to_set(&events.delete),
        }
    }
}

impl FilterSets {
    /// Whether `kind` changes of `resource_type` should be forwarded
    pub fn allows(&self, kind: ChangeKind, resource_type: &str) -> bool {
        if self.global.contains(resource_type) {
            return true;
        }
        match kind {
            ChangeKind::Create => self.create.contains(resource_type),
            ChangeKind::Update => self.update.contains(resource_type),
            ChangeKind::Delete => self.delete.contains(resource_type),
        }
    }

    /// Decide whether a notice is forwarded
    ///
    /// Creates are only forwarded for objects created after the controller
    /// started; everything that existed before is part of the initial list.
    pub fn classify(
        &self,
        notice: &ChangeNotice,
        creation_time: Option<DateTime<Utc>>,
        controller_start: DateTime<Utc>,
    ) -> Classification {
        if notice.kind == ChangeKind::Create {
            let is_new = creation_time.is_some_and(|t| t > controller_start);
            if !is_new {
                return Classification::Drop;
            }
        }

        if !self.allows(notice.kind, &notice.resource_type) {
            return Classification::Drop;
        }

        let namespace = if notice.namespace.is_empty() {
            notice.key.namespace().to_string()
        } else {
            notice.namespace.clone()
        };

        Classification::Forward(NormalizedEvent {
            kind: notice.resource_type.clone(),
            name: notice.key.clone(),
            namespace,
        })
    }
}

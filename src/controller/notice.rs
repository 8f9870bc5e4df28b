// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Object identity and change notices
//!
//! A `ChangeNotice` is what the cache emits for every observed mutation and
//! what the queue coalesces on. It carries identity only; the object state
//! is always re-read from the cache when the notice is processed.

use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use std::fmt;

/// `namespace/name` for namespaced objects, `name` for cluster-scoped ones
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        if namespace.is_empty() {
            Self(name.to_string())
        } else {
            Self(format!("{}/{}", namespace, name))
        }
    }

    /// Build the key from object metadata
    ///
    /// Returns None for objects without a name, which cannot be tracked.
    pub fn from_object(obj: &DynamicObject) -> Option<Self> {
        let name = obj.metadata.name.as_deref().filter(|n| !n.is_empty())?;
        let namespace = obj.metadata.namespace.as_deref().unwrap_or_default();
        Some(Self::new(namespace, name))
    }

    /// Namespace part of the key (empty for cluster-scoped objects)
    pub fn namespace(&self) -> &str {
        self.0.split_once('/').map(|(ns, _)| ns).unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.0
            .split_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending change for one object of one resource kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub key: ObjectKey,
    pub kind: ChangeKind,
    pub resource_type: String,
    /// Namespace from the object's metadata when the change was observed
    pub namespace: String,
}

impl ChangeNotice {
    pub fn new(kind: ChangeKind, key: ObjectKey, resource_type: &str, obj: &DynamicObject) -> Self {
        Self {
            key,
            kind,
            resource_type: resource_type.to_string(),
            namespace: obj.metadata.namespace.clone().unwrap_or_default(),
        }
    }
}

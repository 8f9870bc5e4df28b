// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Watchable resource kinds
//!
//! The set is fixed at compile time. API coordinates come from the
//! k8s-openapi types through `kube::Resource`, so no discovery round trip
//! is needed before watching.

use anyhow::{Result, anyhow};
use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment, ReplicaSet},
    batch::v1::Job,
    core::v1::{
        ConfigMap, Namespace, PersistentVolume, Pod, ReplicationController, Secret, Service,
    },
    networking::v1::Ingress,
};
use kube::api::ApiResource;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum ResourceKind {
    Deployment,
    ReplicationController,
    ReplicaSet,
    DaemonSet,
    Service,
    Pod,
    Job,
    PersistentVolume,
    Namespace,
    Secret,
    ConfigMap,
    Ingress,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 12] = [
        ResourceKind::Deployment,
        ResourceKind::ReplicationController,
        ResourceKind::ReplicaSet,
        ResourceKind::DaemonSet,
        ResourceKind::Service,
        ResourceKind::Pod,
        ResourceKind::Job,
        ResourceKind::PersistentVolume,
        ResourceKind::Namespace,
        ResourceKind::Secret,
        ResourceKind::ConfigMap,
        ResourceKind::Ingress,
    ];

    /// Canonical resource type name, as used in filters and events
    pub fn name(self) -> &'static str {
        match self {
            ResourceKind::Deployment => "deployment",
            ResourceKind::ReplicationController => "replicationcontroller",
            ResourceKind::ReplicaSet => "replicaset",
            ResourceKind::DaemonSet => "daemonset",
            ResourceKind::Service => "service",
            ResourceKind::Pod => "pod",
            ResourceKind::Job => "job",
            ResourceKind::PersistentVolume => "persistentvolume",
            ResourceKind::Namespace => "namespace",
            ResourceKind::Secret => "secret",
            ResourceKind::ConfigMap => "configmap",
            ResourceKind::Ingress => "ingress",
        }
    }

    /// Short names accepted wherever a kind is named
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            ResourceKind::Deployment => &["deploy", "deployments"],
            ResourceKind::ReplicationController => &["rc", "replicationcontrollers"],
            ResourceKind::ReplicaSet => &["rs", "replicasets"],
            ResourceKind::DaemonSet => &["ds", "daemonsets"],
            ResourceKind::Service => &["svc", "services"],
            ResourceKind::Pod => &["po", "pods"],
            ResourceKind::Job => &["jobs"],
            ResourceKind::PersistentVolume => &["pv", "persistentvolumes"],
            ResourceKind::Namespace => &["ns", "namespaces"],
            ResourceKind::Secret => &["secrets"],
            ResourceKind::ConfigMap => &["cm", "configmaps"],
            ResourceKind::Ingress => &["ing", "ingresses"],
        }
    }

    /// Look up a kind by canonical name or alias, ignoring case
    pub fn from_name(name: &str) -> Option<ResourceKind> {
        let name = name.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == name || kind.aliases().contains(&name.as_str()))
    }

    /// Environment variable that enables this kind when set to "true"
    pub fn env_var(self) -> &'static str {
        match self {
            ResourceKind::Deployment => "KW_DEPLOYMENT",
            ResourceKind::ReplicationController => "KW_REPLICATION_CONTROLLER",
            ResourceKind::ReplicaSet => "KW_REPLICASET",
            ResourceKind::DaemonSet => "KW_DAEMONSET",
            ResourceKind::Service => "KW_SERVICE",
            ResourceKind::Pod => "KW_POD",
            ResourceKind::Job => "KW_JOB",
            ResourceKind::PersistentVolume => "KW_PERSISTENT_VOLUME",
            ResourceKind::Namespace => "KW_NAMESPACE",
            ResourceKind::Secret => "KW_SECRET",
            ResourceKind::ConfigMap => "KW_CONFIGMAP",
            ResourceKind::Ingress => "KW_INGRESS",
        }
    }

    /// Cluster-scoped kinds ignore the configured namespaces
    pub fn is_namespaced(self) -> bool {
        !matches!(
            self,
            ResourceKind::Namespace | ResourceKind::PersistentVolume
        )
    }

    pub fn api_resource(self) -> ApiResource {
        match self {
            ResourceKind::Deployment => ApiResource::erase::<Deployment>(&()),
            ResourceKind::ReplicationController => {
                ApiResource::erase::<ReplicationController>(&())
            }
            ResourceKind::ReplicaSet => ApiResource::erase::<ReplicaSet>(&()),
            ResourceKind::DaemonSet => ApiResource::erase::<DaemonSet>(&()),
            ResourceKind::Service => ApiResource::erase::<Service>(&()),
            ResourceKind::Pod => ApiResource::erase::<Pod>(&()),
            ResourceKind::Job => ApiResource::erase::<Job>(&()),
            ResourceKind::PersistentVolume => ApiResource::erase::<PersistentVolume>(&()),
            ResourceKind::Namespace => ApiResource::erase::<Namespace>(&()),
            ResourceKind::Secret => ApiResource::erase::<Secret>(&()),
            ResourceKind::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
            ResourceKind::Ingress => ApiResource::erase::<Ingress>(&()),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ResourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        ResourceKind::from_name(s).ok_or_else(|| {
            let known: Vec<_> = ResourceKind::ALL.iter().map(|k| k.name()).collect();
            anyhow!(
                "Unknown resource kind '{}'. Known kinds: {}",
                s,
                known.join(", ")
            )
        })
    }
}

impl TryFrom<String> for ResourceKind {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

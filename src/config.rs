// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! kubewatch configuration
//!
//! Read from `.kubewatch.yaml`, located in this order:
//! - the path given on the command line
//! - `$KW_CONFIG/.kubewatch.yaml`
//! - `~/.kubewatch.yaml`
//!
//! A missing or empty file yields the defaults.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::controller::{FilterSets, Subscription};
use crate::kubernetes::ResourceKind;

pub const CONFIG_FILE_NAME: &str = ".kubewatch.yaml";

/// Directory override for the config file
pub const CONFIG_DIR_ENV: &str = "KW_CONFIG";

/// Resource types per event direction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Forwarded for create, update and delete
    pub global: Vec<String>,
    pub create: Vec<String>,
    pub update: Vec<String>,
    pub delete: Vec<String>,
}

impl EventConfig {
    fn all_names(&self) -> impl Iterator<Item = &String> {
        self.global
            .iter()
            .chain(&self.create)
            .chain(&self.update)
            .chain(&self.delete)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// Structured log line per event
    #[default]
    Log,
    /// One JSON document per event on stdout
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    pub kind: HandlerKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Resource toggles (aliases accepted as keys)
    pub resource: BTreeMap<ResourceKind, bool>,
    /// Namespaces to watch; empty watches all of them
    pub namespace: Vec<String>,
    pub event: EventConfig,
    pub handler: HandlerConfig,
}

/// What the controller set needs to start
#[derive(Debug)]
pub struct ResolvedConfig {
    pub filters: FilterSets,
    pub subscriptions: Vec<Subscription>,
}

impl Config {
    /// Load config from disk, or return default if not found
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Config::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config")
    }

    /// Get the config file path
    pub fn config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        resolve_path(
            explicit,
            std::env::var_os(CONFIG_DIR_ENV).map(PathBuf::from),
            dirs::home_dir(),
        )
    }

    /// Enable every resource whose environment variable is "true"
    ///
    /// Never disables a resource the file enabled.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for kind in ResourceKind::ALL {
            if lookup(kind.env_var()).as_deref() == Some("true") {
                self.resource.insert(kind, true);
            }
        }
    }

    fn enabled_resources(&self) -> BTreeSet<ResourceKind> {
        self.resource
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(kind, _)| *kind)
            .collect()
    }

    /// Derive filters and subscriptions
    ///
    /// Either resource toggles drive everything (each enabled kind gets all
    /// events), or, with no toggle enabled, every kind named in an event
    /// list is watched.
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        let mut events = self.event.clone();
        let mut enabled = self.enabled_resources();

        if !enabled.is_empty() {
            info!("Configuring resources for global events");
            events
                .global
                .extend(enabled.iter().map(|kind| kind.name().to_string()));
        } else {
            info!("Configuring resources based on events config");
            for name in self.event.all_names() {
                match ResourceKind::from_name(name) {
                    Some(kind) => {
                        enabled.insert(kind);
                    }
                    None => warn!(resource = %name, "Ignoring unknown resource type in events config"),
                }
            }
        }

        if enabled.is_empty() {
            bail!(
                "No resources configured. Enable one under 'resource' or list it under 'event'"
            );
        }

        let mut namespaces: Vec<String> = Vec::new();
        for ns in &self.namespace {
            let ns = ns.trim();
            if !namespaces.iter().any(|n| n == ns) {
                namespaces.push(ns.to_string());
            }
        }
        // An empty entry means all namespaces, which covers the rest
        if namespaces.is_empty() || namespaces.iter().any(|n| n.is_empty()) {
            namespaces = vec![String::new()];
        }

        let mut subscriptions = Vec::new();
        for kind in enabled {
            if kind.is_namespaced() {
                subscriptions.extend(namespaces.iter().map(|ns| Subscription::new(kind, ns)));
            } else {
                subscriptions.push(Subscription::new(kind, ""));
            }
        }

        Ok(ResolvedConfig {
            filters: FilterSets::from(&events),
            subscriptions,
        })
    }

    /// Config written by `config init`: every resource listed, none enabled
    pub fn template() -> Self {
        Config {
            resource: ResourceKind::ALL.into_iter().map(|k| (k, false)).collect(),
            ..Config::default()
        }
    }

    /// Write the config atomically (temp file in the same directory, then rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;

        let content = self.to_yaml()?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
        tmp.write_all(content.as_bytes())
            .context("Failed to write config")?;
        tmp.persist(path)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Write the template unless a config already exists (or `force`)
    pub fn init(path: &Path, force: bool) -> Result<()> {
        if path.exists() && !force {
            bail!(
                "Config file already exists: {} (use --force to overwrite)",
                path.display()
            );
        }
        Self::template().save(path)
    }
}

fn resolve_path(
    explicit: Option<&Path>,
    config_dir: Option<PathBuf>,
    home: Option<PathBuf>,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(dir) = config_dir.filter(|d| !d.as_os_str().is_empty()) {
        return Ok(dir.join(CONFIG_FILE_NAME));
    }
    home.map(|h| h.join(CONFIG_FILE_NAME))
        .context("Could not determine home directory")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{ChangeKind, ChangeNotice, Classification, ObjectKey};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn names(subs: &[Subscription]) -> Vec<String> {
        subs.iter().map(|s| s.to_string()).collect()
    }

    fn notice(kind: ChangeKind, resource_type: &str) -> ChangeNotice {
        ChangeNotice {
            key: ObjectKey::new("default", "x"),
            kind,
            resource_type: resource_type.to_string(),
            namespace: "default".to_string(),
        }
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.resource.is_empty());
        assert!(config.namespace.is_empty());
        assert_eq!(config.handler.kind, HandlerKind::Log);
    }

    #[test]
    fn test_config_deserialize() {
        let yaml = r#"
resource:
  po: true
  svc: false
  deployment: true
namespace: [default, kube-system]
event:
  update: [pod]
handler:
  kind: json
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.resource.get(&ResourceKind::Pod), Some(&true));
        assert_eq!(config.resource.get(&ResourceKind::Service), Some(&false));
        assert_eq!(config.resource.get(&ResourceKind::Deployment), Some(&true));
        assert_eq!(config.namespace, vec!["default", "kube-system"]);
        assert_eq!(config.event.update, vec!["pod"]);
        assert!(config.event.global.is_empty());
        assert_eq!(config.handler.kind, HandlerKind::Json);
    }

    #[test]
    fn test_config_deserialize_empty() {
        assert_eq!(Config::from_yaml("").unwrap(), Config::default());
        assert_eq!(Config::from_yaml("  \n").unwrap(), Config::default());
        assert_eq!(Config::from_yaml("{}").unwrap(), Config::default());
    }

    #[test]
    fn test_unknown_resource_key_is_rejected() {
        let err = Config::from_yaml("resource:\n  widget: true\n").unwrap_err();
        assert!(format!("{:#}", err).contains("widget"));
    }

    #[test]
    fn test_resolve_from_resource_toggles() {
        let mut config = Config::default();
        config.resource.insert(ResourceKind::Pod, true);
        config.resource.insert(ResourceKind::Service, false);
        config.namespace = vec!["a".to_string(), "b".to_string()];

        let resolved = config.resolve().unwrap();
        assert_eq!(names(&resolved.subscriptions), vec!["a/pod", "b/pod"]);

        let filters = &resolved.filters;
        assert!(filters.allows(ChangeKind::Create, "pod"));
        assert!(filters.allows(ChangeKind::Update, "pod"));
        assert!(filters.allows(ChangeKind::Delete, "pod"));
        assert!(!filters.allows(ChangeKind::Update, "service"));
    }

    #[test]
    fn test_resolve_from_event_lists() {
        let config = Config {
            event: EventConfig {
                update: vec!["pod".to_string()],
                delete: vec!["svc".to_string(), "gizmo".to_string()],
                ..EventConfig::default()
            },
            ..Config::default()
        };

        let resolved = config.resolve().unwrap();
        assert_eq!(names(&resolved.subscriptions), vec!["*/service", "*/pod"]);

        let started = chrono::Utc::now();
        let update = resolved.filters.classify(
            &notice(ChangeKind::Update, "pod"),
            None,
            started,
        );
        assert!(matches!(update, Classification::Forward(_)));
        let create = resolved.filters.classify(
            &notice(ChangeKind::Create, "pod"),
            Some(started + chrono::Duration::seconds(5)),
            started,
        );
        assert_eq!(create, Classification::Drop);
    }

    #[test]
    fn test_cluster_scoped_kinds_subscribe_once() {
        let mut config = Config::default();
        config.resource.insert(ResourceKind::Namespace, true);
        config.resource.insert(ResourceKind::PersistentVolume, true);
        config.resource.insert(ResourceKind::Secret, true);
        config.namespace = vec!["a".to_string(), "b".to_string(), "a".to_string()];

        let resolved = config.resolve().unwrap();
        assert_eq!(
            names(&resolved.subscriptions),
            vec!["*/persistentvolume", "*/namespace", "a/secret", "b/secret"]
        );
    }

    #[test]
    fn test_empty_namespace_entry_means_all() {
        let mut config = Config::default();
        config.resource.insert(ResourceKind::Pod, true);
        config.namespace = vec!["a".to_string(), String::new()];

        let resolved = config.resolve().unwrap();
        assert_eq!(names(&resolved.subscriptions), vec!["*/pod"]);
    }

    #[test]
    fn test_resolve_without_resources_fails() {
        let err = Config::default().resolve().unwrap_err();
        assert!(err.to_string().contains("No resources configured"));

        let mut config = Config::template();
        config.event.update = vec!["unknown".to_string()];
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_env_overrides_only_enable() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("KW_POD", "true"),
            ("KW_SERVICE", "false"),
            ("KW_PERSISTENT_VOLUME", "true"),
        ]);
        let mut config = Config::default();
        config.resource.insert(ResourceKind::Job, true);
        config.resource.insert(ResourceKind::Service, true);

        config.apply_env_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.resource.get(&ResourceKind::Pod), Some(&true));
        assert_eq!(
            config.resource.get(&ResourceKind::PersistentVolume),
            Some(&true)
        );
        // File settings are kept
        assert_eq!(config.resource.get(&ResourceKind::Service), Some(&true));
        assert_eq!(config.resource.get(&ResourceKind::Job), Some(&true));
        assert_eq!(config.resource.get(&ResourceKind::Secret), None);
    }

    #[test]
    fn test_resolve_path_order() {
        let explicit = PathBuf::from("/etc/kw.yaml");
        assert_eq!(
            resolve_path(
                Some(explicit.as_path()),
                Some("/cfg".into()),
                Some("/home/u".into())
            )
            .unwrap(),
            explicit
        );
        assert_eq!(
            resolve_path(None, Some("/cfg".into()), Some("/home/u".into())).unwrap(),
            PathBuf::from("/cfg/.kubewatch.yaml")
        );
        assert_eq!(
            resolve_path(None, Some("".into()), Some("/home/u".into())).unwrap(),
            PathBuf::from("/home/u/.kubewatch.yaml")
        );
        assert!(resolve_path(None, None, None).is_err());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(&temp_dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_reports_path_on_parse_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "namespace: {not: [a list").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_init_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join(CONFIG_FILE_NAME);

        Config::init(&path, false).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, Config::template());
        assert_eq!(loaded.resource.len(), ResourceKind::ALL.len());

        // Refuses to overwrite without force
        let err = Config::init(&path, false).unwrap_err();
        assert!(err.to_string().contains("already exists"));

        fs::write(&path, "namespace: [x]\n").unwrap();
        Config::init(&path, true).unwrap();
        assert_eq!(Config::load(&path).unwrap(), Config::template());
    }

    #[test]
    fn test_save_preserves_settings() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);

        let mut config = Config::default();
        config.resource.insert(ResourceKind::Ingress, true);
        config.namespace = vec!["web".to_string()];
        config.event.delete = vec!["ingress".to_string()];
        config.handler.kind = HandlerKind::Json;
        config.save(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("ingress: true"));
        assert_eq!(Config::load(&path).unwrap(), config);
    }
}

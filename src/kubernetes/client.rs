// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

use anyhow::{Context, Result, anyhow};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::api::{ApiResource, DynamicObject, ListParams, WatchEvent, WatchParams};
use kube::core::TypeMeta;
use kube::config::KubeConfigOptions;
use kube::{Api, Client, Config};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::ResourceKind;
use crate::controller::{ChangeKind, Listing, Source, WatchStream};

/// Timeout for connecting to K8s API
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Server-side timeout for a single watch request, in seconds
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Timeout for reading K8s API responses
/// Must outlast a quiet watch so the server closes it first
const READ_TIMEOUT: Duration = Duration::from_secs(WATCH_TIMEOUT_SECS as u64 + 30);

/// Maximum retry attempts for transient failures
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (doubles each retry)
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Page size for paginated list requests
const PAGE_SIZE: u32 = 500;

/// Build a client for the given kubeconfig context, or infer one
///
/// Without a context, in-cluster configuration is tried first, then the
/// current kubeconfig context.
pub async fn connect(context: Option<&str>) -> Result<Client> {
    let mut config = match context {
        Some(ctx) => Config::from_kubeconfig(&KubeConfigOptions {
            context: Some(ctx.to_string()),
            ..Default::default()
        })
        .await
        .with_context(|| format!("Failed to load kubeconfig for context '{}'", ctx))?,
        None => Config::infer()
            .await
            .context("Failed to infer Kubernetes configuration")?,
    };

    config.connect_timeout = Some(CONNECT_TIMEOUT);
    config.read_timeout = Some(READ_TIMEOUT);

    let cluster_url = config.cluster_url.to_string();
    let client = Client::try_from(config).context("Failed to create Kubernetes client")?;
    info!(cluster = %cluster_url, context = ?context, "Connected to cluster");
    Ok(client)
}

/// List/watch capability for one resource kind in one namespace
pub struct KubeSource {
    api: Api<DynamicObject>,
    kind: ResourceKind,
    types: TypeMeta,
    scope: String,
}

impl KubeSource {
    /// An empty namespace, or a cluster-scoped kind, watches cluster-wide
    pub fn new(client: Client, kind: ResourceKind, namespace: &str) -> Self {
        let ar: ApiResource = kind.api_resource();
        let (api, scope) = if kind.is_namespaced() && !namespace.is_empty() {
            (
                Api::namespaced_with(client, namespace, &ar),
                namespace.to_string(),
            )
        } else if kind.is_namespaced() {
            (Api::all_with(client, &ar), "all-namespaces".to_string())
        } else {
            (Api::all_with(client, &ar), "cluster-scoped".to_string())
        };

        Self {
            api,
            kind,
            types: TypeMeta {
                api_version: ar.api_version.clone(),
                kind: ar.kind.clone(),
            },
            scope,
        }
    }

    /// Fetch a single page with retry logic
    async fn list_page_with_retry(
        &self,
        params: &ListParams,
    ) -> Result<kube::api::ObjectList<DynamicObject>> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            match self.api.list(params).await {
                Ok(list) => return Ok(list),
                Err(e) => {
                    if is_retryable_error(&e) {
                        let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                        warn!(
                            resource = %self.kind,
                            scope = %self.scope,
                            attempt = attempt + 1,
                            max_attempts = MAX_RETRIES,
                            delay_ms = delay.as_millis(),
                            error = %e,
                            "Retryable error, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        last_error = Some(e);
                    } else {
                        debug!(
                            resource = %self.kind,
                            scope = %self.scope,
                            error = %e,
                            "Non-retryable error"
                        );
                        return Err(anyhow!("K8s API error: {}", e));
                    }
                }
            }
        }

        Err(anyhow!(
            "Failed after {} retries: {}",
            MAX_RETRIES,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        ))
    }

}

#[async_trait]
impl Source for KubeSource {
    /// List the whole collection using continue tokens
    async fn list(&self) -> Result<Listing> {
        let mut items: Vec<DynamicObject> = Vec::new();
        let mut continue_token: Option<String> = None;
        let mut resource_version = None;
        let mut page_count = 0u32;

        loop {
            let mut params = ListParams::default().limit(PAGE_SIZE);
            if let Some(ref token) = continue_token {
                params = params.continue_token(token);
            }

            let list = self.list_page_with_retry(&params).await?;

            // All pages of one list share the snapshot of the first
            if resource_version.is_none() {
                resource_version = list.metadata.resource_version.clone();
            }
            let items_count = list.items.len();
            items.extend(list.items.into_iter().map(|obj| with_types(obj, &self.types)));
            page_count += 1;

            match list.metadata.continue_ {
                Some(token) if !token.is_empty() => {
                    trace!(
                        resource = %self.kind,
                        scope = %self.scope,
                        page = page_count,
                        items_this_page = items_count,
                        total_so_far = items.len(),
                        "Fetched page, continuing"
                    );
                    continue_token = Some(token);
                }
                _ => break,
            }
        }

        debug!(
            resource = %self.kind,
            scope = %self.scope,
            pages = page_count,
            total_items = items.len(),
            resource_version = ?resource_version,
            "List complete"
        );

        Ok(Listing {
            items,
            resource_version,
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream> {
        let version = if resource_version.is_empty() {
            "0".to_string()
        } else {
            resource_version.to_string()
        };
        debug!(resource = %self.kind, scope = %self.scope, version = %version, "Starting watch");

        Ok(watch_events(
            self.api.clone(),
            self.kind,
            self.types.clone(),
            version,
        ))
    }
}

/// One watch request as a stream of changes
///
/// Ends when the server closes the request. Error events from the server
/// (e.g. an expired resource version) end the stream with an error.
fn watch_events(
    api: Api<DynamicObject>,
    kind: ResourceKind,
    types: TypeMeta,
    version: String,
) -> WatchStream {
    let stream = try_stream! {
        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let events = api
            .watch(&params, &version)
            .await
            .with_context(|| format!("Failed to start watch for {}", kind))?;
        let mut events = events.boxed();

        while let Some(event) = events.try_next().await? {
            if let Some(change) = map_event(event, kind, &types) {
                yield change?;
            }
        }
    };

    Box::pin(stream)
}

/// Translate one watch event; bookmarks carry no change
fn map_event(
    event: WatchEvent<DynamicObject>,
    kind: ResourceKind,
    types: &TypeMeta,
) -> Option<Result<(ChangeKind, DynamicObject)>> {
    let (change, obj) = match event {
        WatchEvent::Added(obj) => (ChangeKind::Create, obj),
        WatchEvent::Modified(obj) => (ChangeKind::Update, obj),
        WatchEvent::Deleted(obj) => (ChangeKind::Delete, obj),
        WatchEvent::Bookmark(_) => return None,
        WatchEvent::Error(e) => {
            return Some(Err(anyhow!(
                "Watch error for {}: {} ({})",
                kind,
                e.message,
                e.code
            )));
        }
    };
    Some(Ok((change, with_types(obj, types))))
}

/// List items don't carry apiVersion/kind; handlers expect them
fn with_types(mut obj: DynamicObject, types: &TypeMeta) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(types.clone());
    }
    obj
}

/// Check if an error is retryable (transient failures)
fn is_retryable_error(err: &kube::Error) -> bool {
    match err {
        // Network/connection errors are retryable
        kube::Error::HyperError(_) => true,
        // API errors: retry on 429 (rate limit), 503 (unavailable), 504 (timeout)
        kube::Error::Api(api_err) => matches!(api_err.code, 429 | 503 | 504),
        _ => false,
    }
}

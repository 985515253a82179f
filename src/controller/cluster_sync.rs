//! ClusterSync controller implementation
//!
//! One reconcile is one sync pass for one descriptor: read it fresh, resolve
//! the remote client, propagate every opted-in `ReportVulnerabilities`, and
//! record the outcome in the descriptor status. Failures during the pass end
//! up in the status, not in the returned `Result`; only a failed status write
//! is handed to the runtime's error policy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::registry::{DescriptorKey, Gate, PassRegistry};
use crate::config::SyncConfig;
use crate::crd::{ClusterSync, ClusterSyncStatus, ReportVulnerabilities};
use crate::kube_utils::with_deadline;
use crate::propagate::{propagate, PropagateOutcome};
use crate::remote::{ConnectionResolver, RemoteClient, RemoteResolver};
use crate::requeue::Backoff;
use crate::{Error, FIELD_MANAGER};

/// Requeue after a failed status write
const STATUS_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Failed items named in the status message
const MAX_LISTED_FAILURES: usize = 10;

/// Longest description of one failed item in the status message
const MAX_FAILURE_DETAIL_CHARS: usize = 256;

/// Trait abstracting local Kubernetes operations for the ClusterSync controller
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch a ClusterSync, `None` if it was deleted
    async fn get_cluster_sync(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ClusterSync>, Error>;

    /// List tracked resources in all namespaces matching the label selector
    async fn list_tracked(
        &self,
        label_selector: &str,
    ) -> Result<Vec<ReportVulnerabilities>, Error>;

    /// Merge-patch the status of a ClusterSync
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ClusterSyncStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
    call_timeout: Duration,
    cancel: CancellationToken,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client, call_timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            client,
            call_timeout,
            cancel,
        }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_cluster_sync(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ClusterSync>, Error> {
        let api: Api<ClusterSync> = Api::namespaced(self.client.clone(), namespace);
        with_deadline(
            "get ClusterSync",
            self.call_timeout,
            &self.cancel,
            async { api.get_opt(name).await.map_err(Error::from) },
        )
        .await
    }

    async fn list_tracked(
        &self,
        label_selector: &str,
    ) -> Result<Vec<ReportVulnerabilities>, Error> {
        let api: Api<ReportVulnerabilities> = Api::all(self.client.clone());
        let params = ListParams::default().labels(label_selector);
        with_deadline(
            "list tracked resources",
            self.call_timeout,
            &self.cancel,
            async {
                api.list(&params)
                    .await
                    .map(|list| list.items)
                    .map_err(Error::from)
            },
        )
        .await
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ClusterSyncStatus,
    ) -> Result<(), Error> {
        let api: Api<ClusterSync> = Api::namespaced(self.client.clone(), namespace);
        let patch = status.merge_patch();
        with_deadline(
            "patch ClusterSync status",
            self.call_timeout,
            &self.cancel,
            async {
                api.patch_status(
                    name,
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Merge(&patch),
                )
                .await
                .map(|_| ())
                .map_err(Error::from)
            },
        )
        .await
    }
}

/// Controller context containing shared state and clients
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .config(config)
///     .cancel_token(token)
///     .build();
/// ```
pub struct Context {
    /// Local cluster operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Remote connection resolver
    pub resolver: Arc<dyn ConnectionResolver>,
    /// Per-descriptor pass bookkeeping, shared with the observer
    pub registry: Arc<PassRegistry>,
    /// Runtime configuration
    pub config: SyncConfig,
    /// Error requeue schedule derived from `config`
    pub backoff: Backoff,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Assemble a context from explicit parts
    ///
    /// Used by the builder and by tests that run against in-memory clusters.
    pub fn from_parts(
        kube: Arc<dyn KubeClient>,
        resolver: Arc<dyn ConnectionResolver>,
        registry: Arc<PassRegistry>,
        config: SyncConfig,
    ) -> Self {
        let backoff = Backoff::new(config.error_requeue_interval, config.max_error_backoff);
        Self {
            kube,
            resolver,
            registry,
            config,
            backoff,
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    resolver: Option<Arc<dyn ConnectionResolver>>,
    registry: Option<Arc<PassRegistry>>,
    config: SyncConfig,
    cancel: CancellationToken,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            resolver: None,
            registry: None,
            config: SyncConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Set the runtime configuration
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the token that aborts in-flight calls on shutdown
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Share a pass registry (the observer needs the same one)
    pub fn registry(mut self, registry: Arc<PassRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Override the local Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the remote connection resolver (primarily for testing)
    pub fn resolver(mut self, resolver: Arc<dyn ConnectionResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let kube = self.kube.unwrap_or_else(|| {
            Arc::new(KubeClientImpl::new(
                self.client.clone(),
                self.config.call_timeout,
                self.cancel.clone(),
            ))
        });
        let resolver = self.resolver.unwrap_or_else(|| {
            Arc::new(RemoteResolver::from_client(
                self.client.clone(),
                &self.config,
                self.cancel.clone(),
            ))
        });
        Context::from_parts(
            kube,
            resolver,
            self.registry.unwrap_or_default(),
            self.config,
        )
    }
}

/// Result of propagating the opted-in resources of one pass
#[derive(Debug, Default)]
pub struct PassReport {
    /// Resources considered
    pub total: usize,
    /// Resources whose remote payload matches after the pass
    pub synced: usize,
    /// Resources written to the remote cluster
    pub written: usize,
    /// Failed resources as (`namespace/name`, error), sorted by key
    pub failures: Vec<(String, Error)>,
}

impl PassReport {
    /// Status message describing the failed items
    ///
    /// Names at most ten failures, each cut to 256 characters, followed by a
    /// count of the rest. The status must fit in the object even when every
    /// item of a large batch fails.
    pub fn error_message(&self) -> String {
        let mut details: Vec<String> = self
            .failures
            .iter()
            .take(MAX_LISTED_FAILURES)
            .map(|(key, err)| truncate_chars(&format!("{key}: {err}"), MAX_FAILURE_DETAIL_CHARS))
            .collect();
        let unlisted = self.failures.len().saturating_sub(MAX_LISTED_FAILURES);
        if unlisted > 0 {
            details.push(format!("and {unlisted} more"));
        }
        format!(
            "failed to sync {} of {} resources: {}",
            self.failures.len(),
            self.total,
            details.join("; ")
        )
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Reconcile a ClusterSync resource
///
/// Runs at most one sync pass, gated by the pass registry, and always
/// schedules a requeue unless the descriptor is gone.
#[instrument(
    skip(cluster_sync, ctx),
    fields(
        cluster_sync = %cluster_sync.name_any(),
        namespace = %cluster_sync.namespace().unwrap_or_default()
    )
)]
pub async fn reconcile(cluster_sync: Arc<ClusterSync>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = cluster_sync.name_any();
    let namespace = cluster_sync.namespace().unwrap_or_default();
    let key = DescriptorKey::new(&namespace, &name);

    // The cached object may lag behind; always work from a fresh read
    let Some(descriptor) = ctx.kube.get_cluster_sync(&namespace, &name).await? else {
        info!("ClusterSync deleted, dropping cached state");
        ctx.registry.forget(&key);
        ctx.resolver.evict(&namespace, &name);
        return Ok(Action::await_change());
    };

    let generation = descriptor.metadata.generation;
    match ctx.registry.gate(&key, generation) {
        Gate::Wait(remaining) => {
            debug!(remaining_secs = remaining.as_secs(), "no pass due");
            return Ok(Action::requeue(remaining));
        }
        Gate::Run(reason) => debug!(?reason, "starting sync pass"),
    }

    let (status, requeue) = match run_pass(&descriptor, &ctx).await {
        Ok(report) if report.failures.is_empty() => {
            info!(
                resources = report.total,
                written = report.written,
                "sync pass completed"
            );
            ctx.registry
                .record_success(&key, generation, ctx.config.resync_interval);
            let status = ClusterSyncStatus::synced(Utc::now())
                .observed_generation(generation)
                .resources(report.synced, 0);
            (status, ctx.config.resync_interval)
        }
        Ok(report) => {
            let message = report.error_message();
            warn!(
                failed = report.failures.len(),
                resources = report.total,
                error = %message,
                "sync pass completed with failures"
            );
            let delay = ctx.registry.record_failure(&key, generation, &ctx.backoff);
            let status = ClusterSyncStatus::failed(message)
                .observed_generation(generation)
                .resources(report.synced, report.failures.len());
            (status, delay)
        }
        Err(e) => {
            warn!(error = %e, retryable = e.is_retryable(), "sync pass failed");
            let delay = ctx.registry.record_failure(&key, generation, &ctx.backoff);
            let status = ClusterSyncStatus::failed(e.to_string())
                .observed_generation(generation);
            (status, delay)
        }
    };

    if let Err(e) = ctx.kube.patch_status(&namespace, &name, &status).await {
        // The pass outcome was not recorded, so the retry must run a pass again
        ctx.registry.mark_dirty(&key);
        return Err(e);
    }

    Ok(Action::requeue(requeue))
}

/// Resolve the remote cluster and propagate every opted-in resource once
///
/// Errors returned here abort the pass before any item was attempted.
/// Per-item failures are collected in the report instead.
pub async fn run_pass(descriptor: &ClusterSync, ctx: &Context) -> Result<PassReport, Error> {
    let remote = ctx.resolver.resolve(descriptor).await?;

    let config = &ctx.config;
    let items: Vec<ReportVulnerabilities> = ctx
        .kube
        .list_tracked(&config.label_selector())
        .await?
        .into_iter()
        .filter(|r| r.is_opted_in(&config.sync_label_key, &config.sync_label_value))
        .collect();

    Ok(propagate_all(items, remote, config).await)
}

/// Propagate a batch with bounded concurrency
///
/// Every item is attempted exactly once, in no particular order. A failed
/// item neither stops the others nor undoes their writes.
pub async fn propagate_all(
    items: Vec<ReportVulnerabilities>,
    remote: Arc<dyn RemoteClient>,
    config: &SyncConfig,
) -> PassReport {
    let total = items.len();
    let concurrency = config.propagate_concurrency.max(1);
    // Futures own their item and config; borrowed items break the runtime's Send bound
    let results: Vec<(String, Result<PropagateOutcome, Error>)> =
        futures::stream::iter(items.into_iter().map(|item| {
            let remote = remote.clone();
            let config = config.clone();
            async move {
                let outcome = propagate(&item, remote.as_ref(), &config).await;
                (item.key(), outcome)
            }
        }))
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let mut report = PassReport {
        total,
        ..Default::default()
    };
    for (key, result) in results {
        match result {
            Ok(outcome) => {
                report.synced += 1;
                if outcome.wrote() {
                    report.written += 1;
                }
            }
            Err(e) => {
                debug!(resource = %key, error = %e, "propagation failed");
                report.failures.push((key, e));
            }
        }
    }
    report.failures.sort_by(|a, b| a.0.cmp(&b.0));
    report
}

/// Error policy for the ClusterSync controller
///
/// Only failed status writes reach this point; everything else is already
/// recorded in the status by `reconcile`.
pub fn error_policy(cluster_sync: Arc<ClusterSync>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster_sync = %cluster_sync.name_any(),
        "reconciliation failed"
    );
    Action::requeue(STATUS_RETRY_INTERVAL)
}

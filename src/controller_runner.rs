//! Controller runner - builds the controller future
//!
//! Returns a boxed future that the caller drives. This keeps controller
//! construction pure and the binary free of wiring details.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::controller::{descriptors_to_trigger, error_policy, reconcile, Context, PassRegistry};
use crate::crd::{ClusterSync, ReportVulnerabilities};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the ClusterSync controller with the ReportVulnerabilities observer
///
/// Both producers feed one queue: ClusterSync events and requeues drive
/// reconciles directly, while opted-in ReportVulnerabilities changes are
/// mapped onto every known descriptor. The future completes on SIGINT or
/// SIGTERM once in-flight reconciles have drained; `cancel` aborts their
/// pending API calls.
pub fn build_sync_controller(
    client: Client,
    config: SyncConfig,
    cancel: CancellationToken,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let registry = Arc::new(PassRegistry::new());
    let observer_config = config.clone();
    let observer_registry = registry.clone();

    let ctx = Arc::new(
        Context::builder(client.clone())
            .config(config)
            .registry(registry)
            .cancel_token(cancel)
            .build(),
    );

    let descriptors: Api<ClusterSync> = Api::all(client.clone());
    let reports: Api<ReportVulnerabilities> = Api::all(client);

    tracing::info!("- ClusterSync controller");
    tracing::info!("- ReportVulnerabilities observer");

    Box::pin(
        Controller::new(
            descriptors,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .watches(
            reports,
            WatcherConfig::default()
                .timeout(WATCH_TIMEOUT_SECS)
                .labels(&observer_config.label_selector()),
            move |report| descriptors_to_trigger(&report, &observer_registry, &observer_config),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("ClusterSync")),
    )
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

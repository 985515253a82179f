//! Resonance controller - multi-cluster resource synchronization

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use resonance::config::{MissingRemotePolicy, SyncConfig};
use resonance::controller_runner::build_sync_controller;
use resonance::crd::{ClusterSync, ReportVulnerabilities};
use resonance::{DEFAULT_KUBECONFIG_KEY, DEFAULT_SYNC_LABEL_KEY, DEFAULT_SYNC_LABEL_VALUE};

/// Resonance - propagate opted-in resources from this cluster to a master cluster
#[derive(Parser, Debug)]
#[command(name = "resonance", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "RESONANCE_LOG_JSON")]
    log_json: bool,

    #[command(flatten)]
    sync: SyncArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Installs the CRDs, then watches ClusterSync and ReportVulnerabilities
    /// resources until SIGINT or SIGTERM.
    Controller,
}

/// Sync behavior, shared by every ClusterSync
#[derive(Args, Debug)]
struct SyncArgs {
    /// Seconds between passes while everything is in sync
    #[arg(long, env = "RESONANCE_RESYNC_SECS", default_value_t = 60)]
    resync_secs: u64,

    /// Seconds before retrying after the first failed pass
    #[arg(long, env = "RESONANCE_ERROR_REQUEUE_SECS", default_value_t = 30)]
    error_requeue_secs: u64,

    /// Upper bound in seconds for the error retry delay
    #[arg(long, env = "RESONANCE_MAX_ERROR_BACKOFF_SECS", default_value_t = 300)]
    max_error_backoff_secs: u64,

    /// Deadline in seconds for each API call
    #[arg(long, env = "RESONANCE_CALL_TIMEOUT_SECS", default_value_t = 15)]
    call_timeout_secs: u64,

    /// TCP connect timeout in seconds for remote clusters
    #[arg(long, env = "RESONANCE_CONNECT_TIMEOUT_SECS", default_value_t = 5)]
    connect_timeout_secs: u64,

    /// Read timeout in seconds for remote clusters
    #[arg(long, env = "RESONANCE_READ_TIMEOUT_SECS", default_value_t = 30)]
    read_timeout_secs: u64,

    /// Label key that opts a resource into propagation
    #[arg(long, env = "RESONANCE_SYNC_LABEL_KEY", default_value = DEFAULT_SYNC_LABEL_KEY)]
    sync_label_key: String,

    /// Label value that opts a resource into propagation
    #[arg(long, env = "RESONANCE_SYNC_LABEL_VALUE", default_value = DEFAULT_SYNC_LABEL_VALUE)]
    sync_label_value: String,

    /// Secret key holding the kubeconfig when a ClusterSync does not name one
    #[arg(long, env = "RESONANCE_KUBECONFIG_KEY", default_value = DEFAULT_KUBECONFIG_KEY)]
    kubeconfig_key: String,

    /// What to do when a resource is missing remotely (report or create)
    #[arg(long, env = "RESONANCE_MISSING_REMOTE", default_value = "report")]
    missing_remote: MissingRemotePolicy,

    /// Probe the remote API server when resolving credentials
    #[arg(long, env = "RESONANCE_EAGER_CONNECT")]
    eager_connect: bool,

    /// Resources propagated concurrently within one pass
    #[arg(long, env = "RESONANCE_PROPAGATE_CONCURRENCY", default_value_t = 8)]
    propagate_concurrency: usize,
}

impl From<SyncArgs> for SyncConfig {
    fn from(args: SyncArgs) -> Self {
        Self {
            resync_interval: Duration::from_secs(args.resync_secs),
            error_requeue_interval: Duration::from_secs(args.error_requeue_secs),
            max_error_backoff: Duration::from_secs(args.max_error_backoff_secs),
            call_timeout: Duration::from_secs(args.call_timeout_secs),
            connect_timeout: Duration::from_secs(args.connect_timeout_secs),
            read_timeout: Duration::from_secs(args.read_timeout_secs),
            sync_label_key: args.sync_label_key,
            sync_label_value: args.sync_label_value,
            kubeconfig_key: args.kubeconfig_key,
            missing_remote: args.missing_remote,
            eager_connect: args.eager_connect,
            propagate_concurrency: args.propagate_concurrency,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - aws-lc-rs backs every TLS connection,
    // including the ones to remote clusters.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    if cli.crd {
        for crd in [ClusterSync::crd(), ReportVulnerabilities::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    let config = SyncConfig::from(cli.sync);
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(config).await,
    }
}

/// Ensure all Resonance CRDs are installed
///
/// The controller installs its own CRDs on startup using server-side apply.
/// This ensures the CRD versions always match the controller version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(resonance::FIELD_MANAGER).force();

    tracing::info!("Installing ClusterSync CRD...");
    crds.patch(
        ClusterSync::crd_name(),
        &params,
        &Patch::Apply(&ClusterSync::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install ClusterSync CRD: {}", e))?;

    tracing::info!("Installing ReportVulnerabilities CRD...");
    crds.patch(
        ReportVulnerabilities::crd_name(),
        &params,
        &Patch::Apply(&ReportVulnerabilities::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install ReportVulnerabilities CRD: {}", e))?;

    tracing::info!("All Resonance CRDs installed/updated");
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM
async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received, aborting in-flight calls");
    token.cancel();
}

/// Run the controller until a shutdown signal arrives
async fn run_controller(config: SyncConfig) -> anyhow::Result<()> {
    tracing::info!(
        resync_secs = config.resync_interval.as_secs(),
        label_selector = %config.label_selector(),
        missing_remote = %config.missing_remote,
        "Resonance controller starting..."
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    // Controller installs its own CRDs on startup
    ensure_crds_installed(&client).await?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    tracing::info!("Starting Resonance controllers...");
    build_sync_controller(client, config, cancel).await;

    tracing::info!("Resonance controller shutting down");
    Ok(())
}

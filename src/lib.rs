//! Resonance - multi-cluster resource synchronization controller
//!
//! Resonance runs in an "agent" cluster, watches opted-in
//! `ReportVulnerabilities` resources and pushes their payload to a "master"
//! cluster whose kubeconfig is referenced by a `ClusterSync` descriptor.
//!
//! # Architecture
//!
//! - A `ClusterSync` names a secret holding the master cluster kubeconfig
//! - Every pass lists opted-in resources locally and overwrites the remote
//!   payload wherever it differs
//! - The outcome of each pass is written to `ClusterSync.status`
//! - Local resource changes trigger a pass immediately instead of waiting for
//!   the periodic requeue
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (ClusterSync, ReportVulnerabilities)
//! - [`controller`] - Connection and observer reconciliation logic
//! - [`controller_runner`] - Wiring of the reconcilers into kube-rs controllers
//! - [`remote`] - Remote cluster client and connection resolver
//! - [`propagate`] - Diff and propagate engine for a single resource
//! - [`config`] - Runtime configuration
//! - [`kube_utils`] - Deadlines, kubeconfig parsing and client construction
//! - [`requeue`] - Error requeue backoff
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod controller_runner;
pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod propagate;
pub mod remote;
pub mod requeue;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Label key that opts a ReportVulnerabilities into propagation
pub const DEFAULT_SYNC_LABEL_KEY: &str = "clusterSync";

/// Label value that opts a ReportVulnerabilities into propagation
pub const DEFAULT_SYNC_LABEL_VALUE: &str = "true";

/// Secret data key holding the remote kubeconfig
pub const DEFAULT_KUBECONFIG_KEY: &str = "kubeconfig";

/// Field manager used for status patches and CRD installation
pub const FIELD_MANAGER: &str = "resonance-controller";

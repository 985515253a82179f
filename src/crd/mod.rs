//! Custom Resource Definitions for Resonance
//!
//! This module contains all CRD definitions used by the controller.

mod cluster_sync;
mod report;
mod types;

pub use cluster_sync::{ClusterSync, ClusterSyncSpec, ClusterSyncStatus};
pub use report::{ReportVulnerabilities, ReportVulnerabilitiesSpec, ReportVulnerabilitiesStatus};
pub use types::{RemoteConfig, SyncStatus};

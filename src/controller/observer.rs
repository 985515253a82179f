//! Resource observer
//!
//! Maps `ReportVulnerabilities` watch events onto the `ClusterSync`
//! descriptors that should run a pass. It never talks to either cluster; it
//! only marks descriptors dirty so the pass gate lets the next reconcile
//! through. Without it local changes still propagate, just on the next
//! periodic requeue.

use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tracing::{debug, info};

use super::registry::PassRegistry;
use crate::config::SyncConfig;
use crate::crd::{ClusterSync, ReportVulnerabilities};

/// Descriptors to enqueue for a changed tracked resource
///
/// Resources without the opt-in label map to nothing. For opted-in ones
/// every known descriptor is marked dirty and returned.
pub fn descriptors_to_trigger(
    report: &ReportVulnerabilities,
    registry: &PassRegistry,
    config: &SyncConfig,
) -> Vec<ObjectRef<ClusterSync>> {
    if !report.is_opted_in(&config.sync_label_key, &config.sync_label_value) {
        debug!(resource = %report.key(), "ignoring resource without sync label");
        return vec![];
    }

    info!(
        resource = %report.name_any(),
        namespace = %report.namespace().unwrap_or_default(),
        payload_bytes = report.spec.data.len(),
        "tracked resource changed"
    );

    registry
        .mark_all_dirty()
        .into_iter()
        .map(|key| ObjectRef::<ClusterSync>::new(&key.name).within(&key.namespace))
        .collect()
}

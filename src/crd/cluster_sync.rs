//! ClusterSync Custom Resource Definition
//!
//! A ClusterSync describes one agent-to-master link: where the remote
//! cluster's kubeconfig lives, and (in its status) how the last propagation
//! pass went.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{RemoteConfig, SyncStatus};

/// Specification for a ClusterSync
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "sync.resonance.io",
    version = "v1",
    kind = "ClusterSync",
    plural = "clustersyncs",
    shortname = "csync",
    status = "ClusterSyncStatus",
    namespaced,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.syncStatus"}"#,
    printcolumn = r#"{"name":"Last Sync","type":"date","jsonPath":".status.lastSyncTime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSyncSpec {
    /// Where to find the remote cluster's kubeconfig
    pub remote_config: RemoteConfig,

    /// Data key of the kubeconfig inside the secret (controller default if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

impl ClusterSyncSpec {
    /// Validate the descriptor
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.remote_config.validate()?;
        if matches!(self.secret_key.as_deref(), Some(k) if k.trim().is_empty()) {
            return Err(crate::Error::validation(
                "spec.secretKey must not be empty when set",
            ));
        }
        Ok(())
    }
}

/// Status for a ClusterSync
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSyncStatus {
    /// Completion time of the last fully successful pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,

    /// Outcome of the last pass
    #[serde(default)]
    pub sync_status: SyncStatus,

    /// Why the last pass failed; set iff `syncStatus` is `Error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Generation of the spec the last pass ran against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Resources that matched the remote cluster after the last pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_resources: Option<i32>,

    /// Resources that failed to propagate in the last pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_resources: Option<i32>,
}

impl ClusterSyncStatus {
    /// Status for a fully successful pass completed at `at`
    pub fn synced(at: DateTime<Utc>) -> Self {
        Self {
            last_sync_time: Some(at),
            sync_status: SyncStatus::Synced,
            ..Default::default()
        }
    }

    /// Status for a failed pass
    ///
    /// `last_sync_time` stays unset, so [`merge_patch`](Self::merge_patch)
    /// leaves the stored value alone: a failure never moves it. An empty
    /// message is replaced so that an `Error` status always explains itself.
    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            "sync failed without an error message".to_string()
        } else {
            message
        };
        Self {
            sync_status: SyncStatus::Error,
            error_message: Some(message),
            ..Default::default()
        }
    }

    /// Set the observed generation and return self for chaining
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Set the per-resource counters and return self for chaining
    pub fn resources(mut self, synced: usize, failed: usize) -> Self {
        self.synced_resources = Some(i32::try_from(synced).unwrap_or(i32::MAX));
        self.failed_resources = Some(i32::try_from(failed).unwrap_or(i32::MAX));
        self
    }

    /// Returns true if `errorMessage` is non-empty exactly when the status is `Error`
    pub fn is_consistent(&self) -> bool {
        let has_message = self
            .error_message
            .as_deref()
            .is_some_and(|m| !m.is_empty());
        has_message == (self.sync_status == SyncStatus::Error)
    }

    /// Body of a merge patch that writes this status
    ///
    /// Unlike plain serialization, absent optional fields are sent as `null`
    /// so a `Synced` write clears a stale `errorMessage`. `lastSyncTime` is the
    /// exception: it is omitted when unset, leaving the stored value alone.
    pub fn merge_patch(&self) -> serde_json::Value {
        let mut status = serde_json::json!({
            "syncStatus": self.sync_status,
            "errorMessage": self.error_message,
            "observedGeneration": self.observed_generation,
            "syncedResources": self.synced_resources,
            "failedResources": self.failed_resources,
        });
        if let (Some(at), Some(map)) = (self.last_sync_time, status.as_object_mut()) {
            map.insert(
                "lastSyncTime".to_string(),
                serde_json::Value::String(at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
            );
        }
        serde_json::json!({ "status": status })
    }
}

//! ReportVulnerabilities Custom Resource Definition
//!
//! The resource kind propagated from the agent cluster to the master cluster.
//! Only `spec.data` is compared and copied; cross-cluster identity is the
//! (namespace, name) pair.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a ReportVulnerabilities
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "sync.resonance.io",
    version = "v1",
    kind = "ReportVulnerabilities",
    plural = "reportvulnerabilities",
    shortname = "rvuln",
    status = "ReportVulnerabilitiesStatus",
    namespaced,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ReportVulnerabilitiesSpec {
    /// The synchronized payload
    #[serde(default)]
    pub data: String,
}

/// Status for a ReportVulnerabilities (reserved)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ReportVulnerabilitiesStatus {}

impl ReportVulnerabilities {
    /// Returns true if the object carries `key=value` among its labels
    pub fn is_opted_in(&self, key: &str, value: &str) -> bool {
        self.labels().get(key).is_some_and(|v| v == value)
    }

    /// `namespace/name` for logs and error messages
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }

    /// Build the object to create on the remote cluster for this local one
    ///
    /// Carries identity, the sync label and the spec only; server-managed
    /// metadata (uid, resourceVersion, managedFields) is left for the remote
    /// API server to fill in.
    pub fn remote_copy(&self, label_key: &str, label_value: &str) -> Self {
        let mut copy = ReportVulnerabilities::new(&self.name_any(), self.spec.clone());
        copy.metadata.namespace = self.namespace();
        copy.metadata.labels = Some(BTreeMap::from([(
            label_key.to_string(),
            label_value.to_string(),
        )]));
        copy
    }
}

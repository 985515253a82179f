//! Supporting types for the ClusterSync CRD

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Outcome of the most recent reconcile pass of a ClusterSync
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum SyncStatus {
    /// No pass has completed yet
    #[default]
    Pending,
    /// Every opted-in resource matched the remote cluster after the last pass
    Synced,
    /// The last pass failed (resolution, listing, or at least one resource)
    Error,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Synced => write!(f, "Synced"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Reference to the secret holding the remote cluster's kubeconfig
///
/// Credentials never live in the ClusterSync itself: the descriptor is watched
/// and logged, the secret is not.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    /// Name of the secret containing the kubeconfig for the remote cluster
    pub secret_name: String,
    /// Namespace where the kubeconfig secret is stored
    pub secret_namespace: String,
}

impl RemoteConfig {
    /// Validate that both coordinates are set
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.secret_name.trim().is_empty() {
            return Err(crate::Error::validation(
                "spec.remoteConfig.secretName must not be empty",
            ));
        }
        if self.secret_namespace.trim().is_empty() {
            return Err(crate::Error::validation(
                "spec.remoteConfig.secretNamespace must not be empty",
            ));
        }
        Ok(())
    }
}

//! Controller configuration
//!
//! `SyncConfig` is built once at startup (from CLI flags and `RESONANCE_*`
//! environment variables in `main.rs`) and shared read-only by every
//! reconcile through the controller `Context`.

use std::time::Duration;

use crate::{
    DEFAULT_KUBECONFIG_KEY, DEFAULT_SYNC_LABEL_KEY, DEFAULT_SYNC_LABEL_VALUE,
};

/// What to do when an opted-in resource has no counterpart on the remote cluster
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MissingRemotePolicy {
    /// Report `RemoteNotFound` for the item and leave the remote cluster alone
    #[default]
    Report,
    /// Create the remote object from the local one
    Create,
}

impl std::str::FromStr for MissingRemotePolicy {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "report" => Ok(Self::Report),
            "create" => Ok(Self::Create),
            _ => Err(crate::Error::validation(format!(
                "invalid missing-remote policy: {s}, expected one of: report, create"
            ))),
        }
    }
}

impl std::fmt::Display for MissingRemotePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Report => write!(f, "report"),
            Self::Create => write!(f, "create"),
        }
    }
}

/// Runtime configuration for the sync controllers
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Requeue interval after a successful pass (drift detection backstop)
    pub resync_interval: Duration,
    /// Requeue interval after the first failed pass
    pub error_requeue_interval: Duration,
    /// Upper bound for the error requeue interval as failures accumulate
    pub max_error_backoff: Duration,
    /// Deadline for every individual API call
    pub call_timeout: Duration,
    /// TCP connect timeout for remote cluster clients
    pub connect_timeout: Duration,
    /// Read timeout for remote cluster clients
    pub read_timeout: Duration,
    /// Label key that opts a resource into propagation
    pub sync_label_key: String,
    /// Label value that opts a resource into propagation
    pub sync_label_value: String,
    /// Secret data key holding the kubeconfig when the descriptor does not name one
    pub kubeconfig_key: String,
    /// Behavior when a resource is missing remotely
    pub missing_remote: MissingRemotePolicy,
    /// Probe the remote API server while resolving instead of on first use
    pub eager_connect: bool,
    /// Maximum number of resources propagated concurrently within one pass
    pub propagate_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(60),
            error_requeue_interval: Duration::from_secs(30),
            max_error_backoff: Duration::from_secs(300),
            call_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            sync_label_key: DEFAULT_SYNC_LABEL_KEY.to_string(),
            sync_label_value: DEFAULT_SYNC_LABEL_VALUE.to_string(),
            kubeconfig_key: DEFAULT_KUBECONFIG_KEY.to_string(),
            missing_remote: MissingRemotePolicy::Report,
            eager_connect: false,
            propagate_concurrency: 8,
        }
    }
}

impl SyncConfig {
    /// Label selector string for listing opted-in resources
    pub fn label_selector(&self) -> String {
        format!("{}={}", self.sync_label_key, self.sync_label_value)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.sync_label_key.is_empty() {
            return Err(crate::Error::validation("sync label key must not be empty"));
        }
        if self.kubeconfig_key.is_empty() {
            return Err(crate::Error::validation("kubeconfig key must not be empty"));
        }
        if self.propagate_concurrency == 0 {
            return Err(crate::Error::validation(
                "propagate concurrency must be at least 1",
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(crate::Error::validation("call timeout must be positive"));
        }
        if self.max_error_backoff < self.error_requeue_interval {
            return Err(crate::Error::validation(
                "max error backoff must not be shorter than the error requeue interval",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_config_is_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.label_selector(), "clusterSync=true");
        assert_eq!(config.missing_remote, MissingRemotePolicy::Report);
    }

    #[rstest]
    #[case("report", MissingRemotePolicy::Report)]
    #[case("Create", MissingRemotePolicy::Create)]
    fn policy_parses_case_insensitively(#[case] input: &str, #[case] expected: MissingRemotePolicy) {
        assert_eq!(input.parse::<MissingRemotePolicy>().unwrap(), expected);
        assert_eq!(expected.to_string(), input.to_lowercase());
    }

    #[test]
    fn unknown_policy_is_rejected() {
        let err = "delete".parse::<MissingRemotePolicy>().unwrap_err();
        assert!(err.to_string().contains("report, create"));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = SyncConfig {
            propagate_concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_cap_below_base_is_rejected() {
        let config = SyncConfig {
            error_requeue_interval: Duration::from_secs(60),
            max_error_backoff: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

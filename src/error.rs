//! Error types for the Resonance controller
//!
//! Every failure a reconcile pass can hit is one of these variants. The
//! Connection Reconciler records them into `ClusterSync.status` instead of
//! propagating them, so the only errors that reach the controller runtime are
//! failures to write that status.

use thiserror::Error;

/// Main error type for Resonance operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error that has no more specific mapping
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Malformed descriptor or invalid configuration
    #[error("validation error: {0}")]
    Validation(String),

    /// The kubeconfig secret referenced by a ClusterSync does not exist
    #[error("kubeconfig secret {namespace}/{name} not found")]
    SecretNotFound {
        /// Secret name
        name: String,
        /// Secret namespace
        namespace: String,
    },

    /// The secret exists but its credential payload is unusable
    #[error("invalid credentials in secret {namespace}/{name}: {message}")]
    CredentialParse {
        /// Secret name
        name: String,
        /// Secret namespace
        namespace: String,
        /// What was wrong with the payload
        message: String,
    },

    /// The remote cluster API could not be reached
    #[error("cannot connect to remote cluster: {0}")]
    Connect(String),

    /// A call exceeded its deadline
    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Deadline that was exceeded
        timeout_secs: u64,
    },

    /// The call was aborted because the controller is shutting down
    #[error("{0} cancelled")]
    Cancelled(String),

    /// The tracked resource has no counterpart on the remote cluster
    #[error("remote resource {namespace}/{name} not found")]
    RemoteNotFound {
        /// Resource name
        name: String,
        /// Resource namespace
        namespace: String,
    },

    /// A concurrent remote write kept winning after the retry
    #[error("update conflict on remote resource {namespace}/{name}")]
    UpdateConflict {
        /// Resource name
        name: String,
        /// Resource namespace
        namespace: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a secret-not-found error
    pub fn secret_not_found(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::SecretNotFound {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Create a credential parse error for the given secret
    pub fn credential_parse(
        name: impl Into<String>,
        namespace: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::CredentialParse {
            name: name.into(),
            namespace: namespace.into(),
            message: msg.into(),
        }
    }

    /// Create a connect error with the given message
    pub fn connect(msg: impl Into<String>) -> Self {
        Self::Connect(msg.into())
    }

    /// Create a timeout error for an operation
    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_secs: timeout.as_secs(),
        }
    }

    /// Create a cancellation error for an operation
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled(operation.into())
    }

    /// Create a remote-not-found error
    pub fn remote_not_found(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::RemoteNotFound {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Create an update-conflict error
    pub fn update_conflict(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::UpdateConflict {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Everything is retried on the next requeue regardless; this only tells
    /// operators (and logs) whether a retry can succeed without someone fixing
    /// a resource first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(source) => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::Validation(_) => false,
            Error::SecretNotFound { .. } => true,
            Error::CredentialParse { .. } => false,
            Error::Connect(_) => true,
            Error::Timeout { .. } => true,
            Error::Cancelled(_) => true,
            Error::RemoteNotFound { .. } => true,
            Error::UpdateConflict { .. } => true,
        }
    }

    /// Returns true if this is a Kubernetes 409
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }
}

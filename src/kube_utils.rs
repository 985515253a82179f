//! Shared Kubernetes utilities using kube-rs
//!
//! Deadline/cancellation wrapping for API calls, kubeconfig parsing and
//! client construction for remote clusters.

use std::future::Future;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio_util::sync::CancellationToken;

use crate::Error;

/// Run an API call with a deadline, aborting early if `cancel` fires
///
/// The future is dropped as soon as either the deadline passes or the token is
/// cancelled, so no result is produced and then discarded.
pub async fn with_deadline<T, F>(
    operation: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::cancelled(operation)),
        result = tokio::time::timeout(timeout, fut) => match result {
            Ok(inner) => inner,
            Err(_) => Err(Error::timeout(operation, timeout)),
        },
    }
}

/// Parse kubeconfig bytes (YAML or JSON) into a typed kubeconfig
///
/// Errors are plain strings so the caller can attach secret coordinates.
pub fn parse_kubeconfig(data: &[u8]) -> Result<Kubeconfig, String> {
    let text = std::str::from_utf8(data).map_err(|e| format!("invalid kubeconfig UTF-8: {e}"))?;
    if text.trim().is_empty() {
        return Err("kubeconfig is empty".to_string());
    }

    let kubeconfig: Kubeconfig =
        serde_yaml::from_str(text).map_err(|e| format!("invalid kubeconfig YAML: {e}"))?;

    if kubeconfig.clusters.is_empty() {
        return Err("kubeconfig defines no clusters".to_string());
    }
    let has_context = kubeconfig.current_context.is_some() || !kubeconfig.contexts.is_empty();
    if !has_context && kubeconfig.clusters.len() > 1 {
        return Err("kubeconfig has several clusters but no context to pick one".to_string());
    }

    Ok(kubeconfig)
}

/// Build a kube client from a parsed kubeconfig with the given timeouts
///
/// Construction is lazy: no request is sent to the API server here.
pub async fn client_from_kubeconfig(
    kubeconfig: Kubeconfig,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::connect(format!("failed to build client config: {e}")))?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| Error::connect(format!("failed to create client: {e}")))
}

/// Hex SHA-256 digest of the input, used to key caches off content
pub fn content_fingerprint(input: &[u8]) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input);
    hash.as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

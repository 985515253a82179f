//! Remote cluster access
//!
//! [`RemoteClient`] is the narrow surface the propagate engine needs on the
//! master cluster: read, create and replace a `ReportVulnerabilities` by
//! (namespace, name). Handles are produced and cached by [`resolver`].

pub mod resolver;

use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::Client;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
use mockall::automock;

use crate::crd::ReportVulnerabilities;
use crate::kube_utils::with_deadline;
use crate::Error;

pub use resolver::{
    ConnectionResolver, KubeConnector, KubeSecretReader, RemoteConnector, RemoteResolver,
    SecretReader,
};

/// Operations on tracked resources in the remote cluster
///
/// Implementations enforce their own per-call deadline and abort when the
/// controller shuts down.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Fetch the remote counterpart, `None` if it does not exist
    async fn get_tracked(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReportVulnerabilities>, Error>;

    /// Replace the remote object
    ///
    /// The object must carry the `resourceVersion` it was read at; a stale
    /// version fails with a 409 (`Error::is_conflict`).
    async fn replace_tracked(
        &self,
        resource: &ReportVulnerabilities,
    ) -> Result<ReportVulnerabilities, Error>;

    /// Create the remote object
    async fn create_tracked(
        &self,
        resource: &ReportVulnerabilities,
    ) -> Result<ReportVulnerabilities, Error>;

    /// Check that the remote API server answers
    async fn probe(&self) -> Result<(), Error>;
}

/// Remote client backed by a kube-rs client for the master cluster
pub struct KubeRemoteClient {
    client: Client,
    call_timeout: Duration,
    cancel: CancellationToken,
}

impl KubeRemoteClient {
    /// Wrap a kube client built from the remote kubeconfig
    pub fn new(client: Client, call_timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            client,
            call_timeout,
            cancel,
        }
    }

    fn api(&self, namespace: &str) -> Api<ReportVulnerabilities> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn object_coordinates(resource: &ReportVulnerabilities) -> Result<(String, String), Error> {
    let name = resource
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::validation("resource has no metadata.name"))?;
    let namespace = resource
        .metadata
        .namespace
        .clone()
        .ok_or_else(|| Error::validation(format!("resource {name} has no metadata.namespace")))?;
    Ok((namespace, name))
}

#[async_trait]
impl RemoteClient for KubeRemoteClient {
    async fn get_tracked(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReportVulnerabilities>, Error> {
        let api = self.api(namespace);
        with_deadline(
            "get remote resource",
            self.call_timeout,
            &self.cancel,
            async { api.get_opt(name).await.map_err(Error::from) },
        )
        .await
    }

    async fn replace_tracked(
        &self,
        resource: &ReportVulnerabilities,
    ) -> Result<ReportVulnerabilities, Error> {
        let (namespace, name) = object_coordinates(resource)?;
        let api = self.api(&namespace);
        with_deadline(
            "update remote resource",
            self.call_timeout,
            &self.cancel,
            async {
                api.replace(&name, &PostParams::default(), resource)
                    .await
                    .map_err(Error::from)
            },
        )
        .await
    }

    async fn create_tracked(
        &self,
        resource: &ReportVulnerabilities,
    ) -> Result<ReportVulnerabilities, Error> {
        let (namespace, _) = object_coordinates(resource)?;
        let api = self.api(&namespace);
        with_deadline(
            "create remote resource",
            self.call_timeout,
            &self.cancel,
            async {
                api.create(&PostParams::default(), resource)
                    .await
                    .map_err(Error::from)
            },
        )
        .await
    }

    async fn probe(&self) -> Result<(), Error> {
        with_deadline(
            "probe remote API server",
            self.call_timeout,
            &self.cancel,
            async {
                self.client
                    .apiserver_version()
                    .await
                    .map(|_| ())
                    .map_err(Error::from)
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ReportVulnerabilitiesSpec;

    #[test]
    fn coordinates_require_name_and_namespace() {
        let mut r = ReportVulnerabilities::new(
            "r1",
            ReportVulnerabilitiesSpec {
                data: "v1".to_string(),
            },
        );
        let err = object_coordinates(&r).unwrap_err();
        assert!(err.to_string().contains("namespace"));

        r.metadata.namespace = Some("scans".to_string());
        assert_eq!(
            object_coordinates(&r).unwrap(),
            ("scans".to_string(), "r1".to_string())
        );
    }
}

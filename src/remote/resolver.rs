//! Remote Connection Resolver
//!
//! Turns a `ClusterSync` into a client for the master cluster: read the
//! referenced secret from the local cluster, pick the kubeconfig out of it,
//! build a kube client and cache it. The cache is keyed by the descriptor and
//! remembers a fingerprint of the credential bytes, so rotating the secret
//! content yields a fresh client on the next pass while unchanged credentials
//! reuse the existing one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::config::Kubeconfig;
use kube::{Client, ResourceExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use super::{KubeRemoteClient, RemoteClient};
use crate::config::SyncConfig;
use crate::crd::ClusterSync;
use crate::kube_utils::{
    client_from_kubeconfig, content_fingerprint, parse_kubeconfig, with_deadline,
};
use crate::Error;

/// Resolves a descriptor into a remote client handle
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionResolver: Send + Sync {
    /// Resolve the descriptor, reusing a cached handle when credentials are unchanged
    async fn resolve(&self, descriptor: &ClusterSync) -> Result<Arc<dyn RemoteClient>, Error>;

    /// Drop any cached handle for the descriptor `namespace/name`
    fn evict(&self, namespace: &str, name: &str);
}

/// Reads secrets from the local cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretReader: Send + Sync {
    /// Fetch a secret, `None` if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;
}

/// Builds a remote client from a parsed kubeconfig
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Construct a client for the cluster the kubeconfig points at
    async fn connect(&self, kubeconfig: Kubeconfig) -> Result<Arc<dyn RemoteClient>, Error>;
}

/// Secret reader backed by the local kube client
pub struct KubeSecretReader {
    client: Client,
    call_timeout: Duration,
    cancel: CancellationToken,
}

impl KubeSecretReader {
    /// Create a reader over the local cluster
    pub fn new(client: Client, call_timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            client,
            call_timeout,
            cancel,
        }
    }
}

#[async_trait]
impl SecretReader for KubeSecretReader {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        with_deadline(
            "get kubeconfig secret",
            self.call_timeout,
            &self.cancel,
            async { api.get_opt(name).await.map_err(Error::from) },
        )
        .await
    }
}

/// Connector producing [`KubeRemoteClient`] handles
pub struct KubeConnector {
    connect_timeout: Duration,
    read_timeout: Duration,
    call_timeout: Duration,
    cancel: CancellationToken,
}

impl KubeConnector {
    /// Create a connector using the timeouts from `config`
    pub fn new(config: &SyncConfig, cancel: CancellationToken) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            call_timeout: config.call_timeout,
            cancel,
        }
    }
}

#[async_trait]
impl RemoteConnector for KubeConnector {
    async fn connect(&self, kubeconfig: Kubeconfig) -> Result<Arc<dyn RemoteClient>, Error> {
        let client =
            client_from_kubeconfig(kubeconfig, self.connect_timeout, self.read_timeout).await?;
        Ok(Arc::new(KubeRemoteClient::new(
            client,
            self.call_timeout,
            self.cancel.clone(),
        )))
    }
}

struct CachedHandle {
    fingerprint: String,
    client: Arc<dyn RemoteClient>,
}

/// Caching resolver
///
/// Reads are lock-free through the `DashMap`; construction of a new handle is
/// serialized by `build_lock` so concurrent passes never build two clients for
/// the same credentials.
pub struct RemoteResolver {
    secrets: Arc<dyn SecretReader>,
    connector: Arc<dyn RemoteConnector>,
    default_key: String,
    eager_connect: bool,
    cache: DashMap<String, CachedHandle>,
    build_lock: Mutex<()>,
}

impl RemoteResolver {
    /// Create a resolver
    pub fn new(
        secrets: Arc<dyn SecretReader>,
        connector: Arc<dyn RemoteConnector>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            secrets,
            connector,
            default_key: config.kubeconfig_key.clone(),
            eager_connect: config.eager_connect,
            cache: DashMap::new(),
            build_lock: Mutex::new(()),
        }
    }

    /// Create a resolver that reads secrets and builds clients with kube-rs
    pub fn from_client(client: Client, config: &SyncConfig, cancel: CancellationToken) -> Self {
        Self::new(
            Arc::new(KubeSecretReader::new(
                client,
                config.call_timeout,
                cancel.clone(),
            )),
            Arc::new(KubeConnector::new(config, cancel)),
            config,
        )
    }

    /// Number of cached handles
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    fn lookup(&self, key: &str, fingerprint: &str) -> Option<Arc<dyn RemoteClient>> {
        self.cache
            .get(key)
            .filter(|entry| entry.fingerprint == fingerprint)
            .map(|entry| entry.client.clone())
    }
}

fn cache_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Pick the kubeconfig bytes out of a secret
///
/// An explicit key must exist. Without one, the default key is used, falling
/// back to the only entry of a single-key secret.
pub fn extract_kubeconfig<'a>(
    secret: &'a Secret,
    key: Option<&str>,
    default_key: &str,
) -> Result<&'a [u8], String> {
    let data = match secret.data.as_ref() {
        Some(data) if !data.is_empty() => data,
        _ => return Err("secret has no data".to_string()),
    };

    if let Some(key) = key {
        return data
            .get(key)
            .map(|v| v.0.as_slice())
            .ok_or_else(|| format!("secret has no key {key:?}"));
    }

    if let Some(value) = data.get(default_key) {
        return Ok(value.0.as_slice());
    }

    let mut values = data.values();
    match (values.next(), values.next()) {
        (Some(only), None) => Ok(only.0.as_slice()),
        _ => Err(format!(
            "secret has no key {default_key:?} and {} keys to choose from",
            data.len()
        )),
    }
}

#[async_trait]
impl ConnectionResolver for RemoteResolver {
    async fn resolve(&self, descriptor: &ClusterSync) -> Result<Arc<dyn RemoteClient>, Error> {
        descriptor.spec.validate()?;

        let remote = &descriptor.spec.remote_config;
        let secret_name = remote.secret_name.as_str();
        let secret_namespace = remote.secret_namespace.as_str();

        let secret = self
            .secrets
            .get_secret(secret_namespace, secret_name)
            .await?
            .ok_or_else(|| Error::secret_not_found(secret_name, secret_namespace))?;

        let bytes = extract_kubeconfig(
            &secret,
            descriptor.spec.secret_key.as_deref(),
            &self.default_key,
        )
        .map_err(|msg| Error::credential_parse(secret_name, secret_namespace, msg))?;

        let key = cache_key(
            &descriptor.namespace().unwrap_or_default(),
            &descriptor.name_any(),
        );
        let fingerprint = content_fingerprint(bytes);

        if let Some(client) = self.lookup(&key, &fingerprint) {
            return Ok(client);
        }

        let _guard = self.build_lock.lock().await;
        // Another pass may have built it while we waited
        if let Some(client) = self.lookup(&key, &fingerprint) {
            return Ok(client);
        }

        let kubeconfig = parse_kubeconfig(bytes)
            .map_err(|msg| Error::credential_parse(secret_name, secret_namespace, msg))?;
        let client = self.connector.connect(kubeconfig).await?;

        if self.eager_connect {
            client.probe().await.map_err(|e| match e {
                Error::Timeout { .. } | Error::Cancelled(_) => e,
                other => Error::connect(other.to_string()),
            })?;
        }

        let replaced = self
            .cache
            .insert(
                key.clone(),
                CachedHandle {
                    fingerprint,
                    client: client.clone(),
                },
            )
            .is_some();
        if replaced {
            info!(descriptor = %key, "remote credentials changed, rebuilt client");
        } else {
            debug!(descriptor = %key, "built remote client");
        }

        Ok(client)
    }

    fn evict(&self, namespace: &str, name: &str) {
        if self.cache.remove(&cache_key(namespace, name)).is_some() {
            debug!(descriptor = %cache_key(namespace, name), "evicted remote client");
        }
    }
}

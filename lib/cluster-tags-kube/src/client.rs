//! Kubernetes client for the cluster tags informers

use cluster_tags_core::Result;
use kube::Client;
use tracing::debug;

/// ClusterClient wraps the Kubernetes client used by the informers
pub struct ClusterClient {
    client: Client,
}

impl ClusterClient {
    /// Connect using the in-cluster config or the local kubeconfig
    pub async fn new() -> Result<Self> {
        let client = Client::try_default().await?;
        debug!("Kubernetes client ready, default namespace {}", client.default_namespace());
        Ok(Self { client })
    }

    /// Get the underlying Kubernetes client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get a clone of the Kubernetes client
    pub fn clone_client(&self) -> Client {
        self.client.clone()
    }
}

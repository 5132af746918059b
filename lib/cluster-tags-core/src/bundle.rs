//! Per-node metadata bundle mapping pods to the services that expose them

use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;
use tracing::trace;

/// ServicesMapper maps namespace -> pod name -> service names.
///
/// Pods and namespaces left without any service are pruned, so an empty
/// mapper never carries hollow entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServicesMapper {
    namespaces: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
}

impl ServicesMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `service` exposes `pod` in `namespace`
    pub fn set(&mut self, namespace: &str, pod: &str, service: &str) {
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .entry(pod.to_string())
            .or_default()
            .insert(service.to_string());
    }

    /// Remove `service` from every pod in `namespace`
    pub fn delete(&mut self, namespace: &str, service: &str) {
        let Some(pods) = self.namespaces.get_mut(namespace) else {
            return;
        };
        pods.retain(|_, services| {
            services.remove(service);
            !services.is_empty()
        });
        if pods.is_empty() {
            self.namespaces.remove(namespace);
        }
    }

    /// Services exposing `pod`, in sorted order
    pub fn services_for_pod(&self, namespace: &str, pod: &str) -> Option<Vec<String>> {
        self.namespaces
            .get(namespace)?
            .get(pod)
            .map(|services| services.iter().cloned().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    /// Number of (namespace, pod) entries
    pub fn pod_count(&self) -> usize {
        self.namespaces.values().map(BTreeMap::len).sum()
    }
}

/// MetadataMapperBundle holds the cluster-level metadata of a single node.
///
/// All access goes through the bundle's own methods; each mutation holds the
/// write lock for its whole delete/insert sequence.
#[derive(Debug, Default)]
pub struct MetadataMapperBundle {
    services: RwLock<ServicesMapper>,
}

impl MetadataMapperBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pods backing `service` in `namespace` with `pods`.
    ///
    /// Returns whether the bundle is empty afterwards.
    pub async fn map_service<'a, I>(&self, namespace: &str, service: &str, pods: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut services = self.services.write().await;
        services.delete(namespace, service);
        for pod in pods {
            services.set(namespace, pod, service);
        }
        trace!(
            "Mapped service {}/{}, bundle now holds {} pods",
            namespace,
            service,
            services.pod_count()
        );
        services.is_empty()
    }

    /// Drop `service` in `namespace` from every pod.
    ///
    /// Returns whether the bundle is empty afterwards.
    pub async fn remove_service(&self, namespace: &str, service: &str) -> bool {
        let mut services = self.services.write().await;
        services.delete(namespace, service);
        services.is_empty()
    }

    pub async fn services_for_pod(&self, namespace: &str, pod: &str) -> Option<Vec<String>> {
        self.services.read().await.services_for_pod(namespace, pod)
    }

    pub async fn is_empty(&self) -> bool {
        self.services.read().await.is_empty()
    }

    /// Copy of the current mapping
    pub async fn snapshot(&self) -> ServicesMapper {
        self.services.read().await.clone()
    }
}

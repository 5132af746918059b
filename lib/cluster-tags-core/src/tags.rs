//! Read path: cluster-level tags for a pod

use crate::{build_cache_key, MetadataMapperBundle, Result, SharedCache, TagsError};
use std::sync::Arc;
use tracing::trace;

/// Cache key prefix for per-node metadata bundles
pub const METADATA_MAPPER_CACHE_PREFIX: &str = "KubernetesMetadataMapping";

/// Tag name used for services exposing a pod
pub const KUBE_SERVICE_TAG: &str = "kube_service";

/// Cache key of the bundle for `node_name`
pub fn bundle_cache_key(node_name: &str) -> String {
    build_cache_key(&[METADATA_MAPPER_CACHE_PREFIX, node_name])
}

/// Fetch the bundle cached for `node_name`.
///
/// A miss is `Ok(None)`; a value of another type is an error.
pub async fn get_metadata_bundle(
    cache: &dyn SharedCache,
    node_name: &str,
) -> Result<Option<Arc<MetadataMapperBundle>>> {
    let key = bundle_cache_key(node_name);
    let Some(value) = cache.get(&key).await else {
        return Ok(None);
    };
    value
        .downcast::<MetadataMapperBundle>()
        .map(Some)
        .map_err(|_| TagsError::InvalidCacheFormat(key))
}

/// Cluster-level tags for `pod_name` in `namespace` running on `node_name`.
///
/// Missing data yields an empty list; only a corrupt cache entry is an error.
pub async fn get_pod_cluster_tags(
    cache: &dyn SharedCache,
    node_name: &str,
    namespace: &str,
    pod_name: &str,
) -> Result<Vec<String>> {
    let Some(bundle) = get_metadata_bundle(cache, node_name).await? else {
        trace!("No metadata was found for the pod {} on node {}", pod_name, node_name);
        return Ok(Vec::new());
    };

    let Some(services) = bundle.services_for_pod(namespace, pod_name).await else {
        trace!(
            "No cached services list found for the pod {} on the node {}",
            pod_name,
            node_name
        );
        return Ok(Vec::new());
    };

    trace!("Node {}, pod {}/{}: {} services", node_name, namespace, pod_name, services.len());
    Ok(services
        .iter()
        .map(|service| format!("{}:{}", KUBE_SERVICE_TAG, service))
        .collect())
}

/// ClusterTagsReader serves pod tags from a shared cache
#[derive(Clone)]
pub struct ClusterTagsReader {
    cache: Arc<dyn SharedCache>,
}

impl ClusterTagsReader {
    pub fn new(cache: Arc<dyn SharedCache>) -> Self {
        Self { cache }
    }

    pub async fn pod_tags(
        &self,
        node_name: &str,
        namespace: &str,
        pod_name: &str,
    ) -> Result<Vec<String>> {
        get_pod_cluster_tags(self.cache.as_ref(), node_name, namespace, pod_name).await
    }
}

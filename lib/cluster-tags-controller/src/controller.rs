//! Cluster tags controller
//!
//! Synchronizes Endpoints objects into per-node metadata bundles so that
//! the read path can tag pods with the services exposing them. Stale data is
//! garbage collected while processing updates and deletes, so the cache never
//! holds entries for pods or services that are gone.

use crate::event::{meta_namespace_key, split_meta_namespace_key, DeletedObject, EndpointsEvent};
use crate::metrics::ControllerMetrics;
use crate::snapshot::{EndpointsLister, NodeLister};
use crate::workqueue::{RateLimiter, WorkQueue};
use cluster_tags_core::{
    bundle_cache_key, get_metadata_bundle, Expiration, MetadataMapperBundle, Result, SharedCache,
    TagsError,
};
use k8s_openapi::api::core::v1::Endpoints;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

/// Controller configuration
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Number of concurrent workers
    pub workers: usize,
    /// Requeues allowed for a failing key before it is dropped
    pub max_retries: u32,
    /// Backoff applied to requeued keys
    pub rate_limiter: RateLimiter,
    /// Delay before restarting a worker that panicked
    pub worker_restart_delay: Duration,
    /// Interval at which every known Endpoints is enqueued again
    pub resync_period: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            max_retries: 3,
            rate_limiter: RateLimiter::default(),
            worker_restart_delay: Duration::from_secs(1),
            resync_period: None,
        }
    }
}

/// Result of a successful key sync
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Endpoints present, mapping recomputed
    Mapped,
    /// Endpoints gone, mapping garbage collected
    Deleted,
    /// Lookup failed, key dropped until the next notification
    Dropped,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Mapped => "mapped",
            SyncOutcome::Deleted => "deleted",
            SyncOutcome::Dropped => "dropped",
        }
    }
}

/// Marks a key done when processing ends, including on panic
struct DoneGuard<'a> {
    queue: &'a WorkQueue<String>,
    key: &'a str,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.queue.done(&self.key.to_string());
    }
}

/// ClusterTagsController builds and caches cluster-level tags (service
/// names) for the pods of every node.
pub struct ClusterTagsController {
    nodes: Arc<dyn NodeLister>,
    endpoints: Arc<dyn EndpointsLister>,
    cache: Arc<dyn SharedCache>,
    queue: WorkQueue<String>,
    config: ControllerConfig,
    metrics: ControllerMetrics,
    // Nodes each Endpoints key was last mapped to
    mapped_nodes: Mutex<HashMap<String, BTreeSet<String>>>,
    // Serializes fetch-modify-write of bundles across workers
    bundle_writes: tokio::sync::Mutex<()>,
    sync_observer: Option<mpsc::UnboundedSender<String>>,
}

impl ClusterTagsController {
    pub fn new(
        nodes: Arc<dyn NodeLister>,
        endpoints: Arc<dyn EndpointsLister>,
        cache: Arc<dyn SharedCache>,
        config: ControllerConfig,
    ) -> anyhow::Result<Self> {
        let metrics = ControllerMetrics::new()?;
        let queue = WorkQueue::new(config.rate_limiter.clone());
        Ok(Self {
            nodes,
            endpoints,
            cache,
            queue,
            config,
            metrics,
            mapped_nodes: Mutex::new(HashMap::new()),
            bundle_writes: tokio::sync::Mutex::new(()),
            sync_observer: None,
        })
    }

    /// Report every processed key on `observer`
    pub fn with_sync_observer(mut self, observer: mpsc::UnboundedSender<String>) -> Self {
        self.sync_observer = Some(observer);
        self
    }

    pub fn metrics(&self) -> &ControllerMetrics {
        &self.metrics
    }

    /// Number of keys waiting to be processed
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn add_endpoints(&self, endpoints: &Endpoints) {
        debug!(
            "Adding endpoints {}/{}",
            endpoints.namespace().unwrap_or_default(),
            endpoints.name_any()
        );
        self.metrics.record_event("add");
        self.enqueue(endpoints);
    }

    pub fn update_endpoints(&self, _old: &Endpoints, new: &Endpoints) {
        trace!(
            "Updating endpoints {}/{}",
            new.namespace().unwrap_or_default(),
            new.name_any()
        );
        self.metrics.record_event("update");
        self.enqueue(new);
    }

    pub fn delete_endpoints(&self, deleted: DeletedObject) {
        self.metrics.record_event("delete");
        match deleted.into_endpoints() {
            Ok(endpoints) => {
                debug!(
                    "Deleting endpoints {}/{}",
                    endpoints.namespace().unwrap_or_default(),
                    endpoints.name_any()
                );
                self.enqueue(&endpoints);
            }
            Err(e) => debug!("Dropping delete notification: {}", e),
        }
    }

    /// Dispatch a notification to the matching handler
    pub fn handle_event(&self, event: EndpointsEvent) {
        match event {
            EndpointsEvent::Added(endpoints) => self.add_endpoints(&endpoints),
            EndpointsEvent::Updated { old, new } => self.update_endpoints(&old, &new),
            EndpointsEvent::Deleted(deleted) => self.delete_endpoints(deleted),
        }
    }

    fn enqueue(&self, endpoints: &Endpoints) {
        match meta_namespace_key(endpoints) {
            Ok(key) => self.queue.add(key),
            Err(e) => debug!("Couldn't get key for endpoints: {}", e),
        }
    }

    /// Enqueue every Endpoints known to the lister, returning how many
    pub fn resync(&self) -> usize {
        match self.endpoints.list() {
            Ok(all) => {
                for endpoints in &all {
                    self.enqueue(endpoints);
                }
                trace!("Resync enqueued {} endpoints", all.len());
                all.len()
            }
            Err(e) => {
                debug!("Unable to list endpoints for resync: {}", e);
                0
            }
        }
    }

    /// Run workers until `stop` turns true (or its sender is dropped).
    ///
    /// Workers finish the key they hold before exiting.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        info!("Starting cluster tags controller with {} workers", self.config.workers);

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers.max(1) {
            workers.spawn(self.clone().supervise_worker(id));
        }
        let resync = self
            .config
            .resync_period
            .map(|period| tokio::spawn(self.clone().resync_loop(period)));

        let _ = stop.wait_for(|stopped| *stopped).await;

        self.queue.shut_down();
        if let Some(resync) = resync {
            resync.abort();
        }
        while workers.join_next().await.is_some() {}

        info!("Stopping cluster tags controller");
    }

    async fn supervise_worker(self: Arc<Self>, id: usize) {
        loop {
            let worker = tokio::spawn(self.clone().worker());
            match worker.await {
                Ok(()) => return,
                Err(e) if e.is_panic() => {
                    error!(
                        "Worker {} panicked, restarting in {:?}",
                        id, self.config.worker_restart_delay
                    );
                    tokio::time::sleep(self.config.worker_restart_delay).await;
                    if self.queue.is_shutting_down() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("Worker {} stopped: {}", id, e);
                    return;
                }
            }
        }
    }

    async fn worker(self: Arc<Self>) {
        while self.process_next_work_item().await {}
    }

    async fn resync_loop(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.resync();
        }
    }

    /// Process one key; `false` once the queue is shut down
    pub async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let done = DoneGuard {
            queue: &self.queue,
            key: &key,
        };

        let start = Instant::now();
        match self.sync_endpoints(&key).await {
            Ok(outcome) => {
                self.queue.forget(&key);
                self.metrics
                    .record_sync(outcome.as_str(), start.elapsed().as_secs_f64());
            }
            Err(e) => {
                self.metrics.record_sync("error", start.elapsed().as_secs_f64());
                self.handle_sync_error(&key, e);
            }
        }
        drop(done);

        if let Some(observer) = &self.sync_observer {
            let _ = observer.send(key);
        }
        true
    }

    fn handle_sync_error(&self, key: &str, err: TagsError) {
        let key = key.to_string();
        let retries = self.queue.num_requeues(&key);
        if retries < self.config.max_retries {
            debug!("Error syncing endpoints {}, requeueing: {}", key, err);
            self.metrics.requeues_total.inc();
            self.queue.add_rate_limited(key);
        } else {
            warn!(
                "Dropping endpoints {} out of the queue after {} retries: {}",
                key, retries, err
            );
            self.queue.forget(&key);
        }
    }

    /// Reconcile the cache with the current state of the Endpoints `key`
    pub async fn sync_endpoints(&self, key: &str) -> Result<SyncOutcome> {
        let (namespace, name) = split_meta_namespace_key(key)?;

        match self.endpoints.get(&namespace, &name) {
            Ok(None) => {
                // Absence from the store means the watcher caught the deletion
                trace!("Endpoints {} has been deleted, cleaning up metadata map", key);
                self.delete_mapped_endpoints(&namespace, &name).await?;
                Ok(SyncOutcome::Deleted)
            }
            Ok(Some(endpoints)) => {
                self.map_endpoints(&endpoints).await?;
                Ok(SyncOutcome::Mapped)
            }
            Err(e) => {
                debug!("Unable to retrieve endpoints {} from store: {}", key, e);
                Ok(SyncOutcome::Dropped)
            }
        }
    }

    /// Map the pods of `endpoints` to its service on every node they run on.
    ///
    /// Nodes the object was mapped to before but no longer touches are
    /// cleaned up as well.
    pub async fn map_endpoints(&self, endpoints: &Endpoints) -> Result<()> {
        let key = meta_namespace_key(endpoints)?;
        let namespace = endpoints.namespace().unwrap_or_default();
        let service = endpoints.name_any();

        let node_to_pods = pods_by_node(endpoints);
        let current: BTreeSet<String> = node_to_pods.keys().cloned().collect();
        let previous = self.swap_mapped_nodes(&key, current.clone());

        let no_pods = BTreeSet::new();
        for node_name in current.union(&previous) {
            let pods = node_to_pods.get(node_name).unwrap_or(&no_pods);

            let _writes = self.bundle_writes.lock().await;
            let bundle = match get_metadata_bundle(self.cache.as_ref(), node_name).await {
                Ok(Some(bundle)) => bundle,
                // Nothing cached for a node the object left
                Ok(None) if pods.is_empty() => continue,
                Ok(None) => Arc::new(MetadataMapperBundle::new()),
                Err(e) => {
                    trace!("Could not get metadata for node {}: {}", node_name, e);
                    Arc::new(MetadataMapperBundle::new())
                }
            };

            let empty = bundle.map_service(&namespace, &service, pods).await;
            self.store_bundle(node_name, bundle, empty).await;
        }

        Ok(())
    }

    /// Remove `service` in `namespace` from the bundle of every known node.
    ///
    /// When nodes cannot be listed, the nodes the object was last mapped to
    /// are cleaned before the error is returned; the retry scans every node.
    pub async fn delete_mapped_endpoints(&self, namespace: &str, service: &str) -> Result<()> {
        let remembered = self.swap_mapped_nodes(&object_key(namespace, service), BTreeSet::new());

        let nodes = match self.nodes.list_nodes() {
            Ok(nodes) => nodes,
            Err(e) => {
                self.remove_service_from(&remembered, namespace, service).await;
                return Err(e);
            }
        };

        let mut node_names: BTreeSet<String> = nodes.iter().map(|node| node.name_any()).collect();
        node_names.extend(remembered);
        self.remove_service_from(&node_names, namespace, service).await;

        Ok(())
    }

    async fn remove_service_from(
        &self,
        node_names: &BTreeSet<String>,
        namespace: &str,
        service: &str,
    ) {
        for node_name in node_names {
            let _writes = self.bundle_writes.lock().await;
            let bundle = match get_metadata_bundle(self.cache.as_ref(), node_name).await {
                Ok(Some(bundle)) => bundle,
                // Nothing to delete
                _ => continue,
            };

            let empty = bundle.remove_service(namespace, service).await;
            self.store_bundle(node_name, bundle, empty).await;
        }
    }

    async fn store_bundle(&self, node_name: &str, bundle: Arc<MetadataMapperBundle>, empty: bool) {
        let cache_key = bundle_cache_key(node_name);
        if empty {
            trace!("Evicting empty metadata bundle for node {}", node_name);
            self.cache.delete(&cache_key).await;
            self.metrics.record_bundle_write("evict");
        } else {
            self.cache.set(cache_key, bundle, Expiration::Never).await;
            self.metrics.record_bundle_write("set");
        }
    }

    fn swap_mapped_nodes(&self, key: &str, nodes: BTreeSet<String>) -> BTreeSet<String> {
        let mut mapped = self.mapped_nodes.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = if nodes.is_empty() {
            mapped.remove(key)
        } else {
            mapped.insert(key.to_string(), nodes)
        };
        previous.unwrap_or_default()
    }
}

fn object_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

/// Pods backing `endpoints`, grouped by the node they run on.
///
/// Only addresses referencing a Pod with a name, a namespace and a node are
/// kept.
pub fn pods_by_node(endpoints: &Endpoints) -> BTreeMap<String, BTreeSet<String>> {
    let mut node_to_pods: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    let addresses = endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|subset| subset.addresses.iter().flatten());

    for address in addresses {
        let Some(target_ref) = &address.target_ref else {
            // Endpoints also serve as leader election locks; those carry no TargetRef
            trace!(
                "No TargetRef for endpoints {}/{}, skipping",
                endpoints.namespace().unwrap_or_default(),
                endpoints.name_any()
            );
            continue;
        };
        if target_ref.kind.as_deref() != Some("Pod") {
            continue;
        }

        let pod_name = target_ref.name.as_deref().unwrap_or_default();
        let pod_namespace = target_ref.namespace.as_deref().unwrap_or_default();
        if pod_name.is_empty() || pod_namespace.is_empty() {
            trace!(
                "Incomplete reference for object {:?} on service {}/{}, skipping",
                target_ref.uid,
                endpoints.namespace().unwrap_or_default(),
                endpoints.name_any()
            );
            continue;
        }

        let Some(node_name) = address.node_name.as_deref().filter(|n| !n.is_empty()) else {
            continue;
        };

        node_to_pods
            .entry(node_name.to_string())
            .or_default()
            .insert(pod_name.to_string());
    }

    node_to_pods
}

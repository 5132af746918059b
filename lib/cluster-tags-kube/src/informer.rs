//! Reflector-backed informers feeding the cluster tags controller

use cluster_tags_controller::{
    meta_namespace_key, ClusterTagsController, DeletedObject, EndpointsEvent, EndpointsLister,
    NodeLister,
};
use cluster_tags_core::{Result, TagsError};
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Node};
use kube::{Api, Client};
use kube_runtime::reflector::{self, Store};
use kube_runtime::watcher::{self, Event};
use kube_runtime::WatchStreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

type WatchStream<K> = BoxStream<'static, std::result::Result<Event<K>, watcher::Error>>;

/// Translates watcher events into controller notifications.
///
/// Objects listed during a relist are only reported once the relist is done,
/// when the reflector store holds them. Objects that vanished between two
/// lists are reported as tombstones carrying their last known state.
#[derive(Default)]
pub struct EventTranslator {
    known: HashMap<String, Arc<Endpoints>>,
    relisted: Option<Vec<(String, Arc<Endpoints>)>>,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, event: Event<Endpoints>) -> Vec<EndpointsEvent> {
        match event {
            Event::Apply(endpoints) => self.applied(Arc::new(endpoints)).into_iter().collect(),
            Event::Delete(endpoints) => {
                if let Ok(key) = meta_namespace_key(&endpoints) {
                    self.known.remove(&key);
                }
                vec![EndpointsEvent::Deleted(DeletedObject::Object(Arc::new(endpoints)))]
            }
            Event::Init => {
                trace!("Endpoints relist started");
                self.relisted = Some(Vec::new());
                Vec::new()
            }
            Event::InitApply(endpoints) => {
                let endpoints = Arc::new(endpoints);
                if let Some(relisted) = self.relisted.as_mut() {
                    // Held back until the store swaps in the new list
                    match meta_namespace_key(&endpoints) {
                        Ok(key) => relisted.push((key, endpoints)),
                        Err(e) => debug!("Couldn't get key for endpoints: {}", e),
                    }
                    return Vec::new();
                }
                self.applied(endpoints).into_iter().collect()
            }
            Event::InitDone => match self.relisted.take() {
                Some(relisted) => self.relist_done(relisted),
                None => Vec::new(),
            },
        }
    }

    fn relist_done(&mut self, relisted: Vec<(String, Arc<Endpoints>)>) -> Vec<EndpointsEvent> {
        let mut previous = std::mem::take(&mut self.known);
        let mut events = Vec::with_capacity(relisted.len());

        for (key, endpoints) in relisted {
            let old = previous.remove(&key).or_else(|| self.known.get(&key).cloned());
            events.push(match old {
                Some(old) => EndpointsEvent::Updated {
                    old,
                    new: endpoints.clone(),
                },
                None => EndpointsEvent::Added(endpoints.clone()),
            });
            self.known.insert(key, endpoints);
        }

        let listed = events.len();
        events.extend(previous.into_iter().map(|(key, last_known)| {
            EndpointsEvent::Deleted(DeletedObject::Tombstone {
                key,
                last_known: Some(last_known),
            })
        }));
        debug!(
            "Endpoints relist done: {} objects, {} gone",
            listed,
            events.len() - listed
        );
        events
    }

    fn applied(&mut self, endpoints: Arc<Endpoints>) -> Option<EndpointsEvent> {
        let key = match meta_namespace_key(&endpoints) {
            Ok(key) => key,
            Err(e) => {
                debug!("Couldn't get key for endpoints: {}", e);
                return None;
            }
        };
        Some(match self.known.insert(key, endpoints.clone()) {
            Some(old) => EndpointsEvent::Updated { old, new: endpoints },
            None => EndpointsEvent::Added(endpoints),
        })
    }
}

/// Node and Endpoints reflectors not yet started
pub struct Informers {
    nodes: Store<Node>,
    endpoints: Store<Endpoints>,
    node_stream: WatchStream<Node>,
    endpoints_stream: WatchStream<Endpoints>,
}

impl Informers {
    /// Watch all nodes and the Endpoints of `namespace` (all namespaces when `None`)
    pub fn new(client: Client, namespace: Option<&str>) -> Self {
        let config = watcher::Config::default();

        let node_api: Api<Node> = Api::all(client.clone());
        let (nodes, node_writer) = reflector::store();
        let node_stream = reflector::reflector(
            node_writer,
            watcher::watcher(node_api, config.clone()).default_backoff(),
        )
        .boxed();

        let endpoints_api: Api<Endpoints> = match namespace {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::all(client),
        };
        let (endpoints, endpoints_writer) = reflector::store();
        let endpoints_stream = reflector::reflector(
            endpoints_writer,
            watcher::watcher(endpoints_api, config).default_backoff(),
        )
        .boxed();

        Self {
            nodes,
            endpoints,
            node_stream,
            endpoints_stream,
        }
    }

    pub fn node_lister(&self) -> Arc<dyn NodeLister> {
        Arc::new(self.nodes.clone())
    }

    pub fn endpoints_lister(&self) -> Arc<dyn EndpointsLister> {
        Arc::new(self.endpoints.clone())
    }

    /// Start watching, delivering Endpoints notifications to `controller`
    pub fn start(self, controller: Arc<ClusterTagsController>) -> InformerHandle {
        info!("Starting node and endpoints informers");

        let mut node_stream = self.node_stream;
        let node_task = tokio::spawn(async move {
            while let Some(event) = node_stream.next().await {
                if let Err(e) = event {
                    warn!("Node watch error: {}", e);
                }
            }
            warn!("Node watch stream ended");
        });

        let endpoints_task =
            tokio::spawn(dispatch_endpoints_events(self.endpoints_stream, controller));

        InformerHandle {
            nodes: self.nodes,
            endpoints: self.endpoints,
            tasks: vec![node_task, endpoints_task],
        }
    }
}

async fn dispatch_endpoints_events(
    mut stream: WatchStream<Endpoints>,
    controller: Arc<ClusterTagsController>,
) {
    let mut translator = EventTranslator::new();
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                for notification in translator.translate(event) {
                    controller.handle_event(notification);
                }
            }
            Err(e) => warn!("Endpoints watch error: {}", e),
        }
    }
    warn!("Endpoints watch stream ended");
}

/// Running informers
pub struct InformerHandle {
    nodes: Store<Node>,
    endpoints: Store<Endpoints>,
    tasks: Vec<JoinHandle<()>>,
}

impl InformerHandle {
    /// Wait until both stores hold a complete initial list
    pub async fn wait_for_cache_sync(&self, timeout: Duration) -> Result<()> {
        let synced = async {
            self.nodes.wait_until_ready().await?;
            self.endpoints.wait_until_ready().await
        };
        match tokio::time::timeout(timeout, synced).await {
            Ok(Ok(())) => {
                info!("Node and endpoints caches synced");
                Ok(())
            }
            Ok(Err(e)) => Err(TagsError::CacheSyncFailed(format!("{:?}", e))),
            Err(_) => Err(TagsError::CacheSyncFailed(format!(
                "no initial list after {:?}",
                timeout
            ))),
        }
    }

    /// Stop watching
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
        debug!("Informers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_tags_controller::ControllerConfig;
    use cluster_tags_core::{get_pod_cluster_tags, MemoryCache};
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, ObjectReference};
    use kube::api::ObjectMeta;

    fn endpoints(name: &str, resource_version: &str) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns1".to_string()),
                resource_version: Some(resource_version.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn with_pod(mut endpoints: Endpoints, pod: &str, node: &str) -> Endpoints {
        endpoints.subsets = Some(vec![EndpointSubset {
            addresses: Some(vec![EndpointAddress {
                ip: "10.0.0.1".to_string(),
                node_name: Some(node.to_string()),
                target_ref: Some(ObjectReference {
                    kind: Some("Pod".to_string()),
                    namespace: Some("ns1".to_string()),
                    name: Some(pod.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }]);
        endpoints
    }

    fn describe(events: &[EndpointsEvent]) -> Vec<String> {
        events
            .iter()
            .map(|event| match event {
                EndpointsEvent::Added(e) => format!("add {}", meta_namespace_key(e).unwrap()),
                EndpointsEvent::Updated { new, .. } => {
                    format!("update {}", meta_namespace_key(new).unwrap())
                }
                EndpointsEvent::Deleted(DeletedObject::Object(e)) => {
                    format!("delete {}", meta_namespace_key(e).unwrap())
                }
                EndpointsEvent::Deleted(DeletedObject::Tombstone { key, .. }) => {
                    format!("tombstone {}", key)
                }
            })
            .collect()
    }

    #[test]
    fn test_apply_and_delete() {
        let mut translator = EventTranslator::new();
        let mut events = translator.translate(Event::Apply(endpoints("a", "1")));
        events.extend(translator.translate(Event::Apply(endpoints("a", "2"))));
        events.extend(translator.translate(Event::Delete(endpoints("a", "2"))));
        events.extend(translator.translate(Event::Apply(endpoints("a", "3"))));

        assert_eq!(
            describe(&events),
            vec!["add ns1/a", "update ns1/a", "delete ns1/a", "add ns1/a"]
        );
    }

    #[test]
    fn test_relist_reports_vanished_objects_as_tombstones() {
        let mut translator = EventTranslator::new();
        assert!(translator.translate(Event::Init).is_empty());
        assert!(translator.translate(Event::InitApply(endpoints("a", "1"))).is_empty());
        assert!(translator.translate(Event::InitApply(endpoints("b", "1"))).is_empty());
        assert_eq!(
            describe(&translator.translate(Event::InitDone)),
            vec!["add ns1/a", "add ns1/b"]
        );

        // Watch restarts; "b" was deleted while disconnected
        let mut events = translator.translate(Event::Init);
        events.extend(translator.translate(Event::InitApply(endpoints("a", "2"))));
        events.extend(translator.translate(Event::InitApply(endpoints("c", "1"))));
        assert!(events.is_empty());
        events.extend(translator.translate(Event::InitDone));

        assert_eq!(
            describe(&events),
            vec!["update ns1/a", "add ns1/c", "tombstone ns1/b"]
        );

        let Some(EndpointsEvent::Deleted(tombstone)) = events.pop() else {
            panic!("expected a tombstone");
        };
        let last_known = tombstone.into_endpoints().unwrap();
        assert_eq!(last_known.metadata.resource_version.as_deref(), Some("1"));
    }

    #[test]
    fn test_init_done_without_init_is_ignored() {
        let mut translator = EventTranslator::new();
        translator.translate(Event::Apply(endpoints("a", "1")));
        assert!(translator.translate(Event::InitDone).is_empty());
        assert_eq!(
            describe(&translator.translate(Event::Apply(endpoints("a", "2")))),
            vec!["update ns1/a"]
        );
    }

    #[tokio::test]
    async fn test_relisted_objects_are_mapped_once_store_is_swapped() {
        let (nodes, _node_writer) = reflector::store::<Node>();
        let (store, mut writer) = reflector::store::<Endpoints>();
        let cache = Arc::new(MemoryCache::new());
        let controller = ClusterTagsController::new(
            Arc::new(nodes),
            Arc::new(store.clone()),
            cache.clone(),
            ControllerConfig::default(),
        )
        .unwrap();
        let mut translator = EventTranslator::new();

        let relist = [
            Event::Init,
            Event::InitApply(with_pod(endpoints("svc-a", "1"), "p1", "n1")),
            Event::InitDone,
        ];
        for event in relist {
            // Same order as the reflector: store first, then downstream
            writer.apply_watcher_event(&event);
            for notification in translator.translate(event) {
                controller.handle_event(notification);
            }
            while controller.queue_len() > 0 {
                assert!(controller.process_next_work_item().await);
            }
        }

        assert_eq!(store.state().len(), 1);
        let tags = get_pod_cluster_tags(cache.as_ref(), "n1", "ns1", "p1")
            .await
            .unwrap();
        assert_eq!(tags, vec!["kube_service:svc-a"]);
    }
}

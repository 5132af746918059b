//! Read-only views of cluster state the controller reconciles against

use cluster_tags_core::{Result, TagsError};
use k8s_openapi::api::core::v1::{Endpoints, Node};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Lists the nodes known to the cluster
pub trait NodeLister: Send + Sync {
    fn list_nodes(&self) -> Result<Vec<Arc<Node>>>;

    /// `Ok(None)` when no node has this name
    fn get_node(&self, name: &str) -> Result<Option<Arc<Node>>>;
}

/// Looks up Endpoints objects by namespace and name
pub trait EndpointsLister: Send + Sync {
    /// `Ok(None)` when the object does not exist
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Endpoints>>>;

    fn list(&self) -> Result<Vec<Arc<Endpoints>>>;
}

impl NodeLister for Store<Node> {
    fn list_nodes(&self) -> Result<Vec<Arc<Node>>> {
        Ok(self.state())
    }

    fn get_node(&self, name: &str) -> Result<Option<Arc<Node>>> {
        Ok(Store::get(self, &ObjectRef::new(name)))
    }
}

impl EndpointsLister for Store<Endpoints> {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Endpoints>>> {
        let key = ObjectRef::new(name).within(namespace);
        Ok(Store::get(self, &key))
    }

    fn list(&self) -> Result<Vec<Arc<Endpoints>>> {
        Ok(self.state())
    }
}

#[derive(Default)]
struct SnapshotState {
    nodes: BTreeMap<String, Arc<Node>>,
    endpoints: BTreeMap<(String, String), Arc<Endpoints>>,
    failure: Option<String>,
}

/// In-memory snapshot of nodes and endpoints.
///
/// Setting a failure makes every lookup return [`TagsError::Snapshot`] until
/// it is cleared.
#[derive(Clone, Default)]
pub struct InMemorySnapshot {
    state: Arc<RwLock<SnapshotState>>,
}

impl InMemorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SnapshotState> {
        self.state.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SnapshotState> {
        self.state.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn upsert_node(&self, node: Node) {
        let name = node.name_any();
        self.write().nodes.insert(name, Arc::new(node));
    }

    pub fn remove_node(&self, name: &str) {
        self.write().nodes.remove(name);
    }

    pub fn upsert_endpoints(&self, endpoints: Endpoints) {
        let key = (endpoints.namespace().unwrap_or_default(), endpoints.name_any());
        self.write().endpoints.insert(key, Arc::new(endpoints));
    }

    pub fn remove_endpoints(&self, namespace: &str, name: &str) -> Option<Arc<Endpoints>> {
        self.write()
            .endpoints
            .remove(&(namespace.to_string(), name.to_string()))
    }

    /// Make lookups fail with `reason`, or succeed again with `None`
    pub fn set_failure(&self, reason: Option<&str>) {
        self.write().failure = reason.map(str::to_string);
    }

    fn check(&self, state: &SnapshotState) -> Result<()> {
        match &state.failure {
            Some(reason) => Err(TagsError::Snapshot(reason.clone())),
            None => Ok(()),
        }
    }
}

impl NodeLister for InMemorySnapshot {
    fn list_nodes(&self) -> Result<Vec<Arc<Node>>> {
        let state = self.read();
        self.check(&state)?;
        Ok(state.nodes.values().cloned().collect())
    }

    fn get_node(&self, name: &str) -> Result<Option<Arc<Node>>> {
        let state = self.read();
        self.check(&state)?;
        Ok(state.nodes.get(name).cloned())
    }
}

impl EndpointsLister for InMemorySnapshot {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Endpoints>>> {
        let state = self.read();
        self.check(&state)?;
        Ok(state
            .endpoints
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    fn list(&self) -> Result<Vec<Arc<Endpoints>>> {
        let state = self.read();
        self.check(&state)?;
        Ok(state.endpoints.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn endpoints(namespace: &str, name: &str) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_in_memory_snapshot_lookups() {
        let snapshot = InMemorySnapshot::new();
        snapshot.upsert_node(node("n1"));
        snapshot.upsert_node(node("n2"));
        snapshot.upsert_endpoints(endpoints("ns1", "svc-a"));

        assert_eq!(snapshot.list_nodes().unwrap().len(), 2);
        assert!(snapshot.get_node("n1").unwrap().is_some());
        assert!(snapshot.get_node("n3").unwrap().is_none());
        assert!(EndpointsLister::get(&snapshot, "ns1", "svc-a").unwrap().is_some());
        assert!(EndpointsLister::get(&snapshot, "ns2", "svc-a").unwrap().is_none());

        snapshot.remove_node("n2");
        assert!(snapshot.remove_endpoints("ns1", "svc-a").is_some());
        assert_eq!(snapshot.list_nodes().unwrap().len(), 1);
        assert!(snapshot.list().unwrap().is_empty());
    }

    #[test]
    fn test_in_memory_snapshot_failure() {
        let snapshot = InMemorySnapshot::new();
        snapshot.set_failure(Some("store unavailable"));
        assert!(matches!(snapshot.list_nodes(), Err(TagsError::Snapshot(_))));
        assert!(matches!(
            EndpointsLister::get(&snapshot, "ns1", "svc-a"),
            Err(TagsError::Snapshot(_))
        ));

        snapshot.set_failure(None);
        assert!(snapshot.list_nodes().is_ok());
    }

    #[test]
    fn test_store_backed_listers() {
        let (store, mut writer) = kube::runtime::reflector::store::<Endpoints>();
        let applied = kube::runtime::watcher::Event::Apply(endpoints("ns1", "svc-a"));
        writer.apply_watcher_event(&applied);

        assert!(EndpointsLister::get(&store, "ns1", "svc-a").unwrap().is_some());
        assert!(EndpointsLister::get(&store, "ns1", "svc-b").unwrap().is_none());
        assert_eq!(EndpointsLister::list(&store).unwrap().len(), 1);

        let (nodes, mut writer) = kube::runtime::reflector::store::<Node>();
        writer.apply_watcher_event(&kube::runtime::watcher::Event::Apply(node("n1")));
        assert!(nodes.get_node("n1").unwrap().is_some());
        assert!(nodes.get_node("n2").unwrap().is_none());
        assert_eq!(nodes.list_nodes().unwrap().len(), 1);
    }
}

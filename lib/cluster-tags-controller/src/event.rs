//! Endpoints notifications and reconciliation keys

use cluster_tags_core::{Result, TagsError};
use k8s_openapi::api::core::v1::Endpoints;
use kube::ResourceExt;
use std::sync::Arc;

/// Key of an object: `namespace/name`, or `name` when cluster scoped
pub fn meta_namespace_key(endpoints: &Endpoints) -> Result<String> {
    let name = endpoints
        .metadata
        .name
        .as_deref()
        .filter(|name| !name.is_empty())
        .ok_or(TagsError::MissingName)?;
    match endpoints.namespace() {
        Some(namespace) if !namespace.is_empty() => Ok(format!("{}/{}", namespace, name)),
        _ => Ok(name.to_string()),
    }
}

/// Split a key produced by [`meta_namespace_key`] into namespace and name
pub fn split_meta_namespace_key(key: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok((String::new(), name.to_string())),
        [namespace, name] if !name.is_empty() => Ok((namespace.to_string(), name.to_string())),
        _ => Err(TagsError::InvalidKey(key.to_string())),
    }
}

/// Object delivered with a delete notification
#[derive(Clone, Debug)]
pub enum DeletedObject {
    /// The deleted object itself
    Object(Arc<Endpoints>),
    /// Deletion observed without the final state, e.g. missed during a relist
    Tombstone {
        key: String,
        last_known: Option<Arc<Endpoints>>,
    },
}

impl DeletedObject {
    /// Recover the deleted object, unwrapping tombstones
    pub fn into_endpoints(self) -> Result<Arc<Endpoints>> {
        match self {
            DeletedObject::Object(endpoints) => Ok(endpoints),
            DeletedObject::Tombstone { key, last_known } => {
                let endpoints = last_known.ok_or_else(|| {
                    TagsError::Tombstone(format!("tombstone {} carries no object", key))
                })?;
                let object_key = meta_namespace_key(&endpoints)?;
                if object_key != key {
                    return Err(TagsError::Tombstone(format!(
                        "tombstone {} carries object {}",
                        key, object_key
                    )));
                }
                Ok(endpoints)
            }
        }
    }
}

/// Change notification for an Endpoints object
#[derive(Clone, Debug)]
pub enum EndpointsEvent {
    Added(Arc<Endpoints>),
    Updated {
        old: Arc<Endpoints>,
        new: Arc<Endpoints>,
    },
    Deleted(DeletedObject),
}

impl EndpointsEvent {
    /// Label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            EndpointsEvent::Added(_) => "add",
            EndpointsEvent::Updated { .. } => "update",
            EndpointsEvent::Deleted(_) => "delete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn endpoints(namespace: Option<&str>, name: Option<&str>) -> Arc<Endpoints> {
        Arc::new(Endpoints {
            metadata: ObjectMeta {
                name: name.map(str::to_string),
                namespace: namespace.map(str::to_string),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[test]
    fn test_meta_namespace_key() {
        assert_eq!(
            meta_namespace_key(&endpoints(Some("ns1"), Some("svc-a"))).unwrap(),
            "ns1/svc-a"
        );
        assert_eq!(meta_namespace_key(&endpoints(None, Some("svc-a"))).unwrap(), "svc-a");
        assert!(matches!(
            meta_namespace_key(&endpoints(Some("ns1"), None)),
            Err(TagsError::MissingName)
        ));
    }

    #[test]
    fn test_split_meta_namespace_key() {
        assert_eq!(
            split_meta_namespace_key("ns1/svc-a").unwrap(),
            ("ns1".to_string(), "svc-a".to_string())
        );
        assert_eq!(
            split_meta_namespace_key("svc-a").unwrap(),
            (String::new(), "svc-a".to_string())
        );
        assert!(split_meta_namespace_key("a/b/c").is_err());
        assert!(split_meta_namespace_key("ns1/").is_err());
        assert!(split_meta_namespace_key("").is_err());
    }

    #[test]
    fn test_unwrap_object_and_tombstone() {
        let obj = endpoints(Some("ns1"), Some("svc-a"));
        let unwrapped = DeletedObject::Object(obj.clone()).into_endpoints().unwrap();
        assert!(Arc::ptr_eq(&obj, &unwrapped));

        let tombstone = DeletedObject::Tombstone {
            key: "ns1/svc-a".to_string(),
            last_known: Some(obj.clone()),
        };
        assert!(Arc::ptr_eq(&obj, &tombstone.into_endpoints().unwrap()));
    }

    #[test]
    fn test_unwrap_bad_tombstones() {
        let empty = DeletedObject::Tombstone {
            key: "ns1/svc-a".to_string(),
            last_known: None,
        };
        assert!(matches!(empty.into_endpoints(), Err(TagsError::Tombstone(_))));

        let mismatched = DeletedObject::Tombstone {
            key: "ns1/svc-a".to_string(),
            last_known: Some(endpoints(Some("ns1"), Some("svc-b"))),
        };
        assert!(matches!(mismatched.into_endpoints(), Err(TagsError::Tombstone(_))));
    }
}

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TagsError>;

#[derive(Error, Debug)]
pub enum TagsError {
    #[error("Invalid cache format for the cache key: {0}")]
    InvalidCacheFormat(String),

    #[error("Unexpected key format: {0}")]
    InvalidKey(String),

    #[error("Object has no name")]
    MissingName,

    #[error("Couldn't get object from tombstone: {0}")]
    Tombstone(String),

    #[error("Snapshot lookup failed: {0}")]
    Snapshot(String),

    #[error("Timed out waiting for caches to sync: {0}")]
    CacheSyncFailed(String),

    #[error("Kubernetes error: {0}")]
    KubernetesError(#[from] kube::error::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

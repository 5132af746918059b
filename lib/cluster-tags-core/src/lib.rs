//! Core cluster tag storage
//!
//! This library provides:
//! - Per-node metadata bundles mapping pods to the services exposing them
//! - The shared cache abstraction the bundles are stored in
//! - The read path used to turn cached bundles into pod tags

pub mod bundle;
pub mod cache;
pub mod error;
pub mod tags;

pub use bundle::{MetadataMapperBundle, ServicesMapper};
pub use cache::{build_cache_key, CacheValue, Expiration, MemoryCache, SharedCache};
pub use error::{Result, TagsError};
pub use tags::{bundle_cache_key, get_metadata_bundle, get_pod_cluster_tags, ClusterTagsReader};

//! Reconciliation of Endpoints into cluster-level pod tags
//!
//! This library provides:
//! - A deduplicating, rate-limited work queue of Endpoints keys
//! - Snapshot listers for nodes and Endpoints
//! - The controller that maps pods to services per node and garbage
//!   collects stale mappings

pub mod controller;
pub mod event;
pub mod metrics;
pub mod snapshot;
pub mod workqueue;

pub use controller::{pods_by_node, ClusterTagsController, ControllerConfig, SyncOutcome};
pub use event::{meta_namespace_key, split_meta_namespace_key, DeletedObject, EndpointsEvent};
pub use metrics::ControllerMetrics;
pub use snapshot::{EndpointsLister, InMemorySnapshot, NodeLister};
pub use workqueue::{RateLimiter, WorkQueue};

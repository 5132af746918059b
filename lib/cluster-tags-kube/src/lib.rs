//! Kubernetes plumbing for the cluster tags controller
//!
//! Watches nodes and Endpoints through reflectors and turns watch events
//! into controller notifications.

pub mod client;
pub mod informer;

pub use client::ClusterClient;
pub use informer::{EventTranslator, InformerHandle, Informers};

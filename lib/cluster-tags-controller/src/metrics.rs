//! Prometheus metrics for the cluster tags controller

use anyhow::Result;
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Prometheus metrics collector for reconciliation
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Notifications received, by kind (add, update, delete)
    pub events_total: CounterVec,
    /// Processed keys, by result (mapped, deleted, dropped, error)
    pub syncs_total: CounterVec,
    /// Time spent processing a single key
    pub sync_duration_seconds: Histogram,
    /// Keys requeued after a failed sync
    pub requeues_total: Counter,
    /// Bundle writes to the shared cache, by operation (set, evict)
    pub bundle_writes_total: CounterVec,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl ControllerMetrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let events_total = CounterVec::new(
            Opts::new("cluster_tags_events_total", "Endpoints notifications received"),
            &["kind"],
        )?;

        let syncs_total = CounterVec::new(
            Opts::new("cluster_tags_syncs_total", "Reconciled endpoints keys by result"),
            &["result"],
        )?;

        let sync_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "cluster_tags_sync_duration_seconds",
            "Endpoints key reconciliation latency in seconds",
        ))?;

        let requeues_total = Counter::new(
            "cluster_tags_requeues_total",
            "Endpoints keys requeued after a failed sync",
        )?;

        let bundle_writes_total = CounterVec::new(
            Opts::new(
                "cluster_tags_bundle_writes_total",
                "Metadata bundle cache writes by operation",
            ),
            &["op"],
        )?;

        registry.register(Box::new(events_total.clone()))?;
        registry.register(Box::new(syncs_total.clone()))?;
        registry.register(Box::new(sync_duration_seconds.clone()))?;
        registry.register(Box::new(requeues_total.clone()))?;
        registry.register(Box::new(bundle_writes_total.clone()))?;

        Ok(Self {
            events_total,
            syncs_total,
            sync_duration_seconds,
            requeues_total,
            bundle_writes_total,
            registry,
        })
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub(crate) fn record_event(&self, kind: &str) {
        self.events_total.with_label_values(&[kind]).inc();
    }

    pub(crate) fn record_sync(&self, result: &str, seconds: f64) {
        self.syncs_total.with_label_values(&[result]).inc();
        self.sync_duration_seconds.observe(seconds);
    }

    pub(crate) fn record_bundle_write(&self, op: &str) {
        self.bundle_writes_total.with_label_values(&[op]).inc();
    }
}

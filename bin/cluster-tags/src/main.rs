use anyhow::Result;
use clap::{Parser, ValueEnum};
use cluster_tags_controller::{ClusterTagsController, ControllerConfig};
use cluster_tags_core::MemoryCache;
use cluster_tags_kube::{ClusterClient, Informers};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Maps pods to the services selecting them, per node",
    long_about = None
)]
struct Args {
    /// Watch Endpoints in this namespace only (all namespaces when unset)
    #[arg(long, env = "CLUSTER_TAGS_NAMESPACE")]
    namespace: Option<String>,

    /// Number of concurrent reconciliation workers
    #[arg(long, env = "CLUSTER_TAGS_WORKERS", default_value_t = 1)]
    workers: usize,

    /// Requeues allowed for a failing key before it is dropped
    #[arg(long, env = "CLUSTER_TAGS_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Re-enqueue every known Endpoints object at this interval (0 disables)
    #[arg(long, env = "CLUSTER_TAGS_RESYNC_SECONDS", default_value_t = 0)]
    resync_seconds: u64,

    /// Give up if the initial node and endpoints lists take longer than this
    #[arg(long, env = "CLUSTER_TAGS_CACHE_SYNC_TIMEOUT_SECONDS", default_value_t = 120)]
    cache_sync_timeout_seconds: u64,

    #[arg(long, env = "CLUSTER_TAGS_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting cluster-tags v{}", env!("CARGO_PKG_VERSION"));

    let client = ClusterClient::new().await?;
    info!("Connected to Kubernetes cluster");

    let informers = Informers::new(client.clone_client(), args.namespace.as_deref());
    let config = ControllerConfig {
        workers: args.workers,
        max_retries: args.max_retries,
        resync_period: (args.resync_seconds > 0).then(|| Duration::from_secs(args.resync_seconds)),
        ..Default::default()
    };
    let controller = Arc::new(ClusterTagsController::new(
        informers.node_lister(),
        informers.endpoints_lister(),
        Arc::new(MemoryCache::new()),
        config,
    )?);

    let informers = informers.start(controller.clone());
    if let Err(e) = informers
        .wait_for_cache_sync(Duration::from_secs(args.cache_sync_timeout_seconds))
        .await
    {
        error!("Unable to sync caches: {}", e);
        informers.shutdown();
        return Err(e.into());
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let running = tokio::spawn(controller.clone().run(stop_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping workers...");

    stop_tx.send(true)?;
    running.await?;
    informers.shutdown();

    if let Ok(metrics) = controller.metrics().gather() {
        debug!("Final controller metrics:\n{}", metrics);
    }

    Ok(())
}

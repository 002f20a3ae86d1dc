//! `hrx`: exports Helm release state as Prometheus metrics.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use hrx_engine::{release_registry, EngineConfig, InfoRetention, ReconcileEngine};
use hrx_ingest::{spawn_ingest, IngestConfig};
use hrx_kubehub::{start_watcher, KubeReleaseSource, StorageDriver};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::signal;
use tracing::{error, info, warn};

mod serve;

#[derive(Parser, Debug)]
#[command(name = "hrx", version, about = "Prometheus exporter for Helm releases")]
struct Cli {
    /// Address of the /metrics endpoint
    #[arg(long = "listen-address", env = "HRX_LISTEN_ADDRESS", default_value = "0.0.0.0:9104")]
    listen_address: SocketAddr,

    /// Helm storage driver (secret or configmap)
    #[arg(long = "driver", env = "HELM_DRIVER", default_value = "secret")]
    driver: StorageDriver,

    /// Only watch this namespace (default: all namespaces)
    #[arg(long = "namespace", env = "HRX_NAMESPACE")]
    namespace: Option<String>,

    #[arg(long = "fetch-timeout-secs", env = "HRX_FETCH_TIMEOUT_SECS", default_value_t = 10)]
    fetch_timeout_secs: u64,

    /// Change queue capacity
    #[arg(long = "queue-cap", env = "HRX_QUEUE_CAP", default_value_t = 4096)]
    queue_cap: usize,

    /// Redeliveries of a notification that failed transiently
    #[arg(long = "max-retries", env = "HRX_MAX_RETRIES", default_value_t = 5)]
    max_retries: u32,

    /// Keep one helm_release_info series per stored revision
    #[arg(long = "info-history", env = "HRX_INFO_HISTORY", action = ArgAction::SetTrue)]
    info_history: bool,

    #[arg(long = "debug", action = ArgAction::SetTrue)]
    debug: bool,
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs.max(1)),
            info_retention: if self.info_history { InfoRetention::History } else { InfoRetention::LatestOnly },
        }
    }

    fn ingest_config(&self) -> IngestConfig {
        IngestConfig { queue_cap: self.queue_cap, max_retries: self.max_retries, ..IngestConfig::default() }
    }
}

fn init_tracing(debug: bool) {
    let env = if debug { "debug".to_string() } else { std::env::var("HRX_LOG").unwrap_or_else(|_| "info".to_string()) };
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

/// Install the recorder behind the exporter's own `hrx_*` metrics.
fn init_metrics() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "failed to install metrics recorder; serving release metrics only");
            None
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let exporter = init_metrics();

    let registry = Arc::new(release_registry());
    let client = kube::Client::try_default().await.context("building kubernetes client")?;
    let source = Arc::new(KubeReleaseSource::new(client.clone(), cli.driver));
    let engine = Arc::new(ReconcileEngine::new(registry.clone(), source, cli.engine_config()));
    let (tx, ingest) = spawn_ingest(engine, cli.ingest_config());

    info!(driver = %cli.driver, ns = ?cli.namespace, listen = %cli.listen_address, "starting helm release exporter");
    let watcher = tokio::spawn({
        let driver = cli.driver;
        let ns = cli.namespace.clone();
        async move {
            if let Err(e) = start_watcher(client, driver, ns.as_deref(), tx).await {
                error!(error = ?e, "watcher failed");
            }
        }
    });

    let served = serve::run(cli.listen_address, serve::AppState::new(registry, exporter), shutdown_signal()).await;

    // dropping the watcher closes the change channel; ingest drains and stops
    watcher.abort();
    let _ = watcher.await;
    ingest.wait().await;
    info!("exporter stopped");
    served
}

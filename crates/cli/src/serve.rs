//! HTTP surface: `/metrics` and `/healthz`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use hrx_registry::LabelRegistry;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::info;

pub const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
pub struct AppState {
    registry: Arc<LabelRegistry>,
    exporter: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(registry: Arc<LabelRegistry>, exporter: Option<PrometheusHandle>) -> Self {
        Self { registry, exporter }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(prometheus_metrics))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// GET /metrics: release families first, then the exporter's own metrics.
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.registry.render();
    if let Some(handle) = &state.exporter {
        let own = handle.render();
        if !own.is_empty() {
            if !body.is_empty() && !body.ends_with('\n') {
                body.push('\n');
            }
            body.push_str(&own);
        }
    }
    (StatusCode::OK, [(header::CONTENT_TYPE, TEXT_FORMAT)], body)
}

/// GET /healthz
pub async fn healthz() -> &'static str {
    "ok"
}

/// Serve until `shutdown` resolves.
pub async fn run<F>(addr: SocketAddr, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, "serving metrics");
    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown).await.context("metrics server")?;
    Ok(())
}

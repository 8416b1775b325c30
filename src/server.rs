//! HTTP server for Prometheus metrics and liveness checks.
//!
//! - `GET /metrics` renders all archiver metrics in the Prometheus text format.
//! - `GET /health` responds `200` while the archive pipeline is consuming, else `503`.

use anyhow::Result;
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::{extract::Extension, routing::get, AddExtensionLayer, Router};
use futures::prelude::*;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::get_metrics_recorder;
use crate::pipeline::PipelineState;

/// Spawns the metrics server, which shuts down along with the rest of the app.
pub fn spawn_prom_server(config: &Config, state_rx: watch::Receiver<PipelineState>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
    let handle = get_metrics_recorder(config).handle();
    let app = Router::new()
        .route("/metrics", get(prometheus_scrape))
        .route("/health", get(health_check))
        .layer(AddExtensionLayer::new(handle))
        .layer(AddExtensionLayer::new(state_rx));
    let server = axum::Server::bind(&([0, 0, 0, 0], config.metrics_port).into())
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _res = shutdown.recv().await;
        });
    tracing::info!("metrics server is listening at 0.0.0.0:{}", config.metrics_port);
    tokio::spawn(server.map_err(anyhow::Error::from))
}

/// Handle Prometheus metrics scraping.
async fn prometheus_scrape(Extension(handle): Extension<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, handle.render())
}

/// Handle liveness checks based on the state of the archive pipeline.
async fn health_check(Extension(state_rx): Extension<watch::Receiver<PipelineState>>) -> (StatusCode, String) {
    let state = *state_rx.borrow();
    (health_status(state), format!("{:?}", state))
}

/// The liveness status reported for the given pipeline state.
pub fn health_status(state: PipelineState) -> StatusCode {
    match state {
        PipelineState::Consuming => StatusCode::OK,
        PipelineState::Starting | PipelineState::Subscribing | PipelineState::Stopped => StatusCode::SERVICE_UNAVAILABLE,
    }
}

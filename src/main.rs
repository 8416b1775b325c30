//! The Kafka archiver.
//!
//! Consumes every message of every topic of a Kafka cluster and archives each message as an
//! individual JSON object in an object store, keyed by its topic, partition and offset.

mod app;
mod archive;
mod broker;
mod config;
mod error;
#[cfg(test)]
mod fixtures;
mod pipeline;
mod prom;
#[cfg(test)]
mod prom_test;
mod server;
mod stats;

use std::io::Write;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;
use crate::prom::PromMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true)
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    let recorder = get_metrics_recorder(&cfg);
    metrics::set_recorder(recorder).context("error setting prometheus metrics recorder")?;
    let metrics = PromMetrics::register();

    tracing::info!(
        bucket = %cfg.bucket_name,
        store_backend = ?cfg.store_backend,
        metrics_port = %cfg.metrics_port,
        "starting Kafka archiver",
    );
    let res = App::new(cfg, metrics)
        .await?
        .spawn()
        .await
        .context("error joining app task")
        .and_then(|res| res);
    if let Err(err) = &res {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    res
}

/// Get a handle to the metrics recorder, initializing it as needed.
pub fn get_metrics_recorder(config: &Config) -> &'static PrometheusRecorder {
    static RECORDER: OnceLock<PrometheusRecorder> = OnceLock::new();
    RECORDER.get_or_init(|| PrometheusBuilder::new().add_global_label("bucket", config.bucket_name.clone()).build())
}

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::ObjectStore;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::broker::KafkaBroker;
use crate::config::{Config, StoreBackend};
use crate::error::ShutdownResult;
use crate::pipeline::ArchivePipeline;
use crate::prom::{spawn_proc_metrics_sampler, ArchiveMetrics, PromMetrics};
use crate::server::spawn_prom_server;
use crate::stats::StatsReporter;

/// The capacity of the channel of statistics payloads.
///
/// Payloads arrive once per statistics interval, so this only fills if the reporter stalls.
const STATS_CHANNEL_CAPACITY: usize = 16;

/// The application object.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the archive pipeline.
    pipeline_handle: JoinHandle<ShutdownResult<()>>,
    /// The join handle of the broker stats reporter.
    stats_handle: JoinHandle<Result<()>>,
    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, metrics: PromMetrics) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);
        let metrics: Arc<dyn ArchiveMetrics> = Arc::new(metrics);

        tracing::info!("creating consumer");
        let (stats_tx, stats_rx) = mpsc::channel(STATS_CHANNEL_CAPACITY);
        let broker = KafkaBroker::new(&config, stats_tx).context("error initializing kafka client")?;
        let store = object_store_from_config(&config).await?;

        // Spawn various core tasks.
        let stats_handle = StatsReporter::new(metrics.clone(), stats_rx, shutdown_tx.subscribe()).spawn();
        let (pipeline, state_rx) = ArchivePipeline::new(broker, store, metrics, config.poll_timeout(), shutdown_tx.clone());
        let pipeline_handle = pipeline.spawn();
        let metrics_server = spawn_prom_server(&config, state_rx, shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            pipeline_handle,
            stats_handle,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));
        let mut sampler_shutdown = self.shutdown_tx.subscribe();
        let sampler = spawn_proc_metrics_sampler(async move {
            let _res = sampler_shutdown.recv().await;
        });

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("archiver is shutting down");
        let pipeline_res = self.pipeline_handle.await.context("error joining archive pipeline handle").and_then(|res| res.map_err(anyhow::Error::from));
        if let Err(err) = self.stats_handle.await.context("error joining stats reporter handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down stats reporter");
        }
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }
        if let Err(err) = sampler.await {
            tracing::error!(error = ?err, "error joining process metrics sampler handle");
        }

        tracing::debug!("archiver shutdown complete");
        pipeline_res
    }
}

/// Build the object store to which messages are archived.
pub async fn object_store_from_config(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    match config.store_backend {
        StoreBackend::S3 => {
            let store = AmazonS3Builder::from_env()
                .with_bucket_name(&config.bucket_name)
                .build()
                .context("error building S3 client")?;
            tracing::info!(bucket = %config.bucket_name, "archiving to S3");
            Ok(Arc::new(store))
        }
        StoreBackend::Local => {
            tokio::fs::create_dir_all(&config.local_store_path)
                .await
                .context("error creating dir for local archive")?;
            let store = LocalFileSystem::new_with_prefix(&config.local_store_path).context("error opening local archive")?;
            tracing::info!(path = %config.local_store_path, "archiving to local filesystem");
            Ok(Arc::new(store))
        }
    }
}

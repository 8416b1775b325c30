//! Archive pipeline.
//!
//! The pipeline is the single consumer of the broker. Each consume cycle polls the broker for a
//! bounded amount of time and then, for every message returned, uploads one archive object and
//! updates the message counters before polling again.
//!
//! Delivery is at-least-once. A message is only acknowledged to the broker after its object has
//! been written, and a failed upload is fatal, so a message is never skipped. Redelivered
//! messages overwrite their own object, as keys depend only on message coordinates.
//!
//! Shutdown is only observed between consume cycles, so the current batch is always finished.


use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::archive::{ArchiveKey, ArchiveRecord};
use crate::broker::{BrokerClient, ConsumedMessage};
use crate::error::ShutdownResult;
use crate::prom::ArchiveMetrics;

/// The lifecycle states of the archive pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Starting,
    Subscribing,
    Consuming,
    Stopped,
}

/// A controller which archives every message delivered by the broker.
pub struct ArchivePipeline<B: BrokerClient> {
    /// The broker client from which messages are consumed.
    broker: B,
    /// The object store to which messages are archived.
    store: Arc<dyn ObjectStore>,
    /// The metrics updated for each archived message.
    metrics: Arc<dyn ArchiveMetrics>,
    /// The maximum amount of time a single poll may block.
    poll_timeout: Duration,

    /// A channel used for publishing the pipeline's state.
    state_tx: watch::Sender<PipelineState>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: broadcast::Receiver<()>,
}

impl<B: BrokerClient> ArchivePipeline<B> {
    /// Create a new instance.
    pub fn new(
        broker: B, store: Arc<dyn ObjectStore>, metrics: Arc<dyn ArchiveMetrics>, poll_timeout: Duration, shutdown_tx: broadcast::Sender<()>,
    ) -> (Self, watch::Receiver<PipelineState>) {
        let (state_tx, state_rx) = watch::channel(PipelineState::Starting);
        (
            Self {
                broker,
                store,
                metrics,
                poll_timeout,
                state_tx,
                shutdown_rx: shutdown_tx.subscribe(),
                shutdown_tx,
            },
            state_rx,
        )
    }

    pub fn spawn(self) -> JoinHandle<ShutdownResult<()>> {
        tokio::spawn(self.run())
    }

    /// Run the pipeline until shutdown or until a fatal error is hit.
    ///
    /// **NOTE: any error returned from this routine will cause a shutdown to be issued.**
    pub async fn run(mut self) -> ShutdownResult<()> {
        let res = self.consume().await;
        if let Err(err) = &res {
            tracing::error!(error = ?err, "fatal error from archive pipeline, shutting down");
            let _ = self.shutdown_tx.send(());
        }
        self.set_state(PipelineState::Stopped);
        res
    }

    async fn consume(&mut self) -> ShutdownResult<()> {
        self.set_state(PipelineState::Subscribing);
        tracing::info!("subscribing");
        let topics = self.broker.subscribe_all().await.context("error subscribing to broker topics")?;
        tracing::info!(count = topics.len(), "subscribed to topics {:?}", topics);

        self.set_state(PipelineState::Consuming);
        tracing::info!("entering consume loop");
        loop {
            let batch = self.broker.poll(self.poll_timeout).await.context("error polling broker")?;
            for msg in batch {
                self.archive_message(msg).await?;
            }
            if self.shutdown_requested() {
                break;
            }
        }
        Ok(())
    }

    /// Archive a single message, updating metrics and acknowledging it to the broker.
    #[tracing::instrument(level = "trace", skip(self, msg), fields(topic = %msg.topic, partition = msg.partition, offset = msg.offset))]
    async fn archive_message(&mut self, msg: ConsumedMessage) -> ShutdownResult<()> {
        // Empty segments are dropped here, so this is the location actually written.
        let path = ObjectPath::from(ArchiveKey::new(&msg.topic, msg.partition, msg.offset).as_str());
        let body = ArchiveRecord::project(&msg).to_json().context("error serializing archive record")?;
        self.store
            .put(&path, body.into())
            .await
            .with_context(|| format!("error uploading archive object {}", path))?;

        match &msg.error {
            Some(err) => {
                tracing::error!(%path, "topic {}: got error {}", msg.topic, err);
                self.metrics.message_errored(&msg.topic, msg.partition);
            }
            None => {
                tracing::info!(%path, "topic {}: got message", msg.topic);
                self.metrics.message_received(&msg.topic, msg.partition);
            }
        }

        if msg.has_offset() {
            if let Err(err) = self.broker.ack(&msg) {
                tracing::error!(error = ?err, %path, "error acknowledging archived message");
            }
        }
        Ok(())
    }

    /// Check if a shutdown signal has been received.
    fn shutdown_requested(&mut self) -> bool {
        !matches!(self.shutdown_rx.try_recv(), Err(TryRecvError::Empty))
    }

    fn set_state(&self, state: PipelineState) {
        tracing::debug!(?state, "archive pipeline state change");
        let _ = self.state_tx.send(state);
    }
}

//! Broker statistics reporting.
//!
//! librdkafka periodically emits a JSON statistics document describing the client and each of
//! the brokers it is connected to. The reporter task consumes these documents and publishes the
//! connection state of every broker as a metric.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use futures::stream::StreamExt;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::error::StatsError;
use crate::prom::ArchiveMetrics;

/// The subset of the librdkafka statistics document used by the reporter.
#[derive(Debug, Deserialize)]
struct Statistics {
    brokers: Option<HashMap<String, BrokerStatistics>>,
}

#[derive(Debug, Deserialize)]
struct BrokerStatistics {
    name: String,
    state: String,
}

/// Report the state of every broker in the given statistics payload.
///
/// The payload is fully parsed before any state is reported, so a malformed payload never
/// results in a partial update. Returns the number of brokers reported.
pub fn report_stats(metrics: &dyn ArchiveMetrics, payload: &[u8]) -> Result<usize, StatsError> {
    let stats: Statistics = serde_json::from_slice(payload)?;
    let brokers = stats.brokers.ok_or(StatsError::MissingBrokers)?;
    for broker in brokers.values() {
        metrics.broker_state(&broker.name, &broker.state);
    }
    Ok(brokers.len())
}

/// A task which reports broker statistics as they arrive from the Kafka client.
pub struct StatsReporter {
    /// The metrics to which broker states are reported.
    metrics: Arc<dyn ArchiveMetrics>,
    /// A channel of raw statistics payloads.
    stats_rx: ReceiverStream<Vec<u8>>,
    /// A channel used for triggering graceful shutdown.
    shutdown: BroadcastStream<()>,
}

impl StatsReporter {
    /// Create a new instance.
    pub fn new(metrics: Arc<dyn ArchiveMetrics>, stats_rx: mpsc::Receiver<Vec<u8>>, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            metrics,
            stats_rx: ReceiverStream::new(stats_rx),
            shutdown: BroadcastStream::new(shutdown),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("stats reporter has started");
        loop {
            tokio::select! {
                Some(payload) = self.stats_rx.next() => self.handle_payload(&payload),
                _ = self.shutdown.next() => break,
            }
        }
        tracing::debug!("stats reporter has shutdown");
        Ok(())
    }

    /// Handle a statistics payload, skipping this interval if it is malformed.
    #[tracing::instrument(level = "trace", skip(self, payload))]
    fn handle_payload(&self, payload: &[u8]) {
        match report_stats(self.metrics.as_ref(), payload) {
            Ok(count) => tracing::trace!(count, "reported broker states"),
            Err(err) => tracing::error!(error = ?err, "error handling broker statistics, skipping interval"),
        }
    }
}

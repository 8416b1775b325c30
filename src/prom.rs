//! Prometheus metrics for the archiver.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;

pub const METRIC_BROKER_STATE: &str = "kafka_archiver_broker_state";
pub const METRIC_MESSAGES_RECEIVED: &str = "kafka_archiver_messages_received";
pub const METRIC_MESSAGES_ERRORED: &str = "kafka_archiver_messages_errored";

pub const METRIC_OPEN_FDS: &str = "process_open_fds";
pub const METRIC_MAX_FDS: &str = "process_max_fds";
pub const METRIC_VIRTUAL_MEMORY_BYTES: &str = "process_virtual_memory_bytes";
pub const METRIC_VIRTUAL_MEMORY_MAX_BYTES: &str = "process_virtual_memory_max_bytes";
pub const METRIC_RESIDENT_MEMORY_BYTES: &str = "process_resident_memory_bytes";
pub const METRIC_THREADS: &str = "process_threads";

/// The interval at which process metrics are sampled.
const PROC_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// All broker connection states known to librdkafka.
pub const BROKER_STATES: &[&str] = &[
    "INIT",
    "DOWN",
    "TRY_CONNECT",
    "CONNECT",
    "SSL_HANDSHAKE",
    "AUTH_LEGACY",
    "UP",
    "UPDATE",
    "APIVERSION_QUERY",
    "AUTH_HANDSHAKE",
    "AUTH_REQ",
    "REAUTH",
];

/// The metrics instruments updated by the archiver.
///
/// Implementations must be safe for concurrent use, as broker states are reported from the
/// stats reporter task while message counts are updated by the pipeline.
pub trait ArchiveMetrics: Send + Sync + 'static {
    /// Record the current connection state of the given broker.
    fn broker_state(&self, broker: &str, state: &str);

    /// Record that a message has been received and archived.
    fn message_received(&self, topic: &str, partition: i32);

    /// Record that a delivery error has been archived.
    fn message_errored(&self, topic: &str, partition: i32);
}

/// Metrics backed by the global `metrics` recorder.
#[derive(Debug, Default)]
pub struct PromMetrics {
    /// The last state reported for each broker.
    broker_states: Mutex<HashMap<String, String>>,
}

impl PromMetrics {
    /// Register all archiver metrics with the global recorder.
    ///
    /// This function should be called only once, early in the lifetime of the process.
    pub fn register() -> Self {
        metrics::register_gauge!(METRIC_BROKER_STATE, metrics::Unit::Count, "Connection state of each broker, 1 for the current state.");
        metrics::register_counter!(METRIC_MESSAGES_RECEIVED, metrics::Unit::Count, "Number of messages received and archived.");
        metrics::register_counter!(METRIC_MESSAGES_ERRORED, metrics::Unit::Count, "Number of delivery errors archived.");
        metrics::register_gauge!(METRIC_OPEN_FDS, metrics::Unit::Count, "Number of open file descriptors.");
        metrics::register_gauge!(METRIC_MAX_FDS, metrics::Unit::Count, "Maximum number of open file descriptors.");
        metrics::register_gauge!(METRIC_VIRTUAL_MEMORY_BYTES, metrics::Unit::Bytes, "Virtual memory size in bytes.");
        metrics::register_gauge!(METRIC_VIRTUAL_MEMORY_MAX_BYTES, metrics::Unit::Bytes, "Maximum amount of virtual memory available in bytes.");
        metrics::register_gauge!(METRIC_RESIDENT_MEMORY_BYTES, metrics::Unit::Bytes, "Resident memory size in bytes.");
        metrics::register_gauge!(METRIC_THREADS, metrics::Unit::Count, "Number of OS threads in the process.");
        Self::default()
    }
}

impl ArchiveMetrics for PromMetrics {
    fn broker_state(&self, broker: &str, state: &str) {
        let mut broker_states = match self.broker_states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let previous = broker_states.insert(broker.to_string(), state.to_string());

        for known in BROKER_STATES {
            let val = if *known == state { 1.0 } else { 0.0 };
            metrics::gauge!(METRIC_BROKER_STATE, val, "broker" => broker.to_string(), "state" => *known);
        }
        // Unknown states have no fixed series, so the last one must be cleared explicitly.
        if let Some(previous) = previous.filter(|prev| prev != state && !BROKER_STATES.contains(&prev.as_str())) {
            metrics::gauge!(METRIC_BROKER_STATE, 0.0, "broker" => broker.to_string(), "state" => previous);
        }
        if !BROKER_STATES.contains(&state) {
            tracing::warn!(broker, state, "unknown broker state reported");
            metrics::gauge!(METRIC_BROKER_STATE, 1.0, "broker" => broker.to_string(), "state" => state.to_string());
        }
    }

    fn message_received(&self, topic: &str, partition: i32) {
        metrics::increment_counter!(METRIC_MESSAGES_RECEIVED, "topic" => topic.to_string(), "partition" => partition.to_string());
    }

    fn message_errored(&self, topic: &str, partition: i32) {
        metrics::increment_counter!(METRIC_MESSAGES_ERRORED, "topic" => topic.to_string(), "partition" => partition.to_string());
    }
}

/// Collect a sample of process metrics.
#[cfg(not(target_os = "linux"))]
pub fn collect_proc_metrics() -> Result<()> {
    anyhow::bail!("process metrics sampling is only supported on Linux")
}

/// Collect a sample of process metrics.
#[cfg(target_os = "linux")]
pub fn collect_proc_metrics() -> Result<()> {
    use anyhow::Context;
    use procfs::process::{LimitValue, Process};
    use procfs::WithCurrentSystemInfo;

    let proc = Process::myself().context("error gathering process metrics")?;

    match proc.fd_count() {
        Ok(open_fds) => metrics::gauge!(METRIC_OPEN_FDS, open_fds as f64),
        Err(err) => tracing::error!(error = ?err, "error gathering metric {}", METRIC_OPEN_FDS),
    }
    match proc.limits() {
        Ok(limits) => {
            if let LimitValue::Value(max) = limits.max_open_files.soft_limit {
                metrics::gauge!(METRIC_MAX_FDS, max as f64);
            }
            if let LimitValue::Value(max) = limits.max_address_space.soft_limit {
                metrics::gauge!(METRIC_VIRTUAL_MEMORY_MAX_BYTES, max as f64);
            }
        }
        Err(err) => tracing::error!(error = ?err, "error gathering metric {}", METRIC_MAX_FDS),
    }

    let stat = proc.stat().context("error reading process stat")?;
    metrics::gauge!(METRIC_VIRTUAL_MEMORY_BYTES, stat.vsize as f64);
    metrics::gauge!(METRIC_RESIDENT_MEMORY_BYTES, stat.rss_bytes().get() as f64);
    metrics::gauge!(METRIC_THREADS, stat.num_threads as f64);
    Ok(())
}

/// Spawn a process metrics sampler which will shutdown when the given `shutdown` future resolves.
pub fn spawn_proc_metrics_sampler(shutdown: impl Future<Output = ()> + Send + 'static) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sample_interval = tokio::time::interval(PROC_SAMPLE_INTERVAL);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = sample_interval.tick() => if let Err(err) = collect_proc_metrics() {
                    tracing::error!(error = ?err, "error collecting process metrics sample, stopping sampler");
                    break;
                },
                _ = &mut shutdown => break,
            }
        }
    })
}

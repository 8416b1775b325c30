//! Runtime configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// The prefix of environment variables which are passed through to the Kafka client.
pub const KAFKA_ENV_PREFIX: &str = "KAFKA_";
/// The consumer group used when none is configured.
pub const DEFAULT_GROUP_ID: &str = "kafka-archiver";

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The name of the bucket to which messages are archived.
    pub bucket_name: String,
    /// The port on which Prometheus metrics are served.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,

    /// The maximum amount of time a single poll of the broker will block.
    #[serde(default = "Config::default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// The maximum number of messages processed per consume cycle.
    #[serde(default = "Config::default_poll_batch_size")]
    pub poll_batch_size: usize,
    /// The interval at which the Kafka client emits statistics.
    #[serde(default = "Config::default_stats_interval_ms")]
    pub stats_interval_ms: u64,
    /// The timeout used when listing the broker's topics.
    #[serde(default = "Config::default_metadata_timeout_ms")]
    pub metadata_timeout_ms: u64,

    /// The object store backend to archive to.
    #[serde(default)]
    pub store_backend: StoreBackend,
    /// The root directory used by the `local` store backend.
    #[serde(default = "Config::default_local_store_path")]
    pub local_store_path: String,

    /// Kafka client properties.
    ///
    /// This value is derived from all `KAFKA_` prefixed variables of the environment.
    #[serde(skip, default)]
    pub kafka: BTreeMap<String, String>,
}

/// The object store backend to archive to.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Amazon S3, configured from the standard AWS environment variables.
    #[default]
    S3,
    /// A directory on the local filesystem.
    Local,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that.
    pub fn new() -> Result<Self> {
        let mut config: Config = envy::from_env().context("error building config from env")?;
        config.kafka = kafka_config_from_env(std::env::vars());
        ensure!(config.kafka.contains_key("bootstrap.servers"), "KAFKA_BOOTSTRAP_SERVERS must be set");
        Ok(config)
    }

    /// The maximum amount of time a single poll of the broker will block.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    fn default_metrics_port() -> u16 {
        8000
    }

    fn default_poll_timeout_ms() -> u64 {
        1_000
    }

    fn default_poll_batch_size() -> usize {
        100
    }

    fn default_stats_interval_ms() -> u64 {
        1_000
    }

    fn default_metadata_timeout_ms() -> u64 {
        10_000
    }

    fn default_local_store_path() -> String {
        "/tmp/kafka-archive".into()
    }

    /// Create a config suitable for tests, archiving to a temporary directory.
    #[cfg(test)]
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir().context("error creating tmp dir for test")?;
        let mut config: Config = envy::from_iter(vec![
            ("RUST_LOG".to_string(), "error".to_string()),
            ("BUCKET_NAME".to_string(), "test-archive".to_string()),
            ("STORE_BACKEND".to_string(), "local".to_string()),
            ("LOCAL_STORE_PATH".to_string(), tmpdir.path().to_string_lossy().into_owned()),
        ])
        .context("error building test config")?;
        config.kafka = kafka_config_from_env(vec![("KAFKA_BOOTSTRAP_SERVERS".to_string(), "localhost:9092".to_string())]);
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}

/// Build the Kafka client properties from the given environment variables.
///
/// Every variable prefixed with `KAFKA_` is mapped to a client property by dropping the prefix,
/// lowercasing, and replacing `_` with `.`, so `KAFKA_BOOTSTRAP_SERVERS` becomes
/// `bootstrap.servers`. The consumer group defaults to `DEFAULT_GROUP_ID`.
pub fn kafka_config_from_env<I>(vars: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut props: BTreeMap<String, String> = vars
        .into_iter()
        .filter_map(|(key, val)| {
            let name = key.strip_prefix(KAFKA_ENV_PREFIX)?;
            Some((name.to_lowercase().replace('_', "."), val))
        })
        .filter(|(name, _)| !name.is_empty())
        .collect();
    props.entry("group.id".into()).or_insert_with(|| DEFAULT_GROUP_ID.into());
    props
}

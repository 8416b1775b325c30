use std::ffi::{c_char, c_void, CStr};
use std::sync::Arc;
use std::time::Duration;
use std::{ptr, slice};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::bindings::{self, rd_kafka_resp_err_t::RD_KAFKA_RESP_ERR_NO_ERROR};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{ClientContext, Offset, Timestamp, TopicPartitionList};
use tokio::sync::mpsc;

use crate::broker::{BrokerClient, ConsumedMessage, MessageHeader, MessageTimestamp, OFFSET_INVALID};
use crate::config::Config;

/// The consumer context used to forward librdkafka statistics out of the client.
///
/// Statistics callbacks are invoked from within the client's poll call, so payloads are handed
/// off to the stats reporter over a bounded channel and never processed inline.
pub struct ArchiveContext {
    stats_tx: mpsc::Sender<Vec<u8>>,
}

impl ArchiveContext {
    /// Create a new instance.
    pub fn new(stats_tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { stats_tx }
    }
}

impl ClientContext for ArchiveContext {
    fn stats_raw(&self, statistics: &[u8]) {
        if let Err(err) = self.stats_tx.try_send(statistics.to_vec()) {
            tracing::warn!(error = %err, "dropping broker statistics payload");
        }
    }
}

impl ConsumerContext for ArchiveContext {}

/// A broker client backed by a librdkafka consumer.
pub struct KafkaBroker {
    consumer: Arc<BaseConsumer<ArchiveContext>>,
    /// The maximum number of messages taken per poll.
    batch_size: usize,
    /// The timeout used when listing topics.
    metadata_timeout: Duration,
}

impl KafkaBroker {
    /// Create a new instance.
    ///
    /// Statistics payloads emitted by the client will be sent over the given channel.
    pub fn new(config: &Config, stats_tx: mpsc::Sender<Vec<u8>>) -> Result<Self> {
        let mut client_config = ClientConfig::new();
        for (key, val) in config.kafka.iter() {
            client_config.set(key, val);
        }
        client_config
            .set("statistics.interval.ms", config.stats_interval_ms.to_string())
            .set("enable.auto.offset.store", "false");
        let consumer: BaseConsumer<ArchiveContext> = client_config
            .create_with_context(ArchiveContext::new(stats_tx))
            .context("error creating kafka consumer")?;
        Ok(Self {
            consumer: Arc::new(consumer),
            batch_size: config.poll_batch_size.max(1),
            metadata_timeout: Duration::from_millis(config.metadata_timeout_ms),
        })
    }
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    async fn subscribe_all(&mut self) -> Result<Vec<String>> {
        let (consumer, timeout) = (self.consumer.clone(), self.metadata_timeout);
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let metadata = consumer.fetch_metadata(None, timeout).context("error listing broker topics")?;
            let topics: Vec<String> = metadata.topics().iter().map(|topic| topic.name().to_string()).collect();
            let names: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer.subscribe(&names).context("error subscribing to broker topics")?;
            Ok(topics)
        })
        .await
        .context("error joining broker subscription task")?
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumedMessage>> {
        let (consumer, batch_size) = (self.consumer.clone(), self.batch_size);
        tokio::task::spawn_blocking(move || {
            // Only the first poll waits, everything after drains what is already buffered.
            let (mut batch, mut wait) = (Vec::new(), timeout);
            while batch.len() < batch_size {
                match consumer.poll(wait) {
                    Some(Ok(msg)) => batch.push(snapshot_message(&msg)),
                    Some(Err(err)) => batch.push(snapshot_error(&err)),
                    None => break,
                }
                wait = Duration::ZERO;
            }
            batch
        })
        .await
        .context("error joining broker poll task")
    }

    fn ack(&mut self, message: &ConsumedMessage) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&message.topic, message.partition, Offset::Offset(message.offset + 1))
            .context("error building offset list")?;
        self.consumer.store_offsets(&tpl).context("error storing consumed offset")
    }
}

/// Take an owned snapshot of the given message.
fn snapshot_message(msg: &BorrowedMessage<'_>) -> ConsumedMessage {
    // SAFETY: the message pointer is valid for as long as `msg` is borrowed, and the header list
    // returned is owned by the message.
    let headers = unsafe {
        let mut hdrs: *mut bindings::rd_kafka_headers_t = ptr::null_mut();
        let res = bindings::rd_kafka_message_headers(msg.ptr(), &mut hdrs);
        (matches!(res, RD_KAFKA_RESP_ERR_NO_ERROR) && !hdrs.is_null()).then(|| read_headers(hdrs))
    };
    let timestamp = match msg.timestamp() {
        Timestamp::NotAvailable => MessageTimestamp::NotAvailable,
        Timestamp::CreateTime(ms) => MessageTimestamp::CreateTime(ms),
        Timestamp::LogAppendTime(ms) => MessageTimestamp::LogAppendTime(ms),
    };
    // SAFETY: the message pointer is valid for as long as `msg` is borrowed, and both calls
    // only read fields of the message struct.
    let (latency_us, leader_epoch) = unsafe { (bindings::rd_kafka_message_latency(msg.ptr()), bindings::rd_kafka_message_leader_epoch(msg.ptr())) };

    ConsumedMessage {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        key: msg.key().map(<[u8]>::to_vec),
        value: msg.payload().map(<[u8]>::to_vec),
        headers,
        timestamp,
        latency: u64::try_from(latency_us).ok().map(Duration::from_micros),
        leader_epoch: (leader_epoch >= 0).then_some(leader_epoch),
        error: None,
    }
}

/// Read every header of the given header list.
///
/// Header names are taken as raw bytes, as producers are free to send names which are not
/// valid UTF-8.
///
/// # Safety
/// `hdrs` must point to a valid header list which is not modified for the duration of the call.
pub(super) unsafe fn read_headers(hdrs: *const bindings::rd_kafka_headers_t) -> Vec<MessageHeader> {
    let count = bindings::rd_kafka_header_cnt(hdrs);
    let mut headers = Vec::with_capacity(count);
    for idx in 0..count {
        let (mut name, mut value, mut size): (*const c_char, *const c_void, usize) = (ptr::null(), ptr::null(), 0);
        let res = bindings::rd_kafka_header_get_all(hdrs, idx, &mut name, &mut value, &mut size);
        if !matches!(res, RD_KAFKA_RESP_ERR_NO_ERROR) || name.is_null() {
            break;
        }
        headers.push(MessageHeader {
            name: CStr::from_ptr(name).to_bytes().to_vec(),
            value: (!value.is_null()).then(|| slice::from_raw_parts(value.cast::<u8>(), size).to_vec()),
        });
    }
    headers
}

/// Build an error-state snapshot from an error the client returned in place of a message.
pub(super) fn snapshot_error(err: &KafkaError) -> ConsumedMessage {
    let partition = match err {
        KafkaError::PartitionEOF(partition) => *partition,
        _ => -1,
    };
    ConsumedMessage {
        topic: String::new(),
        partition,
        offset: OFFSET_INVALID,
        key: None,
        value: None,
        headers: None,
        timestamp: MessageTimestamp::NotAvailable,
        latency: None,
        leader_epoch: None,
        error: Some(err.to_string()),
    }
}

//! Broker client abstractions.
//!
//! The archive pipeline only depends upon the `BrokerClient` trait and the owned
//! `ConsumedMessage` snapshot type. The production implementation is `KafkaBroker`, backed by
//! librdkafka.

mod kafka;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

pub use kafka::KafkaBroker;

/// The offset librdkafka uses to indicate that no valid offset is known.
pub const OFFSET_INVALID: i64 = -1001;

/// A client capable of delivering messages from the broker.
#[async_trait]
pub trait BrokerClient: Send + 'static {
    /// Subscribe to every topic currently known to the broker, returning the topic names.
    async fn subscribe_all(&mut self) -> Result<Vec<String>>;

    /// Poll for the next batch of messages.
    ///
    /// This will block for at most `timeout` before returning, and may return an empty batch.
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumedMessage>>;

    /// Acknowledge that the given message has been durably archived.
    fn ack(&mut self, message: &ConsumedMessage) -> Result<()>;
}

/// A snapshot of a single message delivered by the broker.
///
/// Delivery errors which the broker reports in place of a message are represented with the
/// `error` field populated. For such errors the coordinates may be unknown, in which case the
/// topic is empty, the partition is `-1` and the offset is `OFFSET_INVALID`. Such errors share one
/// archive object, which the object store places at `topics/partition=-1/+-1+-1001.json` as empty
/// path segments are dropped.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub headers: Option<Vec<MessageHeader>>,
    pub timestamp: MessageTimestamp,
    /// Time between produce and consume, when known.
    pub latency: Option<Duration>,
    pub leader_epoch: Option<i32>,
    pub error: Option<String>,
}

impl ConsumedMessage {
    /// Check if this message has a valid offset which may be acknowledged.
    pub fn has_offset(&self) -> bool {
        self.offset >= 0 && self.partition >= 0 && !self.topic.is_empty()
    }
}

/// A single message header.
///
/// Both name and value are kept as raw bytes, neither is guaranteed to be valid UTF-8.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub name: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// A message timestamp along with the way it was assigned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MessageTimestamp {
    NotAvailable,
    /// Milliseconds since epoch, assigned by the producer.
    CreateTime(i64),
    /// Milliseconds since epoch, assigned by the broker.
    LogAppendTime(i64),
}

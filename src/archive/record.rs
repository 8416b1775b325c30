use serde::Serialize;

use crate::broker::{ConsumedMessage, MessageTimestamp};

/// A self-describing JSON projection of a consumed message.
///
/// Every field is always present in the serialized form; absent values are written as `null`.
/// All byte payloads are decoded to text, see `decode_text`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ArchiveRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: MessageTimestamp,
    /// Produce-to-consume latency in seconds.
    pub latency: Option<f64>,
    pub leader_epoch: Option<i32>,
    pub key: Option<String>,
    pub value: Option<String>,
    pub headers: Option<Vec<ArchiveHeader>>,
    pub error: Option<String>,
}

/// A decoded message header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ArchiveHeader {
    pub name: String,
    pub value: Option<String>,
}

impl ArchiveRecord {
    /// Project the given message into its archive record.
    #[tracing::instrument(level = "trace", skip(msg), fields(topic = %msg.topic, partition = msg.partition, offset = msg.offset))]
    pub fn project(msg: &ConsumedMessage) -> Self {
        let headers = msg.headers.as_ref().map(|headers| {
            headers
                .iter()
                .map(|header| ArchiveHeader {
                    name: decode_text("header name", &header.name),
                    value: header.value.as_deref().map(|val| decode_text("header", val)),
                })
                .collect()
        });
        Self {
            topic: msg.topic.clone(),
            partition: msg.partition,
            offset: msg.offset,
            timestamp: msg.timestamp,
            latency: msg.latency.map(|latency| latency.as_secs_f64()),
            leader_epoch: msg.leader_epoch,
            key: msg.key.as_deref().map(|key| decode_text("key", key)),
            value: msg.value.as_deref().map(|value| decode_text("value", value)),
            headers,
            error: msg.error.clone(),
        }
    }

    /// Serialize this record as the JSON body of an archive object.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Decode the given bytes as text.
///
/// Bytes are decoded as UTF-8 when valid. Otherwise they are decoded as latin-1, which maps
/// every byte to exactly one char and can not fail.
pub fn decode_text(field: &str, bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(err) => {
            tracing::warn!(error = %err, field, "invalid utf-8 in message data, decoding as latin-1");
            bytes.iter().copied().map(char::from).collect()
        }
    }
}

use std::fmt;

/// Characters which are not safe for use in object store keys or filesystem paths.
const UNSAFE_TOPIC_CHARS: &[char] = &['/', ':', '*', '?', '"', '<', '>', '|'];

/// Sanitize a topic name for use as a segment of an object key.
///
/// Kafka limits topic names to ASCII alphanumerics, `.`, `_` and `-`, however the broker client
/// is not trusted to enforce this, so any path separators or shell-hostile characters are
/// replaced with `_` and surrounding whitespace is stripped. This function is idempotent.
pub fn sanitize_topic(topic: &str) -> String {
    topic.trim().replace(UNSAFE_TOPIC_CHARS, "_")
}

/// The object key under which a single archived message is stored.
///
/// Keys follow the layout of the Confluent S3 sink connector, with one object per offset:
/// `topics/<topic>/partition=<partition>/<topic>+<partition>+<offset>.json`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArchiveKey(String);

impl ArchiveKey {
    /// Build the archive key for the given message coordinates.
    ///
    /// Partition and offset are taken verbatim from the broker.
    pub fn new(topic: &str, partition: i32, offset: i64) -> Self {
        let topic = sanitize_topic(topic);
        Self(format!("topics/{topic}/partition={partition}/{topic}+{partition}+{offset}.json"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

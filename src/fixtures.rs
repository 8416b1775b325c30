use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::broker::{BrokerClient, ConsumedMessage, MessageHeader, MessageTimestamp};
use crate::prom::ArchiveMetrics;

/// Build the example message used throughout the test suite.
pub fn example_message() -> ConsumedMessage {
    ConsumedMessage {
        topic: "example_topic".into(),
        partition: 0,
        offset: 1,
        key: Some(b"example key".to_vec()),
        value: Some(br#"{"alert":"example"}"#.to_vec()),
        headers: Some(vec![
            MessageHeader {
                name: b"header1".to_vec(),
                value: Some(b"value".to_vec()),
            },
            MessageHeader {
                name: b"header2".to_vec(),
                value: Some(b"value2".to_vec()),
            },
        ]),
        timestamp: MessageTimestamp::CreateTime(1_690_000_000_000),
        latency: Some(Duration::from_millis(250)),
        leader_epoch: Some(3),
        error: None,
    }
}

/// Build a bare message with the given coordinates and no optional fields.
pub fn bare_message(topic: &str, partition: i32, offset: i64) -> ConsumedMessage {
    ConsumedMessage {
        topic: topic.into(),
        partition,
        offset,
        key: None,
        value: None,
        headers: None,
        timestamp: MessageTimestamp::NotAvailable,
        latency: None,
        leader_epoch: None,
        error: None,
    }
}

/// Build a message carrying a delivery error.
pub fn error_message(topic: &str, partition: i32, offset: i64, error: &str) -> ConsumedMessage {
    ConsumedMessage {
        error: Some(error.into()),
        ..bare_message(topic, partition, offset)
    }
}

/// A broker client which delivers a fixed script of batches.
///
/// Once the script is exhausted, a shutdown signal is sent and empty batches are returned.
pub struct ScriptedBroker {
    pub topics: Vec<String>,
    pub batches: VecDeque<Vec<ConsumedMessage>>,
    pub acked: Arc<Mutex<Vec<(String, i32, i64)>>>,
    pub polls: Arc<Mutex<usize>>,
    pub fail_subscribe: bool,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl ScriptedBroker {
    pub fn new(batches: Vec<Vec<ConsumedMessage>>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            topics: vec!["example_topic".into()],
            batches: batches.into(),
            acked: Default::default(),
            polls: Default::default(),
            fail_subscribe: false,
            shutdown_tx,
        }
    }
}

#[async_trait]
impl BrokerClient for ScriptedBroker {
    async fn subscribe_all(&mut self) -> Result<Vec<String>> {
        if self.fail_subscribe {
            bail!("broker unavailable");
        }
        Ok(self.topics.clone())
    }

    async fn poll(&mut self, _timeout: Duration) -> Result<Vec<ConsumedMessage>> {
        *self.polls.lock().expect("polls lock poisoned") += 1;
        match self.batches.pop_front() {
            Some(batch) => Ok(batch),
            None => {
                let _ = self.shutdown_tx.send(());
                Ok(vec![])
            }
        }
    }

    fn ack(&mut self, message: &ConsumedMessage) -> Result<()> {
        self.acked
            .lock()
            .expect("acked lock poisoned")
            .push((message.topic.clone(), message.partition, message.offset));
        Ok(())
    }
}

/// A metrics implementation which records all observations in memory.
#[derive(Default)]
pub struct RecordingMetrics {
    pub broker_states: Mutex<HashMap<String, String>>,
    pub received: Mutex<HashMap<(String, i32), u64>>,
    pub errored: Mutex<HashMap<(String, i32), u64>>,
}

impl RecordingMetrics {
    pub fn received(&self, topic: &str, partition: i32) -> u64 {
        let received = self.received.lock().expect("received lock poisoned");
        received.get(&(topic.to_string(), partition)).copied().unwrap_or(0)
    }

    pub fn errored(&self, topic: &str, partition: i32) -> u64 {
        let errored = self.errored.lock().expect("errored lock poisoned");
        errored.get(&(topic.to_string(), partition)).copied().unwrap_or(0)
    }

    pub fn total_received(&self) -> u64 {
        self.received.lock().expect("received lock poisoned").values().sum()
    }

    pub fn state_of(&self, broker: &str) -> Option<String> {
        self.broker_states.lock().expect("broker states lock poisoned").get(broker).cloned()
    }
}

impl ArchiveMetrics for RecordingMetrics {
    fn broker_state(&self, broker: &str, state: &str) {
        self.broker_states
            .lock()
            .expect("broker states lock poisoned")
            .insert(broker.to_string(), state.to_string());
    }

    fn message_received(&self, topic: &str, partition: i32) {
        *self
            .received
            .lock()
            .expect("received lock poisoned")
            .entry((topic.to_string(), partition))
            .or_default() += 1;
    }

    fn message_errored(&self, topic: &str, partition: i32) {
        *self
            .errored
            .lock()
            .expect("errored lock poisoned")
            .entry((topic.to_string(), partition))
            .or_default() += 1;
    }
}

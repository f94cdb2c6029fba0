pub mod kafka;
pub mod poll_loop;
pub mod push;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::config::SourceSettings;
use crate::errors::{DeliveryError, SourceError};

/// A message received from the source regardless of whether it's Kafka, Pulsar, etc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMessage {
    /// Topic or stream name of this message
    pub topic: String,
    /// partition or shard ID
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    /// decoded body of the message, `None` for tombstones
    pub payload: Option<String>,
    /// Milliseconds since the epoch, when the source provides one.
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl SourceMessage {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload: Some(payload.into()),
            timestamp: None,
            headers: HashMap::new(),
        }
    }
}

/// Messages returned by one poll, in the order the client produced them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageBatch {
    pub messages: Vec<SourceMessage>,
}

/// Position to persist for one partition: the offset of the next message to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitPosition {
    pub topic: String,
    pub partition: i32,
    pub next_offset: i64,
}

impl MessageBatch {
    pub fn new(messages: Vec<SourceMessage>) -> Self {
        Self { messages }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// One position per partition, just past the highest offset seen in the batch.
    pub fn commit_positions(&self) -> Vec<CommitPosition> {
        let mut highest: BTreeMap<(&str, i32), i64> = BTreeMap::new();
        for message in &self.messages {
            let entry = highest
                .entry((message.topic.as_str(), message.partition))
                .or_insert(message.offset);
            *entry = (*entry).max(message.offset);
        }

        highest
            .into_iter()
            .map(|((topic, partition), offset)| CommitPosition {
                topic: topic.to_string(),
                partition,
                next_offset: offset + 1,
            })
            .collect()
    }
}

/// Live connection to the external queue, exclusively owned by one connector.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueClient: Send {
    async fn subscribe(&mut self, topic: &str) -> Result<(), SourceError>;

    /// Receives up to `max_messages` messages.
    ///
    /// Blocks until messages are available or `timeout` elapses. An empty
    /// `MessageBatch` indicates that the poll timed out without new messages.
    async fn poll(
        &mut self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<MessageBatch, SourceError>;

    /// Synchronously persists the given positions.
    async fn commit_sync(&mut self, positions: &[CommitPosition]) -> Result<(), SourceError>;

    /// Closes the connection to the source and cleans up resources.
    async fn close(&mut self) -> Result<(), SourceError>;
}

/// Destination for messages the consumer could not process.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeadLetterSink: Send {
    async fn publish(
        &mut self,
        message: &SourceMessage,
        error: &DeliveryError,
    ) -> Result<(), SourceError>;
}

/// Creates source connections. Connectors call it from `start`, never from `open`.
#[cfg_attr(test, mockall::automock)]
pub trait QueueClientFactory: Send + Sync {
    fn connect(&self, settings: &SourceSettings) -> Result<Box<dyn QueueClient>, SourceError>;

    fn dead_letter_sink(
        &self,
        settings: &SourceSettings,
        topic: &str,
    ) -> Result<Box<dyn DeadLetterSink>, SourceError>;
}

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use connect_core::config::{ConnectorConfig, SourceSettings, keys};
use connect_core::connector::DeliveryCallback;
use connect_core::errors::{DeliveryError, KafkaError, SourceError};
use connect_core::source::{
    CommitPosition, DeadLetterSink, MessageBatch, QueueClient, QueueClientFactory, SourceMessage,
};

pub const TOPIC: &str = "t1";

/// Everything the fake queue and the recording consumers observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Poll,
    Deliver(Vec<String>),
    Commit(Vec<CommitPosition>),
    DeadLetter(String),
    Close,
}

#[derive(Default)]
pub struct FakeState {
    pub script: VecDeque<Result<MessageBatch, SourceError>>,
    pub commit_failures: VecDeque<SourceError>,
    pub events: Vec<Event>,
    pub connects: usize,
    pub subscriptions: Vec<String>,
    pub poll_args: Vec<(usize, Duration)>,
    pub fail_connect: bool,
    pub fail_subscribe: bool,
    pub fail_close: bool,
    pub fail_dead_letter: bool,
    pub fail_dead_letter_sink: bool,
}

/// In-memory queue. Polls return scripted results first, then wait out the
/// poll timeout and return an empty batch forever.
#[derive(Clone, Default)]
pub struct FakeQueue {
    state: Arc<Mutex<FakeState>>,
}

impl FakeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batches(batches: Vec<MessageBatch>) -> Self {
        let queue = Self::new();
        for batch in batches {
            queue.push_batch(batch);
        }
        queue
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn push_batch(&self, batch: MessageBatch) {
        self.state().script.push_back(Ok(batch));
    }

    pub fn push_poll_error(&self, err: SourceError) {
        self.state().script.push_back(Err(err));
    }

    pub fn factory(&self) -> FakeFactory {
        FakeFactory {
            queue: self.clone(),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    /// Events without the polls, which keep ticking while the loop is idle.
    pub fn activity(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|event| *event != Event::Poll)
            .collect()
    }

    pub fn deliveries(&self) -> Vec<Vec<String>> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Deliver(batch) => Some(batch),
                _ => None,
            })
            .collect()
    }

    pub fn commit_count(&self) -> usize {
        self.count(|event| matches!(event, Event::Commit(_)))
    }

    pub fn close_count(&self) -> usize {
        self.count(|event| *event == Event::Close)
    }

    pub fn poll_count(&self) -> usize {
        self.count(|event| *event == Event::Poll)
    }

    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.state().events.iter().filter(|&event| predicate(event)).count()
    }

    fn record(&self, event: Event) {
        self.state().events.push(event);
    }

    /// Consumer that records every delivery.
    pub fn recording_consumer(&self) -> DeliveryCallback<String> {
        let queue = self.clone();
        Arc::new(move |batch: Vec<String>| -> anyhow::Result<()> {
            queue.record(Event::Deliver(batch));
            Ok(())
        })
    }

    /// Consumer that rejects any batch containing `poison` and records the rest.
    pub fn rejecting_consumer(&self, poison: &'static str) -> DeliveryCallback<String> {
        let queue = self.clone();
        Arc::new(move |batch: Vec<String>| -> anyhow::Result<()> {
            if batch.iter().any(|payload| payload == poison) {
                anyhow::bail!("cannot process {poison}");
            }
            queue.record(Event::Deliver(batch));
            Ok(())
        })
    }

    /// Consumer that panics on any batch containing `poison` and records the rest.
    pub fn panicking_consumer(&self, poison: &'static str) -> DeliveryCallback<String> {
        let queue = self.clone();
        Arc::new(move |batch: Vec<String>| -> anyhow::Result<()> {
            if batch.iter().any(|payload| payload == poison) {
                panic!("malformed record {poison}");
            }
            queue.record(Event::Deliver(batch));
            Ok(())
        })
    }
}

pub struct FakeFactory {
    queue: FakeQueue,
}

impl QueueClientFactory for FakeFactory {
    fn connect(&self, _settings: &SourceSettings) -> Result<Box<dyn QueueClient>, SourceError> {
        let mut state = self.queue.state();
        state.connects += 1;
        if state.fail_connect {
            return Err(SourceError::connection(KafkaError::ConsumerCreation {
                reason: "broker unreachable".to_string(),
            }));
        }
        Ok(Box::new(FakeClient {
            queue: self.queue.clone(),
            closed: false,
        }))
    }

    fn dead_letter_sink(
        &self,
        _settings: &SourceSettings,
        topic: &str,
    ) -> Result<Box<dyn DeadLetterSink>, SourceError> {
        if self.queue.state().fail_dead_letter_sink {
            return Err(SourceError::connection(KafkaError::DeadLetter {
                topic: topic.to_string(),
                reason: "producer creation failed".to_string(),
            }));
        }
        Ok(Box::new(FakeDeadLetter {
            queue: self.queue.clone(),
        }))
    }
}

pub struct FakeClient {
    queue: FakeQueue,
    closed: bool,
}

#[async_trait]
impl QueueClient for FakeClient {
    async fn subscribe(&mut self, topic: &str) -> Result<(), SourceError> {
        let mut state = self.queue.state();
        state.subscriptions.push(topic.to_string());
        if state.fail_subscribe {
            return Err(SourceError::connection(KafkaError::Subscription {
                topic: topic.to_string(),
                reason: "unknown topic".to_string(),
            }));
        }
        Ok(())
    }

    async fn poll(
        &mut self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<MessageBatch, SourceError> {
        let next = {
            let mut state = self.queue.state();
            state.events.push(Event::Poll);
            state.poll_args.push((max_messages, timeout));
            state.script.pop_front()
        };

        match next {
            Some(result) => result,
            None => {
                tokio::time::sleep(timeout).await;
                Ok(MessageBatch::empty())
            }
        }
    }

    async fn commit_sync(&mut self, positions: &[CommitPosition]) -> Result<(), SourceError> {
        let mut state = self.queue.state();
        if let Some(err) = state.commit_failures.pop_front() {
            return Err(err);
        }
        state.events.push(Event::Commit(positions.to_vec()));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        assert!(!self.closed, "connection released twice");
        self.closed = true;

        let mut state = self.queue.state();
        state.events.push(Event::Close);
        if state.fail_close {
            return Err(SourceError::unrecoverable(KafkaError::Consumption {
                reason: "socket already gone".to_string(),
            }));
        }
        Ok(())
    }
}

pub struct FakeDeadLetter {
    queue: FakeQueue,
}

#[async_trait]
impl DeadLetterSink for FakeDeadLetter {
    async fn publish(
        &mut self,
        message: &SourceMessage,
        _error: &DeliveryError,
    ) -> Result<(), SourceError> {
        let mut state = self.queue.state();
        if state.fail_dead_letter {
            return Err(SourceError::unrecoverable(KafkaError::DeadLetter {
                topic: format!("{TOPIC}-dlq"),
                reason: "not authorized".to_string(),
            }));
        }
        let payload = message.payload.clone().unwrap_or_default();
        state.events.push(Event::DeadLetter(payload));
        Ok(())
    }
}

pub fn batch(payloads: &[&str], first_offset: i64) -> MessageBatch {
    MessageBatch::new(
        payloads
            .iter()
            .enumerate()
            .map(|(i, payload)| SourceMessage::new(TOPIC, 0, first_offset + i as i64, *payload))
            .collect(),
    )
}

pub fn config(auto_commit: bool) -> ConnectorConfig {
    ConnectorConfig::new()
        .with(keys::TOPIC, TOPIC)
        .with(keys::BOOTSTRAP_SERVERS, "h:9092")
        .with(keys::GROUP_ID, "g1")
        .with(keys::FETCH_MIN_BYTES, 1)
        .with(keys::AUTO_COMMIT_INTERVAL_MS, 1000)
        .with(keys::SESSION_TIMEOUT_MS, 10000)
        .with(keys::AUTO_COMMIT_ENABLED, auto_commit)
}

pub fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

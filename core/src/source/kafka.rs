use async_trait::async_trait;
use futures::FutureExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{CommitPolicy, SourceSettings};
use crate::errors::{DeliveryError, KafkaError, SourceError};
use crate::source::push::PushSourceConnector;
use crate::source::{
    CommitPosition, DeadLetterSink, MessageBatch, QueueClient, QueueClientFactory, SourceMessage,
};

const DEAD_LETTER_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Push source reading string messages from a Kafka topic.
pub type KafkaSource = PushSourceConnector<KafkaClientFactory>;

impl PushSourceConnector<KafkaClientFactory> {
    pub fn kafka() -> Self {
        Self::new(KafkaClientFactory)
    }
}

/// Builds rdkafka clients from validated [`SourceSettings`].
#[derive(Debug, Clone, Copy, Default)]
pub struct KafkaClientFactory;

impl KafkaClientFactory {
    pub fn consumer_config(settings: &SourceSettings) -> ClientConfig {
        let mut client_config = Self::common_config(settings);

        client_config
            .set("group.id", &settings.group_id)
            .set("enable.partition.eof", "false")
            .set("fetch.min.bytes", settings.fetch_min_bytes.to_string())
            .set(
                "auto.commit.interval.ms",
                settings.auto_commit_interval_ms.to_string(),
            )
            .set("session.timeout.ms", settings.session_timeout_ms.to_string())
            .set(
                "enable.auto.commit",
                (settings.commit_policy == CommitPolicy::Auto).to_string(),
            )
            .set("auto.offset.reset", &settings.auto_offset_reset);

        if let Some(heartbeat) = settings.heartbeat_interval_ms {
            client_config.set("heartbeat.interval.ms", heartbeat.to_string());
        }

        client_config
    }

    fn common_config(settings: &SourceSettings) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", &settings.bootstrap_servers);

        if let Some(security_protocol) = &settings.security_protocol {
            client_config.set("security.protocol", security_protocol);
        }

        if let Some(sasl_mechanisms) = &settings.sasl_mechanisms {
            client_config.set("sasl.mechanisms", sasl_mechanisms);
        }

        if let Some(sasl_username) = &settings.sasl_username {
            client_config.set("sasl.username", sasl_username);
        }

        if let Some(sasl_password) = &settings.sasl_password {
            client_config.set("sasl.password", sasl_password);
        }

        if let Some(ssl_ca_location) = &settings.ssl_ca_location {
            client_config.set("ssl.ca.location", ssl_ca_location);
        }

        client_config
    }
}

impl QueueClientFactory for KafkaClientFactory {
    fn connect(&self, settings: &SourceSettings) -> Result<Box<dyn QueueClient>, SourceError> {
        let consumer: StreamConsumer = Self::consumer_config(settings).create().map_err(|e| {
            SourceError::connection(KafkaError::ConsumerCreation {
                reason: e.to_string(),
            })
        })?;

        debug!(bootstrap_servers = %settings.bootstrap_servers, "Kafka consumer created");
        Ok(Box::new(KafkaQueueClient {
            consumer: Some(consumer),
        }))
    }

    fn dead_letter_sink(
        &self,
        settings: &SourceSettings,
        topic: &str,
    ) -> Result<Box<dyn DeadLetterSink>, SourceError> {
        let producer: FutureProducer = Self::common_config(settings)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| {
                SourceError::connection(KafkaError::DeadLetter {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })
            })?;

        Ok(Box::new(KafkaDeadLetterSink {
            producer,
            topic: topic.to_string(),
        }))
    }
}

pub struct KafkaQueueClient {
    consumer: Option<StreamConsumer>,
}

impl KafkaQueueClient {
    fn consumer(&self) -> Result<&StreamConsumer, SourceError> {
        self.consumer.as_ref().ok_or_else(|| {
            SourceError::unrecoverable(KafkaError::Consumption {
                reason: "consumer is closed".to_string(),
            })
        })
    }
}

#[async_trait]
impl QueueClient for KafkaQueueClient {
    async fn subscribe(&mut self, topic: &str) -> Result<(), SourceError> {
        self.consumer()?.subscribe(&[topic]).map_err(|e| {
            SourceError::connection(KafkaError::Subscription {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
        })?;

        info!("Subscribed to Kafka topic: {}", topic);
        Ok(())
    }

    /// Waits up to `poll_timeout` for the first message, then drains whatever
    /// is already buffered without waiting again.
    async fn poll(
        &mut self,
        max_messages: usize,
        poll_timeout: Duration,
    ) -> Result<MessageBatch, SourceError> {
        let consumer = self.consumer()?;

        let first = match timeout(poll_timeout, consumer.recv()).await {
            Ok(Ok(message)) => convert_message(&message),
            Ok(Err(e)) => {
                return Err(SourceError::transient(KafkaError::Consumption {
                    reason: e.to_string(),
                }));
            }
            Err(_) => return Ok(MessageBatch::empty()),
        };

        let mut messages = vec![first];
        while messages.len() < max_messages {
            match consumer.recv().now_or_never() {
                Some(Ok(message)) => messages.push(convert_message(&message)),
                Some(Err(e)) => {
                    warn!("Error receiving message: {}", e);
                    break;
                }
                None => break,
            }
        }

        debug!("Consumed batch of {} messages", messages.len());
        Ok(MessageBatch::new(messages))
    }

    async fn commit_sync(&mut self, positions: &[CommitPosition]) -> Result<(), SourceError> {
        if positions.is_empty() {
            return Ok(());
        }

        let commit_error = |reason: String| SourceError::transient(KafkaError::OffsetCommit { reason });

        let mut tpl = TopicPartitionList::new();
        for position in positions {
            tpl.add_partition_offset(
                &position.topic,
                position.partition,
                Offset::Offset(position.next_offset),
            )
            .map_err(|e| commit_error(e.to_string()))?;
        }

        self.consumer()?
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| commit_error(e.to_string()))?;

        for position in positions {
            debug!(
                "Committed offset {} for partition {}",
                position.next_offset, position.partition
            );
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
            drop(consumer);
            info!("Kafka consumer closed");
        }
        Ok(())
    }
}

fn convert_message(message: &BorrowedMessage<'_>) -> SourceMessage {
    let key = message
        .key()
        .map(|k| String::from_utf8_lossy(k).to_string());

    let payload = message
        .payload()
        .map(|p| String::from_utf8_lossy(p).to_string());

    let mut headers = HashMap::new();
    if let Some(header_map) = message.headers() {
        for header in header_map.iter() {
            if let Some(value) = header.value {
                headers.insert(
                    header.key.to_string(),
                    String::from_utf8_lossy(value).to_string(),
                );
            }
        }
    }

    SourceMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key,
        payload,
        timestamp: message.timestamp().to_millis(),
        headers,
    }
}

/// Republishes undeliverable messages to a Kafka topic with the failure attached as headers.
pub struct KafkaDeadLetterSink {
    producer: FutureProducer,
    topic: String,
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn publish(
        &mut self,
        message: &SourceMessage,
        error: &DeliveryError,
    ) -> Result<(), SourceError> {
        let reason = error.to_string();
        let partition = message.partition.to_string();
        let offset = message.offset.to_string();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "x-delivery-error",
                value: Some(reason.as_str()),
            })
            .insert(Header {
                key: "x-source-topic",
                value: Some(message.topic.as_str()),
            })
            .insert(Header {
                key: "x-source-partition",
                value: Some(partition.as_str()),
            })
            .insert(Header {
                key: "x-source-offset",
                value: Some(offset.as_str()),
            });

        let mut record = FutureRecord::<str, str>::to(&self.topic).headers(headers);
        if let Some(key) = message.key.as_deref() {
            record = record.key(key);
        }
        if let Some(payload) = message.payload.as_deref() {
            record = record.payload(payload);
        }

        self.producer
            .send(record, DEAD_LETTER_SEND_TIMEOUT)
            .await
            .map_err(|(e, _)| {
                SourceError::transient(KafkaError::DeadLetter {
                    topic: self.topic.clone(),
                    reason: e.to_string(),
                })
            })?;

        debug!(
            "Dead lettered message {}/{}@{} to {}",
            message.topic, message.partition, message.offset, self.topic
        );
        Ok(())
    }
}

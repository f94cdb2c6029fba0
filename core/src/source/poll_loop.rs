use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{CommitPolicy, DeliveryFailurePolicy, SourceSettings};
use crate::connector::{ConnectorStatus, ConsumerSlot};
use crate::errors::{DeliveryError, SourceError};
use crate::source::{DeadLetterSink, MessageBatch, QueueClient, SourceMessage};
use crate::telemetry::SourceMetrics;

/// Background loop that polls the source and pushes messages to the consumer.
///
/// High-level logic:
/// 1. Poll a batch, racing the poll against cancellation.
/// 2. Deliver each payload to the consumer as a singleton collection, in order.
/// 3. With manual commit, commit the whole batch once every message is handled.
/// 4. Repeat until cancelled or a failure the policies cannot absorb.
///
/// Cancellation is observed between batches only, so a batch that was
/// fetched is always fully delivered before the loop returns.
pub(crate) struct PollLoop {
    client: Box<dyn QueueClient>,
    dead_letter: Option<Box<dyn DeadLetterSink>>,
    consumer: ConsumerSlot<String>,
    settings: SourceSettings,
    metrics: Arc<SourceMetrics>,
    status: Arc<watch::Sender<ConnectorStatus>>,
    cancel: CancellationToken,
}

impl PollLoop {
    pub(crate) fn new(
        client: Box<dyn QueueClient>,
        dead_letter: Option<Box<dyn DeadLetterSink>>,
        consumer: ConsumerSlot<String>,
        settings: SourceSettings,
        metrics: Arc<SourceMetrics>,
        status: Arc<watch::Sender<ConnectorStatus>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            dead_letter,
            consumer,
            settings,
            metrics,
            status,
            cancel,
        }
    }

    /// Runs until cancelled or failed and hands the client back for release.
    pub(crate) async fn run(mut self) -> Box<dyn QueueClient> {
        info!(topic = %self.settings.topic, "Poll loop started");
        let mut poll_failures = 0;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let polled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.client.poll(self.settings.max_poll_records, self.settings.poll_timeout) => result,
            };

            let batch = match polled {
                Ok(batch) => {
                    poll_failures = 0;
                    batch
                }
                Err(err) => {
                    self.metrics.record_poll_error();
                    if self.recover("Poll", &err, &mut poll_failures).await {
                        continue;
                    }
                    self.fail(format!("poll failed: {err}"));
                    break;
                }
            };

            self.metrics.record_batch(batch.len());
            if batch.is_empty() {
                continue;
            }

            if let Err(reason) = self.process_batch(batch).await {
                self.fail(reason);
                break;
            }
        }

        info!(topic = %self.settings.topic, "Poll loop exited");
        self.client
    }

    async fn process_batch(&mut self, batch: MessageBatch) -> Result<(), String> {
        debug!("Delivering batch of {} messages", batch.len());

        for message in &batch.messages {
            debug!(
                key = ?message.key,
                partition = message.partition,
                offset = message.offset,
                "Message received from source"
            );

            let Some(payload) = message.payload.clone() else {
                debug!(
                    partition = message.partition,
                    offset = message.offset,
                    "Skipping message without payload"
                );
                continue;
            };

            match self.deliver(payload) {
                Ok(()) => self.metrics.record_delivered(),
                Err(err) => {
                    self.metrics.record_delivery_failure();
                    self.handle_delivery_failure(message, err).await?;
                }
            }
        }

        if self.settings.commit_policy == CommitPolicy::Manual {
            self.commit(&batch).await?;
        }
        Ok(())
    }

    fn deliver(&self, payload: String) -> Result<(), DeliveryError> {
        let callback = self.consumer.current().ok_or(DeliveryError::NoConsumer)?;

        match panic::catch_unwind(AssertUnwindSafe(|| callback(vec![payload]))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(DeliveryError::Rejected {
                reason: format!("{err:#}"),
            }),
            Err(panic) => Err(DeliveryError::Panicked {
                reason: panic_message(panic.as_ref()),
            }),
        }
    }

    async fn handle_delivery_failure(
        &mut self,
        message: &SourceMessage,
        err: DeliveryError,
    ) -> Result<(), String> {
        match self.settings.failure_policy {
            DeliveryFailurePolicy::Stop => {
                error!(
                    error = %err,
                    partition = message.partition,
                    offset = message.offset,
                    "Delivery failed, stopping source"
                );
                Err(format!(
                    "delivery of {}/{}@{} failed: {err}",
                    message.topic, message.partition, message.offset
                ))
            }
            DeliveryFailurePolicy::Skip => {
                warn!(
                    error = %err,
                    partition = message.partition,
                    offset = message.offset,
                    "Delivery failed, skipping message"
                );
                Ok(())
            }
            DeliveryFailurePolicy::DeadLetter => {
                let Some(sink) = self.dead_letter.as_mut() else {
                    return Err("dead letter policy configured without a sink".to_string());
                };
                match sink.publish(message, &err).await {
                    Ok(()) => {
                        self.metrics.record_dead_lettered();
                        warn!(
                            error = %err,
                            partition = message.partition,
                            offset = message.offset,
                            "Delivery failed, message sent to dead letter topic"
                        );
                        Ok(())
                    }
                    Err(publish_err) => Err(format!(
                        "delivery of {}/{}@{} failed ({err}) and dead lettering failed: {publish_err}",
                        message.topic, message.partition, message.offset
                    )),
                }
            }
        }
    }

    async fn commit(&mut self, batch: &MessageBatch) -> Result<(), String> {
        let positions = batch.commit_positions();
        let mut failures = 0;

        loop {
            match self.client.commit_sync(&positions).await {
                Ok(()) => {
                    self.metrics.record_commit();
                    debug!("Committed {} partition positions", positions.len());
                    return Ok(());
                }
                Err(err) => {
                    self.metrics.record_commit_error();
                    if self.cancel.is_cancelled() {
                        return Err(format!("commit abandoned on shutdown: {err}"));
                    }
                    if !self.recover("Commit", &err, &mut failures).await {
                        return Err(format!("commit failed: {err}"));
                    }
                }
            }
        }
    }

    /// Waits out the retry delay when `err` may still succeed. Returns false
    /// once the error is unrecoverable or retries are exhausted.
    async fn recover(&mut self, action: &str, err: &SourceError, failures: &mut u32) -> bool {
        *failures += 1;
        if !err.is_retryable() || *failures > self.settings.max_retries {
            return false;
        }

        warn!(
            error = %err,
            attempt = *failures,
            max_retries = self.settings.max_retries,
            "{action} failed, retrying in {:?}",
            self.settings.retry_delay
        );
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(self.settings.retry_delay) => {}
        }
        true
    }

    fn fail(&self, reason: String) {
        error!(topic = %self.settings.topic, %reason, "Poll loop terminated");
        self.status.send_replace(ConnectorStatus::failed(reason));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

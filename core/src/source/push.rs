use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConnectorConfig, DeliveryFailurePolicy, SourceSettings};
use crate::connector::{
    ConnectorContext, ConnectorStatus, ConsumerSlot, DeliveryCallback, PushSource,
};
use crate::errors::ConnectorError;
use crate::source::poll_loop::PollLoop;
use crate::source::{DeadLetterSink, QueueClient, QueueClientFactory};
use crate::telemetry::{MetricsSnapshot, SourceMetrics};

struct RunningLoop {
    cancel: CancellationToken,
    handle: JoinHandle<Box<dyn QueueClient>>,
}

/// Push-style source that relays messages from a queue to a host callback.
///
/// All runtime state lives here: the validated settings from `open`, the
/// consumer slot, and the background loop spawned by `start`. The queue
/// client moves into the loop on `start` and comes back to be released
/// exactly once on `close`.
pub struct PushSourceConnector<F> {
    factory: F,
    settings: Option<SourceSettings>,
    consumer: ConsumerSlot<String>,
    running: Option<RunningLoop>,
    started: bool,
    last_failure: Option<ConnectorStatus>,
    metrics: Arc<SourceMetrics>,
    status: Arc<watch::Sender<ConnectorStatus>>,
}

impl<F: QueueClientFactory> PushSourceConnector<F> {
    pub fn new(factory: F) -> Self {
        let (status, _) = watch::channel(ConnectorStatus::Created);
        Self {
            factory,
            settings: None,
            consumer: ConsumerSlot::new(),
            running: None,
            started: false,
            last_failure: None,
            metrics: Arc::new(SourceMetrics::default()),
            status: Arc::new(status),
        }
    }

    pub fn settings(&self) -> Option<&SourceSettings> {
        self.settings.as_ref()
    }

    /// Receiver that observes every status transition, including a loop failure.
    pub fn watch_status(&self) -> watch::Receiver<ConnectorStatus> {
        self.status.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The `Failed` status the poll loop reported before `close`, if any.
    pub fn last_failure(&self) -> Option<&ConnectorStatus> {
        self.last_failure.as_ref()
    }

    async fn connect(
        &self,
        settings: &SourceSettings,
    ) -> Result<(Box<dyn QueueClient>, Option<Box<dyn DeadLetterSink>>), ConnectorError> {
        let mut client = self
            .factory
            .connect(settings)
            .map_err(ConnectorError::Connection)?;

        if let Err(err) = client.subscribe(&settings.topic).await {
            release_after_failed_start(client.as_mut()).await;
            return Err(ConnectorError::Connection(err));
        }

        let dead_letter = match (settings.failure_policy, settings.dead_letter_topic.as_deref()) {
            (DeliveryFailurePolicy::DeadLetter, Some(topic)) => {
                match self.factory.dead_letter_sink(settings, topic) {
                    Ok(sink) => Some(sink),
                    Err(err) => {
                        release_after_failed_start(client.as_mut()).await;
                        return Err(ConnectorError::Connection(err));
                    }
                }
            }
            _ => None,
        };

        Ok((client, dead_letter))
    }
}

async fn release_after_failed_start(client: &mut dyn QueueClient) {
    if let Err(err) = client.close().await {
        warn!(error = %err, "Failed to release connection after unsuccessful start");
    }
}

#[async_trait]
impl<F: QueueClientFactory> PushSource<String> for PushSourceConnector<F> {
    fn initialize(&mut self, ctx: &ConnectorContext) {
        debug!(
            instance = ?ctx.instance_name,
            metadata_keys = ctx.metadata.len(),
            "Connector initialized"
        );
    }

    fn open(&mut self, config: &ConnectorConfig) -> Result<(), ConnectorError> {
        if self.started {
            return Err(ConnectorError::AlreadyStarted);
        }

        let settings = SourceSettings::from_config(config)?;
        info!(
            topic = %settings.topic,
            group_id = %settings.group_id,
            commit_policy = ?settings.commit_policy,
            on_delivery_failure = %settings.failure_policy,
            "Source opened"
        );
        self.settings = Some(settings);
        self.status.send_replace(ConnectorStatus::Opened);
        Ok(())
    }

    fn set_consumer(&mut self, callback: DeliveryCallback<String>) {
        if self.started {
            info!("Replacing consumer of a running source");
        }
        self.consumer.set(callback);
    }

    async fn start(&mut self) -> Result<(), ConnectorError> {
        if self.started {
            return Err(ConnectorError::AlreadyStarted);
        }
        let settings = self.settings.clone().ok_or(ConnectorError::NotOpened)?;

        info!(topic = %settings.topic, "Starting source");
        let (client, dead_letter) = self.connect(&settings).await?;

        if !self.consumer.is_registered() {
            warn!("Starting source without a registered consumer");
        }

        let topic = settings.topic.clone();
        let cancel = CancellationToken::new();
        let poll_loop = PollLoop::new(
            client,
            dead_letter,
            self.consumer.clone(),
            settings,
            Arc::clone(&self.metrics),
            Arc::clone(&self.status),
            cancel.clone(),
        );

        self.status.send_replace(ConnectorStatus::Running);
        let handle = tokio::spawn(poll_loop.run());
        self.running = Some(RunningLoop { cancel, handle });
        self.started = true;

        info!(%topic, "Source started.");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectorError> {
        let Some(running) = self.running.take() else {
            debug!("Close requested but the source is not running");
            return Ok(());
        };

        info!("Stopping source");
        running.cancel.cancel();

        let released = match running.handle.await {
            Ok(mut client) => client.close().await.map_err(ConnectorError::Close),
            Err(err) => {
                // the client was dropped with the task
                error!(error = %err, "Poll loop task ended abnormally");
                Ok(())
            }
        };

        let previous = self.status.send_replace(ConnectorStatus::Stopped);
        if let ConnectorStatus::Failed { reason, failed_at } = &previous {
            warn!(%reason, %failed_at, "Source stopped after poll loop failure");
            self.last_failure = Some(previous);
        } else {
            info!("Source stopped.");
        }
        released
    }

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn status(&self) -> ConnectorStatus {
        self.status.borrow().clone()
    }
}

impl<F> Drop for PushSourceConnector<F> {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::config::ConnectorConfig;
use crate::errors::ConnectorError;

/// Function the host engine registers to receive records.
///
/// Each invocation carries a collection of decoded payloads. Returning an
/// error (or panicking) is reported to the connector as a delivery failure.
pub type DeliveryCallback<T> = Arc<dyn Fn(Vec<T>) -> anyhow::Result<()> + Send + Sync>;

/// Metadata the host may hand to a connector before it is opened.
#[derive(Debug, Clone, Default)]
pub struct ConnectorContext {
    pub instance_name: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorStatus {
    Created,
    Opened,
    Running,
    Failed {
        reason: String,
        failed_at: DateTime<Utc>,
    },
    Stopped,
}

impl ConnectorStatus {
    pub fn failed(reason: impl Into<String>) -> Self {
        ConnectorStatus::Failed {
            reason: reason.into(),
            failed_at: Utc::now(),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ConnectorStatus::Running)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectorStatus::Failed { .. })
    }
}

impl fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorStatus::Created => f.write_str("created"),
            ConnectorStatus::Opened => f.write_str("opened"),
            ConnectorStatus::Running => f.write_str("running"),
            ConnectorStatus::Failed { reason, failed_at } => {
                write!(f, "failed at {failed_at}: {reason}")
            }
            ConnectorStatus::Stopped => f.write_str("stopped"),
        }
    }
}

/// Shared slot for the delivery callback.
///
/// The poll loop reads the current callback before every record, so a
/// replacement registered while running applies from the next record.
pub struct ConsumerSlot<T> {
    inner: Arc<RwLock<Option<DeliveryCallback<T>>>>,
}

impl<T> ConsumerSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
        }
    }

    pub fn set(&self, callback: DeliveryCallback<T>) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(callback);
    }

    pub fn current(&self) -> Option<DeliveryCallback<T>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_registered(&self) -> bool {
        self.current().is_some()
    }
}

impl<T> Clone for ConsumerSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for ConsumerSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The lifecycle every push-style source exposes to the host engine.
///
/// Call order is `initialize` (optional), `open`, `set_consumer`, `start`,
/// and finally `close`.
#[async_trait]
pub trait PushSource<T>: Send {
    /// Hook for host-provided metadata. Called before `open`.
    fn initialize(&mut self, ctx: &ConnectorContext);

    /// Validates and stores the configuration. Must not perform any I/O.
    fn open(&mut self, config: &ConnectorConfig) -> Result<(), ConnectorError>;

    fn set_consumer(&mut self, callback: DeliveryCallback<T>);

    /// Connects to the source and launches the background loop. Returns once
    /// the loop has been spawned.
    async fn start(&mut self) -> Result<(), ConnectorError>;

    /// Stops the background loop and releases the connection.
    /// Safe to call before `start` and more than once.
    async fn close(&mut self) -> Result<(), ConnectorError>;

    fn version(&self) -> &'static str;

    fn status(&self) -> ConnectorStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_slot_swaps_callback() {
        let slot: ConsumerSlot<String> = ConsumerSlot::new();
        assert!(!slot.is_registered());

        let reader = slot.clone();
        slot.set(Arc::new(|_: Vec<String>| -> anyhow::Result<()> { Ok(()) }));
        assert!(reader.is_registered());

        slot.set(Arc::new(|_: Vec<String>| -> anyhow::Result<()> {
            anyhow::bail!("second")
        }));
        let callback = reader.current().unwrap();
        assert!(callback(vec!["x".to_string()]).is_err());
    }

    #[test]
    fn test_failed_status_display_includes_reason() {
        let status = ConnectorStatus::failed("poll failed");
        assert!(status.is_failed());
        assert!(!status.is_running());
        assert!(status.to_string().ends_with("poll failed"));
    }
}

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

use connect_core::config::load_config;
use connect_core::connector::{ConnectorContext, PushSource};
use connect_core::source::kafka::KafkaSource;
use connect_core::telemetry::init_tracing;

/// Entry point for running a Kafka source on container hosting services
/// like AWS EKS, ECS, etc.
///
/// What it does at a high-level:
///     Load config from the file given as first argument, or from `CONNECTOR_CONFIG`.
///     Open and start the source with a consumer that logs every record.
///     Run until Ctrl-C or until the poll loop fails, then close the source.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref()).context("Failed to load connector config")?;

    let mut source = KafkaSource::kafka();
    source.initialize(&ConnectorContext {
        instance_name: Some("runner-container".to_string()),
        metadata: HashMap::new(),
    });
    source.open(&config).context("Invalid connector config")?;
    source.set_consumer(Arc::new(|records: Vec<String>| -> anyhow::Result<()> {
        for record in records {
            info!(%record, "Record received");
        }
        Ok(())
    }));

    info!(version = source.version(), "Starting Kafka source");
    source.start().await.context("Failed to start Kafka source")?;

    let mut status = source.watch_status();
    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
            Ok(())
        }
        failed = status.wait_for(|status| status.is_failed()) => {
            let reason = failed
                .map(|status| status.to_string())
                .unwrap_or_else(|_| "status channel closed".to_string());
            error!(%reason, "Kafka source stopped unexpectedly");
            Err(anyhow::anyhow!("Kafka source failed: {reason}"))
        }
    };

    source.close().await.context("Failed to close Kafka source")?;
    info!(
        metrics = %serde_json::to_string(&source.metrics())?,
        "Kafka source closed"
    );
    outcome
}

pub mod config;
pub mod connector;
pub mod errors;
pub mod source;
pub mod telemetry;

pub use config::{CommitPolicy, ConnectorConfig, DeliveryFailurePolicy, SourceSettings};
pub use connector::{ConnectorContext, ConnectorStatus, DeliveryCallback, PushSource};
pub use errors::{ConfigError, ConnectorError, DeliveryError, SourceError};
pub use source::kafka::KafkaSource;
pub use source::push::PushSourceConnector;

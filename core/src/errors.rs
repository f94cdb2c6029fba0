use thiserror::Error;

/// Errors surfaced synchronously by the connector lifecycle methods.
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to establish source connection: {0}")]
    Connection(#[source] SourceError),

    #[error("Failed to release source connection: {0}")]
    Close(#[source] SourceError),

    #[error("Connector must be opened before it is started")]
    NotOpened,

    #[error("Connector has already been started")]
    AlreadyStarted,
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to connect or communicate with the source: {source}")]
    Connection {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("A transient error occurred, the operation can be retried: {source}")]
    Transient {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Unrecoverable error from the source: {0}")]
    Unrecoverable(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Field {field} must be {expected}, found {found}")]
    InvalidType {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Failed to load configuration from {origin}: {error}")]
    LoadFailed {
        origin: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Error, Debug)]
pub enum KafkaError {
    #[error("Failed to create consumer: {reason}")]
    ConsumerCreation { reason: String },

    #[error("Failed to subscribe to topic {topic}: {reason}")]
    Subscription { topic: String, reason: String },

    #[error("Failed to consume messages: {reason}")]
    Consumption { reason: String },

    #[error("Failed to commit offsets: {reason}")]
    OffsetCommit { reason: String },

    #[error("Failed to publish to dead letter topic {topic}: {reason}")]
    DeadLetter { topic: String, reason: String },
}

/// A failure raised while handing a record to the host callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Consumer rejected the record: {reason}")]
    Rejected { reason: String },

    #[error("Consumer panicked while processing the record: {reason}")]
    Panicked { reason: String },

    #[error("No consumer is registered")]
    NoConsumer,
}

pub type Result<T> = std::result::Result<T, ConnectorError>;

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::LoadFailed {
            origin: "yaml".to_string(),
            error: Box::new(err),
        }
    }
}

impl SourceError {
    pub fn connection(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        SourceError::Connection {
            source: Box::new(err),
        }
    }

    pub fn transient(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        SourceError::Transient {
            source: Box::new(err),
        }
    }

    pub fn unrecoverable(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        SourceError::Unrecoverable(Box::new(err))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Connection { .. } => true,
            SourceError::Transient { .. } => true,
            SourceError::Unrecoverable(_) => false,
        }
    }
}

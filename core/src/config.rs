use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::ConfigError;

/// Bounded wait for a single poll of the source.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Environment variable holding a YAML connector config.
pub const CONFIG_ENV_VAR: &str = "CONNECTOR_CONFIG";

pub mod keys {
    pub const TOPIC: &str = "source.topic";
    pub const BOOTSTRAP_SERVERS: &str = "source.bootstrap_servers";
    pub const GROUP_ID: &str = "source.group_id";
    pub const FETCH_MIN_BYTES: &str = "source.fetch_min_bytes";
    pub const AUTO_COMMIT_INTERVAL_MS: &str = "source.auto_commit_interval_ms";
    pub const SESSION_TIMEOUT_MS: &str = "source.session_timeout_ms";
    pub const AUTO_COMMIT_ENABLED: &str = "source.auto_commit_enabled";

    pub const AUTO_OFFSET_RESET: &str = "source.auto_offset_reset";
    pub const HEARTBEAT_INTERVAL_MS: &str = "source.heartbeat_interval_ms";
    pub const MAX_POLL_RECORDS: &str = "source.max_poll_records";
    pub const SECURITY_PROTOCOL: &str = "source.security_protocol";
    pub const SASL_MECHANISMS: &str = "source.sasl_mechanisms";
    pub const SASL_USERNAME: &str = "source.sasl_username";
    pub const SASL_PASSWORD: &str = "source.sasl_password";
    pub const SSL_CA_LOCATION: &str = "source.ssl_ca_location";
    pub const MAX_RETRIES: &str = "source.max_retries";
    pub const RETRY_DELAY_MS: &str = "source.retry_delay_ms";
    pub const ON_DELIVERY_FAILURE: &str = "source.on_delivery_failure";
    pub const DEAD_LETTER_TOPIC: &str = "source.dead_letter_topic";

    /// Keys that must be present before the connector can be opened, in check order.
    pub const REQUIRED: [&str; 7] = [
        TOPIC,
        BOOTSTRAP_SERVERS,
        GROUP_ID,
        FETCH_MIN_BYTES,
        AUTO_COMMIT_INTERVAL_MS,
        SESSION_TIMEOUT_MS,
        AUTO_COMMIT_ENABLED,
    ];
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl ConfigValue {
    fn type_name(&self) -> &'static str {
        match self {
            ConfigValue::Bool(_) => "a boolean",
            ConfigValue::Int(_) => "an integer",
            ConfigValue::String(_) => "a string",
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::String(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::String(value)
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Int(value)
    }
}

impl From<i32> for ConfigValue {
    fn from(value: i32) -> Self {
        ConfigValue::Int(i64::from(value))
    }
}

/// String-keyed connector configuration with typed values.
///
/// Lookups never coerce between types: an integer stored as a string is a
/// type error, not a parse attempt.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ConnectorConfig {
    values: HashMap<String, ConfigValue>,
}

impl ConnectorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<ConfigValue> {
        self.values.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_string(&self, key: &str) -> Result<&str, ConfigError> {
        self.get_optional_string(key)?
            .ok_or_else(|| missing(key))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, ConfigError> {
        match self.require(key)? {
            ConfigValue::Bool(b) => Ok(*b),
            other => Err(invalid_type(key, "a boolean", other)),
        }
    }

    pub fn get_int(&self, key: &str) -> Result<i64, ConfigError> {
        self.get_optional_int(key)?.ok_or_else(|| missing(key))
    }

    pub fn get_optional_string(&self, key: &str) -> Result<Option<&str>, ConfigError> {
        match self.values.get(key) {
            None => Ok(None),
            Some(ConfigValue::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(invalid_type(key, "a string", other)),
        }
    }

    pub fn get_optional_int(&self, key: &str) -> Result<Option<i64>, ConfigError> {
        match self.values.get(key) {
            None => Ok(None),
            Some(ConfigValue::Int(i)) => Ok(Some(*i)),
            Some(other) => Err(invalid_type(key, "an integer", other)),
        }
    }

    fn require(&self, key: &str) -> Result<&ConfigValue, ConfigError> {
        self.values.get(key).ok_or_else(|| missing(key))
    }

    /// Fails with the first required key that is absent.
    pub fn verify_required(&self) -> Result<(), ConfigError> {
        match keys::REQUIRED.iter().find(|key| !self.contains(key)) {
            Some(key) => Err(missing(key)),
            None => Ok(()),
        }
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            origin: path.to_string(),
            error: Box::new(e),
        })?;
        let config: ConnectorConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let config_str = std::env::var(CONFIG_ENV_VAR).map_err(|e| ConfigError::LoadFailed {
            origin: CONFIG_ENV_VAR.to_string(),
            error: Box::new(e),
        })?;
        let config: ConnectorConfig = serde_yaml::from_str(&config_str)?;
        Ok(config)
    }
}

pub fn load_config(config_path: Option<&str>) -> Result<ConnectorConfig, ConfigError> {
    match config_path {
        Some(path) => ConnectorConfig::from_file(path),
        None => ConnectorConfig::from_env(),
    }
}

fn missing(key: &str) -> ConfigError {
    ConfigError::MissingField {
        field: key.to_string(),
    }
}

fn invalid_type(key: &str, expected: &'static str, found: &ConfigValue) -> ConfigError {
    ConfigError::InvalidType {
        field: key.to_string(),
        expected,
        found: found.type_name(),
    }
}

fn invalid_value(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: key.to_string(),
        reason: reason.into(),
    }
}

fn non_empty_string(config: &ConnectorConfig, key: &str) -> Result<String, ConfigError> {
    let value = config.get_string(key)?;
    if value.trim().is_empty() {
        return Err(invalid_value(key, "must not be empty"));
    }
    Ok(value.to_string())
}

fn positive_u32(key: &str, value: i64) -> Result<u32, ConfigError> {
    if value <= 0 {
        return Err(invalid_value(key, format!("must be positive, got {value}")));
    }
    u32::try_from(value).map_err(|_| invalid_value(key, format!("{value} is out of range")))
}

fn optional_string(config: &ConnectorConfig, key: &str) -> Result<Option<String>, ConfigError> {
    Ok(config.get_optional_string(key)?.map(str::to_string))
}

/// How progress is persisted on the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPolicy {
    /// The client persists positions on its own interval.
    Auto,
    /// The connector commits synchronously after every delivered batch.
    Manual,
}

impl CommitPolicy {
    pub fn from_auto_commit(enabled: bool) -> Self {
        if enabled {
            CommitPolicy::Auto
        } else {
            CommitPolicy::Manual
        }
    }
}

/// What the poll loop does when the consumer fails on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryFailurePolicy {
    /// Stop the loop and leave the batch uncommitted.
    #[default]
    Stop,
    /// Log the failure and carry on with the next record.
    Skip,
    /// Publish the record to the dead letter topic and carry on.
    DeadLetter,
}

impl FromStr for DeliveryFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop" => Ok(DeliveryFailurePolicy::Stop),
            "skip" => Ok(DeliveryFailurePolicy::Skip),
            "dead_letter" => Ok(DeliveryFailurePolicy::DeadLetter),
            other => Err(format!(
                "unknown policy '{other}', expected one of stop, skip, dead_letter"
            )),
        }
    }
}

impl fmt::Display for DeliveryFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeliveryFailurePolicy::Stop => "stop",
            DeliveryFailurePolicy::Skip => "skip",
            DeliveryFailurePolicy::DeadLetter => "dead_letter",
        };
        f.write_str(name)
    }
}

/// Validated connection and runtime parameters derived from a [`ConnectorConfig`].
#[derive(Clone, PartialEq)]
pub struct SourceSettings {
    pub topic: String,
    pub bootstrap_servers: String,
    pub group_id: String,
    pub fetch_min_bytes: u32,
    pub auto_commit_interval_ms: u32,
    pub session_timeout_ms: u32,
    pub commit_policy: CommitPolicy,
    pub auto_offset_reset: String,
    pub heartbeat_interval_ms: Option<u32>,
    pub max_poll_records: usize,
    pub security_protocol: Option<String>,
    pub sasl_mechanisms: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub poll_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub failure_policy: DeliveryFailurePolicy,
    pub dead_letter_topic: Option<String>,
}

impl SourceSettings {
    pub fn from_config(config: &ConnectorConfig) -> Result<Self, ConfigError> {
        config.verify_required()?;

        let topic = non_empty_string(config, keys::TOPIC)?;
        let bootstrap_servers = non_empty_string(config, keys::BOOTSTRAP_SERVERS)?;
        let group_id = non_empty_string(config, keys::GROUP_ID)?;
        let fetch_min_bytes =
            positive_u32(keys::FETCH_MIN_BYTES, config.get_int(keys::FETCH_MIN_BYTES)?)?;
        let auto_commit_interval_ms = positive_u32(
            keys::AUTO_COMMIT_INTERVAL_MS,
            config.get_int(keys::AUTO_COMMIT_INTERVAL_MS)?,
        )?;
        let session_timeout_ms = positive_u32(
            keys::SESSION_TIMEOUT_MS,
            config.get_int(keys::SESSION_TIMEOUT_MS)?,
        )?;
        let commit_policy =
            CommitPolicy::from_auto_commit(config.get_bool(keys::AUTO_COMMIT_ENABLED)?);

        let auto_offset_reset = match config.get_optional_string(keys::AUTO_OFFSET_RESET)? {
            Some(reset @ ("earliest" | "latest" | "error")) => reset.to_string(),
            Some(other) => {
                return Err(invalid_value(
                    keys::AUTO_OFFSET_RESET,
                    format!("'{other}' is not one of earliest, latest, error"),
                ));
            }
            None => "earliest".to_string(),
        };

        let heartbeat_interval_ms = config
            .get_optional_int(keys::HEARTBEAT_INTERVAL_MS)?
            .map(|v| positive_u32(keys::HEARTBEAT_INTERVAL_MS, v))
            .transpose()?;

        let max_poll_records = config
            .get_optional_int(keys::MAX_POLL_RECORDS)?
            .map(|v| positive_u32(keys::MAX_POLL_RECORDS, v))
            .transpose()?
            .unwrap_or(500) as usize;

        let max_retries = match config.get_optional_int(keys::MAX_RETRIES)? {
            Some(v) if v < 0 => {
                return Err(invalid_value(keys::MAX_RETRIES, "must not be negative"));
            }
            Some(v) => u32::try_from(v)
                .map_err(|_| invalid_value(keys::MAX_RETRIES, format!("{v} is out of range")))?,
            None => 3,
        };

        let retry_delay_ms = config
            .get_optional_int(keys::RETRY_DELAY_MS)?
            .map(|v| positive_u32(keys::RETRY_DELAY_MS, v))
            .transpose()?
            .unwrap_or(1000);

        let failure_policy = match config.get_optional_string(keys::ON_DELIVERY_FAILURE)? {
            Some(name) => name
                .parse::<DeliveryFailurePolicy>()
                .map_err(|reason| invalid_value(keys::ON_DELIVERY_FAILURE, reason))?,
            None => DeliveryFailurePolicy::default(),
        };

        let dead_letter_topic = optional_string(config, keys::DEAD_LETTER_TOPIC)?;
        if failure_policy == DeliveryFailurePolicy::DeadLetter && dead_letter_topic.is_none() {
            return Err(missing(keys::DEAD_LETTER_TOPIC));
        }

        Ok(Self {
            topic,
            bootstrap_servers,
            group_id,
            fetch_min_bytes,
            auto_commit_interval_ms,
            session_timeout_ms,
            commit_policy,
            auto_offset_reset,
            heartbeat_interval_ms,
            max_poll_records,
            security_protocol: optional_string(config, keys::SECURITY_PROTOCOL)?,
            sasl_mechanisms: optional_string(config, keys::SASL_MECHANISMS)?,
            sasl_username: optional_string(config, keys::SASL_USERNAME)?,
            sasl_password: optional_string(config, keys::SASL_PASSWORD)?,
            ssl_ca_location: optional_string(config, keys::SSL_CA_LOCATION)?,
            poll_timeout: POLL_TIMEOUT,
            max_retries,
            retry_delay: Duration::from_millis(u64::from(retry_delay_ms)),
            failure_policy,
            dead_letter_topic,
        })
    }
}

impl fmt::Debug for SourceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceSettings")
            .field("topic", &self.topic)
            .field("bootstrap_servers", &self.bootstrap_servers)
            .field("group_id", &self.group_id)
            .field("fetch_min_bytes", &self.fetch_min_bytes)
            .field("auto_commit_interval_ms", &self.auto_commit_interval_ms)
            .field("session_timeout_ms", &self.session_timeout_ms)
            .field("commit_policy", &self.commit_policy)
            .field("auto_offset_reset", &self.auto_offset_reset)
            .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
            .field("max_poll_records", &self.max_poll_records)
            .field("security_protocol", &self.security_protocol)
            .field("sasl_mechanisms", &self.sasl_mechanisms)
            .field("sasl_username", &self.sasl_username)
            .field("sasl_password", &self.sasl_password.as_ref().map(|_| "<redacted>"))
            .field("ssl_ca_location", &self.ssl_ca_location)
            .field("poll_timeout", &self.poll_timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("failure_policy", &self.failure_policy)
            .field("dead_letter_topic", &self.dead_letter_topic)
            .finish()
    }
}

//! Configuration for the data sink
//!
//! Settings are resolved once at startup from the process environment (after
//! loading an optional `.env` file) and passed read-only to every component.
use serde::Deserialize;
use std::time::Duration;

use crate::error::{Result, SinkError};
use crate::transform::DocumentIdStrategy;

pub const KAFKA_BROKER_URL: &str = "KAFKA_BROKER_URL";
pub const KAFKA_GROUP_ID: &str = "KAFKA_GROUP_ID";
pub const KAFKA_TOPIC: &str = "KAFKA_TOPIC";
pub const MONGODB_URL: &str = "MONGODB_URL";

const DEFAULT_DATABASE: &str = "data_sink";

/// Connection settings, loaded from environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Kafka bootstrap servers
    #[serde(default = "default_kafka_broker_url")]
    pub kafka_broker_url: String,

    /// Consumer group id
    #[serde(default = "default_kafka_group_id")]
    pub kafka_group_id: String,

    /// Topic to forward
    #[serde(default = "default_kafka_topic")]
    pub kafka_topic: String,

    /// MongoDB connection string
    #[serde(default = "default_mongodb_url")]
    pub mongodb_url: String,

    /// Target database (falls back to the URL's default database)
    #[serde(default)]
    pub mongodb_database: Option<String>,

    /// Target collection (falls back to the topic name)
    #[serde(default)]
    pub mongodb_collection: Option<String>,

    /// Kafka topic for dead letters; log-only when unset
    #[serde(default)]
    pub dead_letter_topic: Option<String>,

    #[serde(default)]
    pub document_id_strategy: DocumentIdStrategy,

    /// Write to an in-memory sink instead of MongoDB
    #[serde(default)]
    pub sink_dry_run: bool,

    /// `FORWARDER_*` tuning keys
    #[serde(skip)]
    pub forwarder: ForwarderSettings,
}

/// What to do with a batch whose write retries are exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteFailurePolicy {
    /// Dead-letter the batch range and commit past it
    #[default]
    DeadLetter,
    /// Keep the batch, back off, and write it again
    Pause,
}

/// Forwarder loop tuning, read from keys prefixed with `FORWARDER_`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ForwarderSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Retries after the first write attempt
    #[serde(default = "default_max_write_retries")]
    pub max_write_retries: u32,

    #[serde(default = "default_retry_initial_backoff_ms")]
    pub retry_initial_backoff_ms: u64,

    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,

    #[serde(default = "default_error_backoff_initial_ms")]
    pub error_backoff_initial_ms: u64,

    #[serde(default = "default_error_backoff_max_ms")]
    pub error_backoff_max_ms: u64,

    #[serde(default)]
    pub write_failure_policy: WriteFailurePolicy,

    /// Concurrent upserts per batch
    #[serde(default = "default_write_concurrency")]
    pub write_concurrency: usize,

    /// Forwarder loops per process
    #[serde(default = "default_instances")]
    pub instances: usize,
}

impl Default for ForwarderSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            max_write_retries: default_max_write_retries(),
            retry_initial_backoff_ms: default_retry_initial_backoff_ms(),
            retry_max_backoff_ms: default_retry_max_backoff_ms(),
            error_backoff_initial_ms: default_error_backoff_initial_ms(),
            error_backoff_max_ms: default_error_backoff_max_ms(),
            write_failure_policy: WriteFailurePolicy::default(),
            write_concurrency: default_write_concurrency(),
            instances: default_instances(),
        }
    }
}

fn default_kafka_broker_url() -> String {
    "localhost:9092".to_string()
}

fn default_kafka_group_id() -> String {
    "default-group".to_string()
}

fn default_kafka_topic() -> String {
    "default-topic".to_string()
}

fn default_mongodb_url() -> String {
    "mongodb://localhost:27017/".to_string()
}

fn default_batch_size() -> usize {
    500
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

fn default_max_write_retries() -> u32 {
    5
}

fn default_retry_initial_backoff_ms() -> u64 {
    200
}

fn default_retry_max_backoff_ms() -> u64 {
    10_000
}

fn default_error_backoff_initial_ms() -> u64 {
    1000
}

fn default_error_backoff_max_ms() -> u64 {
    60_000 // 1 minute
}

fn default_write_concurrency() -> usize {
    16
}

fn default_instances() -> usize {
    1
}

impl Settings {
    /// Load settings from the process environment, reading `.env` first if present
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::resolve(std::env::vars())
    }

    /// Resolve settings from an explicit key/value mapping
    pub fn resolve<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        // Blank values count as unset
        let vars: Vec<(String, String)> = vars
            .into_iter()
            .filter(|(_, value)| !value.trim().is_empty())
            .collect();

        let mut settings: Settings = envy::from_iter(vars.clone())?;
        settings.forwarder = envy::prefixed("FORWARDER_").from_iter(vars)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        let forwarder = &self.forwarder;

        if forwarder.batch_size == 0 {
            return Err(SinkError::Config(
                "FORWARDER_BATCH_SIZE must be at least 1".to_string(),
            ));
        }
        if forwarder.write_concurrency == 0 {
            return Err(SinkError::Config(
                "FORWARDER_WRITE_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if forwarder.instances == 0 {
            return Err(SinkError::Config(
                "FORWARDER_INSTANCES must be at least 1".to_string(),
            ));
        }
        if forwarder.write_timeout_ms == 0 {
            return Err(SinkError::Config(
                "FORWARDER_WRITE_TIMEOUT_MS must be at least 1".to_string(),
            ));
        }
        if forwarder.retry_initial_backoff_ms > forwarder.retry_max_backoff_ms {
            return Err(SinkError::Config(format!(
                "FORWARDER_RETRY_INITIAL_BACKOFF_MS ({}) exceeds FORWARDER_RETRY_MAX_BACKOFF_MS ({})",
                forwarder.retry_initial_backoff_ms, forwarder.retry_max_backoff_ms
            )));
        }
        if forwarder.error_backoff_initial_ms > forwarder.error_backoff_max_ms {
            return Err(SinkError::Config(format!(
                "FORWARDER_ERROR_BACKOFF_INITIAL_MS ({}) exceeds FORWARDER_ERROR_BACKOFF_MAX_MS ({})",
                forwarder.error_backoff_initial_ms, forwarder.error_backoff_max_ms
            )));
        }
        if self.kafka_topic.trim().is_empty() {
            return Err(SinkError::Config("KAFKA_TOPIC must not be empty".to_string()));
        }

        Ok(())
    }

    /// Look up one of the connection keys, falling back to `default` for unknown keys
    pub fn get(&self, key: &str, default: Option<&str>) -> Option<String> {
        match key {
            KAFKA_BROKER_URL => Some(self.kafka_broker_url.clone()),
            KAFKA_GROUP_ID => Some(self.kafka_group_id.clone()),
            KAFKA_TOPIC => Some(self.kafka_topic.clone()),
            MONGODB_URL => Some(self.mongodb_url.clone()),
            _ => default.map(str::to_string),
        }
    }

    /// Like [`get`](Self::get) without a default: unknown keys are an error
    pub fn require(&self, key: &str) -> Result<String> {
        self.get(key, None)
            .ok_or_else(|| SinkError::Config(format!("Unknown setting: {}", key)))
    }

    /// Database name: explicit setting, else the URL's default database, else `data_sink`
    pub fn database_name(&self, url_default: Option<&str>) -> String {
        self.mongodb_database
            .as_deref()
            .or(url_default)
            .unwrap_or(DEFAULT_DATABASE)
            .to_string()
    }

    pub fn collection_name(&self) -> &str {
        self.mongodb_collection
            .as_deref()
            .unwrap_or(&self.kafka_topic)
    }
}

impl ForwarderSettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Retry schedule for a failing batch write
    pub fn write_retry(&self) -> resilience::RetryConfig {
        let mut config = resilience::presets::document_write();
        config.max_retries = self.max_write_retries;
        config.backoff.initial = Duration::from_millis(self.retry_initial_backoff_ms);
        config.backoff.max = Duration::from_millis(self.retry_max_backoff_ms);
        config
    }

    /// Wait schedule for the error-backoff state
    pub fn error_backoff(&self) -> resilience::BackoffConfig {
        let mut config = resilience::presets::stream_error_backoff();
        config.initial = Duration::from_millis(self.error_backoff_initial_ms);
        config.max = Duration::from_millis(self.error_backoff_max_ms);
        config
    }
}

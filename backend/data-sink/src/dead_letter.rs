//! Dead Letter Queue (DLQ)
//!
//! Records the forwarder gives up on are reported here: poison records the
//! transform stage rejected, and batch ranges whose write retries ran out.
//! The forwarder always raises an error-level event itself; a sink only
//! decides where the envelope goes next.
use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use resilience::{with_retry, RetryConfig};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error};

use crate::error::{Result, SinkError};
use crate::model::DeadLetter;

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, letter: &DeadLetter) -> Result<()>;
}

/// Used when no DLQ topic is configured; the forwarder's log line is the only record
#[derive(Debug, Default)]
pub struct LogOnlyDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LogOnlyDeadLetterSink {
    async fn send(&self, letter: &DeadLetter) -> Result<()> {
        debug!(key = %letter.key(), "No dead-letter topic configured, letter logged only");
        Ok(())
    }
}

/// DLQ producer configuration
#[derive(Debug, Clone)]
pub struct KafkaDeadLetterConfig {
    pub brokers: String,
    pub topic: String,
    /// Delivery timeout per send (milliseconds)
    pub timeout_ms: u64,
    pub retry: RetryConfig,
}

impl KafkaDeadLetterConfig {
    pub fn new(brokers: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            topic: topic.into(),
            timeout_ms: 5000,
            retry: resilience::presets::dead_letter_publish(),
        }
    }
}

/// Publishes JSON envelopes to a Kafka topic
pub struct KafkaDeadLetterSink {
    config: KafkaDeadLetterConfig,
    producer: FutureProducer,
}

impl KafkaDeadLetterSink {
    pub fn new(config: KafkaDeadLetterConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.timeout_ms.to_string())
            .set("queue.buffering.max.messages", "10000")
            .set("batch.num.messages", "1000")
            .create()
            .map_err(|e| SinkError::Config(format!("Failed to create DLQ producer: {}", e)))?;

        Ok(Self { config, producer })
    }

    async fn publish(&self, key: &str, payload: &str) -> Result<()> {
        let record = FutureRecord::to(&self.config.topic)
            .key(key)
            .payload(payload);

        match self
            .producer
            .send(record, Duration::from_millis(self.config.timeout_ms))
            .await
        {
            Ok((partition, offset)) => {
                debug!(
                    topic = %self.config.topic,
                    partition = partition,
                    offset = offset,
                    key = %key,
                    "Dead letter published"
                );
                Ok(())
            }
            Err((e, _)) => Err(SinkError::DeadLetter(e.to_string())),
        }
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn send(&self, letter: &DeadLetter) -> Result<()> {
        let payload = serde_json::to_string(letter)
            .map_err(|e| SinkError::DeadLetter(format!("Failed to serialize dead letter: {}", e)))?;
        let key = letter.key();

        with_retry(&self.config.retry, || self.publish(&key, &payload))
            .await
            .map_err(|e| {
                error!(
                    topic = %self.config.topic,
                    key = %key,
                    error = %e,
                    "Failed to publish dead letter (Kafka error)"
                );
                e.into_inner()
            })
    }
}

/// Collects letters in memory, for tests
#[derive(Debug, Default)]
pub struct MemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn send(&self, letter: &DeadLetter) -> Result<()> {
        self.letters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(letter.clone());
        Ok(())
    }
}

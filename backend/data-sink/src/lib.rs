//! Data Sink - forwards a Kafka topic into MongoDB
//!
//! This crate provides:
//! - Settings resolved once from the environment (`.env` supported)
//! - A Kafka record source with manual, after-write offset commits
//! - A pure record → document transform with deterministic ids
//! - Idempotent MongoDB upserts (and an in-memory sink for dry runs)
//! - A dead-letter queue for poison records and exhausted batches
//! - The forwarder loop tying them together with retry and backoff

pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod error;
pub mod forwarder;
pub mod model;
pub mod sink;
pub mod transform;

pub use checkpoint::{MemoryOffsetStore, OffsetCommitter, OffsetStore};
pub use config::{ForwarderSettings, Settings, WriteFailurePolicy};
pub use consumer::{KafkaOffsetStore, KafkaRecordSource, RecordSource};
pub use dead_letter::{
    DeadLetterSink, KafkaDeadLetterConfig, KafkaDeadLetterSink, LogOnlyDeadLetterSink,
    MemoryDeadLetterSink,
};
pub use error::{Result, SinkError, TransformError};
pub use forwarder::{Forwarder, ForwarderConfig, ForwarderState};
pub use model::{Batch, DeadLetter, DeadLetterReason, Document, ForwarderStats, Record};
pub use sink::{DocumentSink, FailedDocument, MemorySink, MongoSink, WriteResult};
pub use transform::{transform, DocumentIdStrategy};

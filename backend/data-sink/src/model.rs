//! Records, documents and the bookkeeping types that flow through the forwarder
use base64::Engine;
use chrono::{DateTime, Utc};
use mongodb::bson;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::TransformError;

/// Largest document the MongoDB server accepts
pub const MAX_BSON_DOCUMENT_BYTES: usize = 16 * 1024 * 1024;

/// Immutable unit read from the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    /// `None` for tombstones
    pub value: Option<Vec<u8>>,
    /// Milliseconds since epoch
    pub timestamp: Option<i64>,
}

impl Record {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            value: None,
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = Some(timestamp_ms);
        self
    }
}

/// Where a stored document came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMeta {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Storage-bound representation of a record
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub payload: Map<String, Value>,
    pub source: SourceMeta,
}

impl Document {
    /// Full stored form: payload fields plus `_id` and `_source`
    pub fn to_json(&self) -> Value {
        let mut body = self.payload.clone();
        body.insert("_id".to_string(), Value::String(self.id.clone()));
        body.insert(
            "_source".to_string(),
            serde_json::to_value(&self.source).unwrap_or(Value::Null),
        );
        Value::Object(body)
    }

    /// BSON form of [`to_json`](Self::to_json), rejected when the server could not store it
    pub fn to_bson(&self) -> std::result::Result<bson::Document, String> {
        let stored = bson::to_document(&self.to_json())
            .map_err(|e| format!("BSON conversion failed: {}", e))?;

        let mut encoded = Vec::new();
        stored
            .to_writer(&mut encoded)
            .map_err(|e| format!("BSON encoding failed: {}", e))?;
        if encoded.len() > MAX_BSON_DOCUMENT_BYTES {
            return Err(format!(
                "document is {} bytes, limit is {}",
                encoded.len(),
                MAX_BSON_DOCUMENT_BYTES
            ));
        }

        Ok(stored)
    }
}

/// Records sharing one commit boundary, with what became of each
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub records: Vec<Record>,
    pub documents: Vec<Document>,
    pub rejected: Vec<TransformError>,
    /// Positions of documents dropped in favour of a later one with the same id
    pub superseded: Vec<SourceMeta>,
}

impl Batch {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            documents: Vec::new(),
            rejected: Vec::new(),
            superseded: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// First and last offset seen per partition
    pub fn offset_ranges(&self) -> BTreeMap<i32, (i64, i64)> {
        let mut ranges: BTreeMap<i32, (i64, i64)> = BTreeMap::new();
        for record in &self.records {
            ranges
                .entry(record.partition)
                .and_modify(|(first, last)| {
                    *first = (*first).min(record.offset);
                    *last = (*last).max(record.offset);
                })
                .or_insert((record.offset, record.offset));
        }
        ranges
    }

    /// Highest offset per partition; everything at or below it is handled once the batch is
    pub fn highest_offsets(&self) -> BTreeMap<i32, i64> {
        self.offset_ranges()
            .into_iter()
            .map(|(partition, (_, last))| (partition, last))
            .collect()
    }

    /// Keep one document per id, the one from the later record.
    ///
    /// Upserts of one batch run concurrently, so two documents sharing an id
    /// would race. Returns how many documents were dropped.
    pub fn collapse_duplicate_ids(&mut self) -> usize {
        let mut kept: Vec<Document> = Vec::with_capacity(self.documents.len());
        let mut index: BTreeMap<String, usize> = BTreeMap::new();

        for document in std::mem::take(&mut self.documents) {
            match index.get(&document.id) {
                None => {
                    index.insert(document.id.clone(), kept.len());
                    kept.push(document);
                }
                Some(&at) => {
                    let current = &kept[at].source;
                    let older = current.partition == document.source.partition
                        && current.offset > document.source.offset;
                    if older {
                        self.superseded.push(document.source);
                    } else {
                        let replaced = std::mem::replace(&mut kept[at], document);
                        self.superseded.push(replaced.source);
                    }
                }
            }
        }

        self.documents = kept;
        self.superseded.len()
    }

    pub fn topic(&self) -> Option<&str> {
        self.records.first().map(|r| r.topic.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    TransformFailed,
    WriteRetriesExhausted,
}

/// Envelope describing records that could not be persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub reason: DeadLetterReason,
    pub topic: String,
    pub partition: i32,
    pub first_offset: i64,
    pub last_offset: i64,
    pub error: String,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
    /// Raw record value, base64 encoded, for single-record letters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_base64: Option<String>,
}

impl DeadLetter {
    /// Letter for a record the transform stage rejected
    pub fn poison(record: &Record, error: &TransformError) -> Self {
        Self {
            reason: DeadLetterReason::TransformFailed,
            topic: record.topic.clone(),
            partition: record.partition,
            first_offset: record.offset,
            last_offset: record.offset,
            error: error.to_string(),
            attempts: 1,
            timestamp: Utc::now(),
            payload_base64: record
                .value
                .as_ref()
                .map(|v| base64::engine::general_purpose::STANDARD.encode(v)),
        }
    }

    /// Letter for a partition range whose write never succeeded
    pub fn exhausted_range(
        topic: impl Into<String>,
        partition: i32,
        (first_offset, last_offset): (i64, i64),
        error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            reason: DeadLetterReason::WriteRetriesExhausted,
            topic: topic.into(),
            partition,
            first_offset,
            last_offset,
            error: error.into(),
            attempts,
            timestamp: Utc::now(),
            payload_base64: None,
        }
    }

    /// Message key on the dead-letter topic
    pub fn key(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.topic, self.partition, self.first_offset, self.last_offset
        )
    }
}

/// Counters reported by a forwarder when it stops
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ForwarderStats {
    pub batches: u64,
    pub records_polled: u64,
    pub documents_written: u64,
    pub records_dead_lettered: u64,
    pub write_retries: u64,
    pub commits: u64,
    pub error_backoffs: u64,
}

//! Record → document mapping
//!
//! Pure and stateless: the same record always yields the same document, which
//! is what makes replaying an uncommitted batch safe.
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::TransformError;
use crate::model::{Document, Record, SourceMeta};

const RESERVED_FIELDS: [&str; 2] = ["_id", "_source"];

/// How the document identifier is derived from a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentIdStrategy {
    /// `{topic}-{partition}-{offset}`
    #[default]
    Offset,
    /// Record key (hex when not UTF-8), offset form when there is no key
    Key,
}

pub fn document_id(record: &Record, strategy: DocumentIdStrategy) -> String {
    match (strategy, record.key.as_deref()) {
        (DocumentIdStrategy::Key, Some(key)) if !key.is_empty() => match std::str::from_utf8(key) {
            Ok(text) => text.to_string(),
            Err(_) => hex(key),
        },
        _ => format!("{}-{}-{}", record.topic, record.partition, record.offset),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Map a raw record to a storage document
pub fn transform(record: &Record, strategy: DocumentIdStrategy) -> Result<Document, TransformError> {
    let partition = record.partition;
    let offset = record.offset;

    let bytes = record
        .value
        .as_deref()
        .ok_or(TransformError::MissingValue { partition, offset })?;

    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| TransformError::InvalidPayload {
            partition,
            offset,
            reason: e.to_string(),
        })?;

    let payload = match value {
        Value::Object(fields) => {
            if let Some(field) = RESERVED_FIELDS.iter().find(|f| fields.contains_key(**f)) {
                return Err(TransformError::ReservedField {
                    partition,
                    offset,
                    field: *field,
                });
            }
            fields
        }
        other => {
            let mut wrapped = Map::new();
            wrapped.insert("value".to_string(), other);
            wrapped
        }
    };

    let document = Document {
        id: document_id(record, strategy),
        payload,
        source: SourceMeta {
            topic: record.topic.clone(),
            partition,
            offset,
            timestamp: record.timestamp,
        },
    };

    // Caught here so the record is dead-lettered alone instead of failing every write of its batch
    document
        .to_bson()
        .map_err(|reason| TransformError::Unstorable {
            partition,
            offset,
            reason,
        })?;

    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MAX_BSON_DOCUMENT_BYTES;

    fn record(offset: i64, value: &str) -> Record {
        Record::new("orders", 0, offset).with_value(value.as_bytes().to_vec())
    }

    #[test]
    fn test_object_payload_kept() {
        let doc = transform(&record(10, r#"{"sku":"A-1","qty":2}"#), DocumentIdStrategy::Offset)
            .unwrap();

        assert_eq!(doc.id, "orders-0-10");
        assert_eq!(doc.payload["sku"], "A-1");
        assert_eq!(doc.payload["qty"], 2);
        assert_eq!(doc.source.offset, 10);
    }

    #[test]
    fn test_scalar_payload_wrapped() {
        let doc = transform(&record(3, "42"), DocumentIdStrategy::Offset).unwrap();
        assert_eq!(doc.payload["value"], 42);

        let doc = transform(&record(4, "[1,2]"), DocumentIdStrategy::Offset).unwrap();
        assert_eq!(doc.payload["value"], serde_json::json!([1, 2]));
    }

    #[test]
    fn test_deterministic() {
        let r = record(11, r#"{"a":{"b":[true,null]}}"#).with_timestamp(1_700_000_000_000);
        let first = transform(&r, DocumentIdStrategy::Offset).unwrap();
        let second = transform(&r, DocumentIdStrategy::Offset).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_tombstone_rejected() {
        let err = transform(&Record::new("orders", 1, 9), DocumentIdStrategy::Offset).unwrap_err();
        assert_eq!(
            err,
            TransformError::MissingValue {
                partition: 1,
                offset: 9
            }
        );
    }

    #[test]
    fn test_invalid_payloads_rejected() {
        let err = transform(&record(21, "{not json"), DocumentIdStrategy::Offset).unwrap_err();
        assert!(matches!(err, TransformError::InvalidPayload { offset: 21, .. }));

        let r = Record::new("orders", 0, 22).with_value(vec![0xff, 0xfe]);
        let err = transform(&r, DocumentIdStrategy::Offset).unwrap_err();
        assert!(matches!(err, TransformError::InvalidPayload { offset: 22, .. }));
    }

    #[test]
    fn test_reserved_field_rejected() {
        let err = transform(&record(5, r#"{"_id":"mine"}"#), DocumentIdStrategy::Offset).unwrap_err();
        assert!(matches!(
            err,
            TransformError::ReservedField { field: "_id", .. }
        ));
    }

    #[test]
    fn test_values_mongodb_cannot_hold_rejected() {
        let err = transform(&record(31, r#"{"n":18446744073709551615}"#), DocumentIdStrategy::Offset)
            .unwrap_err();
        assert!(matches!(
            err,
            TransformError::Unstorable { partition: 0, offset: 31, .. }
        ));

        let oversized = format!(r#"{{"blob":"{}"}}"#, "x".repeat(MAX_BSON_DOCUMENT_BYTES));
        let err = transform(&record(32, &oversized), DocumentIdStrategy::Offset).unwrap_err();
        assert!(matches!(err, TransformError::Unstorable { offset: 32, .. }));

        // Largest value that still fits an i64
        assert!(transform(&record(33, r#"{"n":9223372036854775807}"#), DocumentIdStrategy::Offset).is_ok());
    }

    #[test]
    fn test_key_strategy() {
        let keyed = record(1, "{}").with_key(b"order-77".to_vec());
        assert_eq!(document_id(&keyed, DocumentIdStrategy::Key), "order-77");
        assert_eq!(document_id(&keyed, DocumentIdStrategy::Offset), "orders-0-1");

        let binary = record(2, "{}").with_key(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(document_id(&binary, DocumentIdStrategy::Key), "deadbeef");

        let unkeyed = record(3, "{}");
        assert_eq!(document_id(&unkeyed, DocumentIdStrategy::Key), "orders-0-3");
    }
}

//! Error types for the data sink

use thiserror::Error;

/// Result type for forwarder operations
pub type Result<T> = std::result::Result<T, SinkError>;

/// A record that cannot be turned into a storage document.
///
/// Always carries the partition and offset so the record can be dead-lettered
/// and traced back to the stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("record {partition}@{offset} has no payload")]
    MissingValue { partition: i32, offset: i64 },

    #[error("record {partition}@{offset} payload is not valid JSON: {reason}")]
    InvalidPayload {
        partition: i32,
        offset: i64,
        reason: String,
    },

    #[error("record {partition}@{offset} payload uses reserved field `{field}`")]
    ReservedField {
        partition: i32,
        offset: i64,
        field: &'static str,
    },

    /// Valid JSON that MongoDB cannot hold (integer beyond i64, oversized document)
    #[error("record {partition}@{offset} cannot be stored: {reason}")]
    Unstorable {
        partition: i32,
        offset: i64,
        reason: String,
    },
}

impl TransformError {
    pub fn partition(&self) -> i32 {
        match self {
            TransformError::MissingValue { partition, .. }
            | TransformError::InvalidPayload { partition, .. }
            | TransformError::ReservedField { partition, .. }
            | TransformError::Unstorable { partition, .. } => *partition,
        }
    }

    pub fn offset(&self) -> i64 {
        match self {
            TransformError::MissingValue { offset, .. }
            | TransformError::InvalidPayload { offset, .. }
            | TransformError::ReservedField { offset, .. }
            | TransformError::Unstorable { offset, .. } => *offset,
        }
    }
}

/// Errors surfaced by the stream, storage and dead-letter adapters
#[derive(Error, Debug)]
pub enum SinkError {
    /// Connection-level failure; retried with backoff
    #[error("Transient connection error: {0}")]
    TransientConnection(String),

    /// Credentials or permissions rejected; halts the forwarder
    #[error("Fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    /// Some documents of a batch were not persisted
    #[error("Write failed for {failed} of {total} documents")]
    Write { failed: usize, total: usize },

    /// Settings could not be parsed or validated at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Publishing to the dead-letter topic failed
    #[error("Dead-letter publish failed: {0}")]
    DeadLetter(String),

    /// The partition moved to another consumer; its commit must be dropped
    #[error("Partition {partition} is no longer owned by this consumer")]
    PartitionRevoked { partition: i32 },
}

impl SinkError {
    /// Check if error is transient (should retry)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SinkError::TransientConnection(_) | SinkError::Write { .. }
        )
    }

    /// Check if error must stop the forwarder
    pub fn is_fatal(&self) -> bool {
        matches!(self, SinkError::FatalConfig(_) | SinkError::Config(_))
    }
}

impl From<envy::Error> for SinkError {
    fn from(err: envy::Error) -> Self {
        SinkError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_error_carries_position() {
        let err = TransformError::InvalidPayload {
            partition: 3,
            offset: 42,
            reason: "expected value".to_string(),
        };

        assert_eq!(err.partition(), 3);
        assert_eq!(err.offset(), 42);
        assert!(err.to_string().contains("3@42"));
    }

    #[test]
    fn test_error_classes() {
        assert!(SinkError::TransientConnection("reset".into()).is_transient());
        assert!(SinkError::Write { failed: 1, total: 2 }.is_transient());
        assert!(!SinkError::FatalConfig("denied".into()).is_transient());
        assert!(SinkError::FatalConfig("denied".into()).is_fatal());
        assert!(SinkError::Config("bad".into()).is_fatal());
        assert!(!SinkError::DeadLetter("down".into()).is_fatal());

        let revoked = SinkError::PartitionRevoked { partition: 2 };
        assert!(!revoked.is_transient());
        assert!(!revoked.is_fatal());
    }
}

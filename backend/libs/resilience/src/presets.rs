/// Preset resilience configurations for the data sink's external dependencies
///
/// These presets are tuned for the two transports the forwarder talks to
/// (Kafka and MongoDB) and can be used as-is or adjusted from settings.
use crate::backoff::BackoffConfig;
use crate::retry::RetryConfig;
use std::time::Duration;

/// Whole-batch document writes
///
/// - Retries: 5 after the first attempt
/// - Backoff: 200ms → 10s, doubling, no jitter (delays strictly increase)
pub fn document_write() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        backoff: BackoffConfig {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: false,
        },
    }
}

/// Establishing the MongoDB connection at startup
///
/// - Retries: 4 (server selection already waits internally)
/// - Backoff: 500ms → 8s with jitter
pub fn document_store_connect() -> RetryConfig {
    RetryConfig {
        max_retries: 4,
        backoff: BackoffConfig {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: true,
        },
    }
}

/// Publishing an envelope to the dead-letter topic
///
/// - Retries: 3
/// - Backoff: 100ms → 2s with jitter
pub fn dead_letter_publish() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        backoff: BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: true,
        },
    }
}

/// Pause schedule for the forwarder's error-backoff state
///
/// - 1s → 60s, doubling per consecutive failure
pub fn stream_error_backoff() -> BackoffConfig {
    BackoffConfig {
        initial: Duration::from_secs(1),
        max: Duration::from_secs(60),
        multiplier: 2.0,
        jitter: false,
    }
}

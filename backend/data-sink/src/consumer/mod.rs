//! Stream consumption
use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::model::Record;

pub mod kafka;

pub use kafka::{KafkaOffsetStore, KafkaRecordSource};

/// Pull-based source of stream records.
///
/// Within a partition, records come back in non-decreasing offset order with
/// no duplicate offset inside one poll result. Polling never commits; offset
/// advancement belongs to the [`OffsetCommitter`](crate::checkpoint::OffsetCommitter).
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Return up to `max_batch_size` records, waiting at most `timeout` for them.
    ///
    /// An empty result means nothing arrived in time.
    async fn poll(&self, max_batch_size: usize, timeout: Duration) -> Result<Vec<Record>>;
}

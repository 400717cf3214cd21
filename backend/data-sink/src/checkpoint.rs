//! Commit checkpoints
//!
//! The [`OffsetCommitter`] owns the per-partition checkpoint of one forwarder
//! loop. Offsets here are always the last *handled* record; converting to the
//! consumer group's "next offset to read" convention is the store's business.
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, SinkError};

/// Durable home of committed offsets
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Persist `offset` as the last handled record of `partition`
    async fn persist(&self, partition: i32, offset: i64) -> Result<()>;

    /// Last handled offset per partition, as previously persisted
    async fn committed(&self) -> Result<BTreeMap<i32, i64>>;
}

/// Monotonic per-partition checkpoint backed by an [`OffsetStore`]
pub struct OffsetCommitter<O: OffsetStore> {
    store: O,
    checkpoints: BTreeMap<i32, i64>,
    /// Offsets cleared for commit whose persist call failed; retried on the next flush
    pending: BTreeMap<i32, i64>,
}

impl<O: OffsetStore> OffsetCommitter<O> {
    pub fn new(store: O) -> Self {
        Self {
            store,
            checkpoints: BTreeMap::new(),
            pending: BTreeMap::new(),
        }
    }

    /// Seed checkpoints from the store so they never regress across restarts
    pub async fn restore(&mut self) -> Result<()> {
        let committed = self.store.committed().await?;

        for (partition, offset) in committed {
            let checkpoint = self.checkpoints.entry(partition).or_insert(offset);
            *checkpoint = (*checkpoint).max(offset);
        }

        info!(partitions = self.checkpoints.len(), "Restored commit checkpoints");
        Ok(())
    }

    /// Advance the checkpoint of `partition` to `offset`.
    ///
    /// Only call once every document derived from records at or below
    /// `offset` in that partition was written. Returns `false` (and touches
    /// nothing) when `offset` is not above the current checkpoint.
    pub async fn commit(&mut self, partition: i32, offset: i64) -> Result<bool> {
        if self.checkpoint(partition).is_some_and(|current| offset <= current) {
            debug!(partition, offset, "Commit at or below checkpoint ignored");
            return Ok(false);
        }

        if let Err(e) = self.store.persist(partition, offset).await {
            if matches!(e, SinkError::PartitionRevoked { .. }) {
                self.forget(partition);
            }
            return Err(e);
        }
        self.checkpoints.insert(partition, offset);

        if self.pending.get(&partition).is_some_and(|p| *p <= offset) {
            self.pending.remove(&partition);
        }

        debug!(partition, offset, "Checkpoint advanced");
        Ok(true)
    }

    /// Commit the highest handled offset of each partition, keeping failed ones for later.
    ///
    /// Returns the number of partitions whose checkpoint advanced.
    pub async fn commit_all(&mut self, offsets: BTreeMap<i32, i64>) -> usize {
        let mut targets = std::mem::take(&mut self.pending);
        for (partition, offset) in offsets {
            let target = targets.entry(partition).or_insert(offset);
            *target = (*target).max(offset);
        }

        let mut advanced = 0;
        for (partition, offset) in targets {
            match self.commit(partition, offset).await {
                Ok(true) => advanced += 1,
                Ok(false) => {}
                Err(SinkError::PartitionRevoked { .. }) => {
                    info!(partition, offset, "Partition revoked, dropping its commit");
                }
                Err(e) => {
                    warn!(
                        partition,
                        offset,
                        error = %e,
                        "Failed to commit offset, will retry with the next batch"
                    );
                    self.pending.insert(partition, offset);
                }
            }
        }

        advanced
    }

    /// Drop all state of a partition this consumer no longer owns.
    ///
    /// If it is assigned back later, consumption resumes from the group's
    /// committed offset, so no local checkpoint is needed.
    pub fn forget(&mut self, partition: i32) {
        self.checkpoints.remove(&partition);
        self.pending.remove(&partition);
    }

    pub fn checkpoint(&self, partition: i32) -> Option<i64> {
        self.checkpoints.get(&partition).copied()
    }

    pub fn checkpoints(&self) -> &BTreeMap<i32, i64> {
        &self.checkpoints
    }

    pub fn pending(&self) -> &BTreeMap<i32, i64> {
        &self.pending
    }
}

/// Offset store kept in memory, for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryOffsetStore {
    offsets: Mutex<BTreeMap<i32, i64>>,
    history: Mutex<Vec<(i32, i64)>>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with committed offsets, as after a restart
    pub fn with_offsets(offsets: impl IntoIterator<Item = (i32, i64)>) -> Self {
        Self {
            offsets: Mutex::new(offsets.into_iter().collect()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Every persist call in order
    pub fn history(&self) -> Vec<(i32, i64)> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn offset(&self, partition: i32) -> Option<i64> {
        self.offsets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&partition)
            .copied()
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn persist(&self, partition: i32, offset: i64) -> Result<()> {
        self.offsets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(partition, offset);
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((partition, offset));
        Ok(())
    }

    async fn committed(&self) -> Result<BTreeMap<i32, i64>> {
        Ok(self
            .offsets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }
}

#[async_trait]
impl<T: OffsetStore + ?Sized> OffsetStore for std::sync::Arc<T> {
    async fn persist(&self, partition: i32, offset: i64) -> Result<()> {
        (**self).persist(partition, offset).await
    }

    async fn committed(&self) -> Result<BTreeMap<i32, i64>> {
        (**self).committed().await
    }
}

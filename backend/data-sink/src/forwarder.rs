//! Forwarder loop: poll → transform → write → commit
//!
//! One [`Forwarder`] owns one consumer and its commit checkpoint. Records are
//! handled batch by batch; a batch's offsets are committed only once every
//! document derived from it was written (or dead-lettered), which gives
//! at-least-once delivery. Idempotent upserts absorb the duplicates a crash
//! between write and commit produces.
//!
//! ```text
//! Idle → Polling → Transforming → Writing → Committing → Polling
//!          │                        │
//!          └──────→ ErrorBackoff ←──┘        (fatal error / stop signal → Shutdown)
//! ```
use resilience::{with_timeout_result, Backoff, BackoffConfig, RetryConfig, TimeoutError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::checkpoint::{OffsetCommitter, OffsetStore};
use crate::config::{Settings, WriteFailurePolicy};
use crate::consumer::RecordSource;
use crate::dead_letter::DeadLetterSink;
use crate::error::{Result, SinkError};
use crate::model::{Batch, DeadLetter, ForwarderStats, Record};
use crate::sink::DocumentSink;
use crate::transform::{transform, DocumentIdStrategy};

/// Consecutive failures before the forwarder is reported unhealthy
const UNHEALTHY_ERROR_THRESHOLD: u32 = 5;

/// Consecutive failures before we log at critical level
const CRITICAL_ERROR_THRESHOLD: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderState {
    Idle,
    Polling,
    Transforming,
    Writing,
    Committing,
    ErrorBackoff,
    Shutdown,
}

/// Tuning for one forwarder loop
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub batch_size: usize,
    pub poll_timeout: Duration,
    /// Bound on a single write attempt
    pub write_timeout: Duration,
    pub write_retry: RetryConfig,
    pub error_backoff: BackoffConfig,
    pub failure_policy: WriteFailurePolicy,
    pub id_strategy: DocumentIdStrategy,
}

impl ForwarderConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let forwarder = &settings.forwarder;
        Self {
            batch_size: forwarder.batch_size,
            poll_timeout: forwarder.poll_timeout(),
            write_timeout: forwarder.write_timeout(),
            write_retry: forwarder.write_retry(),
            error_backoff: forwarder.error_backoff(),
            failure_policy: forwarder.write_failure_policy,
            id_strategy: settings.document_id_strategy,
        }
    }
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            poll_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(10),
            write_retry: resilience::presets::document_write(),
            error_backoff: resilience::presets::stream_error_backoff(),
            failure_policy: WriteFailurePolicy::default(),
            id_strategy: DocumentIdStrategy::default(),
        }
    }
}

enum Polled {
    Records(Vec<Record>),
    Failed(SinkError),
    Shutdown,
}

enum WriteOutcome {
    Written,
    /// Retry ceiling reached; carries the last error and the attempt count
    Exhausted(SinkError, u32),
    Fatal(SinkError),
    Shutdown,
}

/// Resolves once the stop signal is raised. Never resolves if the sender is gone.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub struct Forwarder<S: RecordSource, O: OffsetStore> {
    name: String,
    source: S,
    committer: OffsetCommitter<O>,
    sink: Arc<dyn DocumentSink>,
    dead_letters: Arc<dyn DeadLetterSink>,
    config: ForwarderConfig,
    shutdown: watch::Receiver<bool>,
    state: ForwarderState,
    error_backoff: Backoff,
    stats: ForwarderStats,
}

impl<S: RecordSource, O: OffsetStore> Forwarder<S, O> {
    pub fn new(
        name: impl Into<String>,
        source: S,
        offsets: O,
        sink: Arc<dyn DocumentSink>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: ForwarderConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let error_backoff = Backoff::new(config.error_backoff.clone());
        Self {
            name: name.into(),
            source,
            committer: OffsetCommitter::new(offsets),
            sink,
            dead_letters,
            config,
            shutdown,
            state: ForwarderState::Idle,
            error_backoff,
            stats: ForwarderStats::default(),
        }
    }

    pub fn state(&self) -> ForwarderState {
        self.state
    }

    pub fn stats(&self) -> &ForwarderStats {
        &self.stats
    }

    pub fn checkpoint(&self, partition: i32) -> Option<i64> {
        self.committer.checkpoint(partition)
    }

    /// Run until the stop signal or a fatal error.
    ///
    /// A stop signal returns `Ok` with the final counters; batches that were
    /// not committed yet are redelivered to the next consumer. Fatal errors
    /// (rejected credentials, missing permissions) are returned as `Err`.
    pub async fn run(&mut self) -> Result<ForwarderStats> {
        info!(
            forwarder = %self.name,
            batch_size = self.config.batch_size,
            poll_timeout_ms = self.config.poll_timeout.as_millis() as u64,
            max_write_retries = self.config.write_retry.max_retries,
            policy = ?self.config.failure_policy,
            "Forwarder starting"
        );

        if !self.restore_checkpoints().await? {
            return Ok(self.stop());
        }

        loop {
            if self.is_shutdown() {
                break;
            }

            self.transition(ForwarderState::Polling);
            let records = match self.poll().await {
                Polled::Records(records) => records,
                Polled::Shutdown => break,
                Polled::Failed(e) if e.is_fatal() => return Err(self.halt(e)),
                Polled::Failed(e) => {
                    if !self.backoff_after(&e).await {
                        break;
                    }
                    continue;
                }
            };
            self.error_backoff.reset();

            if records.is_empty() {
                continue;
            }

            self.stats.batches += 1;
            self.stats.records_polled += records.len() as u64;

            let batch = self.transform_batch(records).await;

            if !self.persist_batch(&batch).await? {
                break;
            }

            self.commit_batch(&batch).await;
        }

        Ok(self.stop())
    }

    fn transition(&mut self, next: ForwarderState) {
        if self.state != next {
            trace!(forwarder = %self.name, from = ?self.state, to = ?next, "State transition");
            self.state = next;
        }
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn stop(&mut self) -> ForwarderStats {
        self.transition(ForwarderState::Shutdown);
        info!(
            forwarder = %self.name,
            batches = self.stats.batches,
            documents_written = self.stats.documents_written,
            dead_lettered = self.stats.records_dead_lettered,
            checkpoints = ?self.committer.checkpoints(),
            "Forwarder stopped"
        );
        self.stats.clone()
    }

    fn halt(&mut self, err: SinkError) -> SinkError {
        self.transition(ForwarderState::Shutdown);
        error!(forwarder = %self.name, error = %err, "Fatal error, forwarder halting");
        err
    }

    /// Sleep for `delay`, returning `false` if the stop signal cut it short
    async fn sleep_unless_shutdown(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = wait_for_shutdown(&mut shutdown) => false,
        }
    }

    /// Seed checkpoints from the offset store, backing off on transient errors.
    ///
    /// Returns `false` if the stop signal arrived first.
    async fn restore_checkpoints(&mut self) -> Result<bool> {
        loop {
            if self.is_shutdown() {
                return Ok(false);
            }
            match self.committer.restore().await {
                Ok(()) => {
                    self.error_backoff.reset();
                    return Ok(true);
                }
                Err(e) if e.is_fatal() => return Err(self.halt(e)),
                Err(e) => {
                    if !self.backoff_after(&e).await {
                        return Ok(false);
                    }
                }
            }
        }
    }

    async fn poll(&mut self) -> Polled {
        let mut shutdown = self.shutdown.clone();
        let poll = self
            .source
            .poll(self.config.batch_size, self.config.poll_timeout);

        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => Polled::Shutdown,
            result = poll => match result {
                Ok(records) => Polled::Records(records),
                Err(e) => Polled::Failed(e),
            },
        }
    }

    /// Wait out the error-backoff delay for the current failure streak
    async fn backoff_after(&mut self, err: &SinkError) -> bool {
        self.transition(ForwarderState::ErrorBackoff);
        self.stats.error_backoffs += 1;

        let consecutive = self.error_backoff.failures() + 1;
        let delay = self.error_backoff.next_delay();

        if consecutive >= CRITICAL_ERROR_THRESHOLD {
            error!(
                forwarder = %self.name,
                consecutive_errors = consecutive,
                backoff_ms = delay.as_millis() as u64,
                "CRITICAL: forwarder experiencing persistent failures. \
                 Manual intervention may be required. Error: {}",
                err
            );
        } else if consecutive >= UNHEALTHY_ERROR_THRESHOLD {
            warn!(
                forwarder = %self.name,
                consecutive_errors = consecutive,
                backoff_ms = delay.as_millis() as u64,
                "Forwarder unhealthy - multiple consecutive errors. Error: {}",
                err
            );
        } else {
            warn!(
                forwarder = %self.name,
                consecutive_errors = consecutive,
                backoff_ms = delay.as_millis() as u64,
                "Forwarder error (will retry with backoff): {}",
                err
            );
        }

        self.sleep_unless_shutdown(delay).await
    }

    async fn transform_batch(&mut self, records: Vec<Record>) -> Batch {
        self.transition(ForwarderState::Transforming);

        let mut batch = Batch::new(records);
        let mut letters = Vec::new();

        for record in &batch.records {
            match transform(record, self.config.id_strategy) {
                Ok(document) => batch.documents.push(document),
                Err(e) => {
                    letters.push(DeadLetter::poison(record, &e));
                    batch.rejected.push(e);
                }
            }
        }

        let superseded = batch.collapse_duplicate_ids();

        debug!(
            forwarder = %self.name,
            records = batch.len(),
            documents = batch.documents.len(),
            rejected = batch.rejected.len(),
            superseded,
            "Batch transformed"
        );

        for letter in letters {
            self.dead_letter(letter, 1).await;
        }

        batch
    }

    /// Write the batch, applying the failure policy once retries run out.
    ///
    /// Returns `Ok(false)` when the stop signal interrupted a backoff; the
    /// batch is then left uncommitted.
    async fn persist_batch(&mut self, batch: &Batch) -> Result<bool> {
        loop {
            match self.write_with_retry(batch).await {
                WriteOutcome::Written => return Ok(true),
                WriteOutcome::Shutdown => return Ok(false),
                WriteOutcome::Fatal(e) => return Err(self.halt(e)),
                WriteOutcome::Exhausted(e, attempts) => match self.config.failure_policy {
                    WriteFailurePolicy::DeadLetter => {
                        self.dead_letter_documents(batch, &e, attempts).await;
                        return Ok(true);
                    }
                    WriteFailurePolicy::Pause => {
                        warn!(
                            forwarder = %self.name,
                            attempts,
                            error = %e,
                            "Write retries exhausted, pausing before retrying the batch"
                        );
                        if !self.backoff_after(&e).await {
                            return Ok(false);
                        }
                    }
                },
            }
        }
    }

    async fn write_with_retry(&mut self, batch: &Batch) -> WriteOutcome {
        self.transition(ForwarderState::Writing);

        if batch.documents.is_empty() {
            return WriteOutcome::Written;
        }

        let mut backoff = Backoff::new(self.config.write_retry.backoff.clone());
        let mut attempt = 0;

        loop {
            attempt += 1;

            let write = self.sink.write(&batch.documents);
            let err = match with_timeout_result(self.config.write_timeout, write).await {
                Ok(result) if result.is_complete() => {
                    self.stats.documents_written += result.written as u64;
                    debug!(
                        forwarder = %self.name,
                        written = result.written,
                        attempt,
                        "Batch written"
                    );
                    return WriteOutcome::Written;
                }
                Ok(result) => SinkError::Write {
                    failed: result.failed.len(),
                    total: result.total(),
                },
                Err(TimeoutError::Elapsed(after)) => {
                    SinkError::TransientConnection(format!("write timed out after {:?}", after))
                }
                Err(TimeoutError::Inner(e)) if e.is_fatal() => return WriteOutcome::Fatal(e),
                Err(TimeoutError::Inner(e)) => e,
            };

            if attempt > self.config.write_retry.max_retries {
                return WriteOutcome::Exhausted(err, attempt);
            }

            let delay = backoff.next_delay();
            self.stats.write_retries += 1;

            warn!(
                forwarder = %self.name,
                error = %err,
                "Write attempt {}/{} failed, retrying whole batch in {:?}",
                attempt,
                self.config.write_retry.max_retries + 1,
                delay
            );

            if !self.sleep_unless_shutdown(delay).await {
                return WriteOutcome::Shutdown;
            }
        }
    }

    /// One letter per partition covering the offsets of the unwritten documents
    async fn dead_letter_documents(&mut self, batch: &Batch, err: &SinkError, attempts: u32) {
        let mut ranges: BTreeMap<i32, (i64, i64, u64)> = BTreeMap::new();
        let unwritten = batch
            .documents
            .iter()
            .map(|document| &document.source)
            .chain(&batch.superseded);
        for source in unwritten {
            ranges
                .entry(source.partition)
                .and_modify(|(first, last, count)| {
                    *first = (*first).min(source.offset);
                    *last = (*last).max(source.offset);
                    *count += 1;
                })
                .or_insert((source.offset, source.offset, 1));
        }

        let topic = batch.topic().unwrap_or_default().to_string();
        for (partition, (first, last, count)) in ranges {
            let letter =
                DeadLetter::exhausted_range(&topic, partition, (first, last), err.to_string(), attempts);
            self.dead_letter(letter, count).await;
        }
    }

    async fn dead_letter(&mut self, letter: DeadLetter, records: u64) {
        error!(
            forwarder = %self.name,
            reason = ?letter.reason,
            topic = %letter.topic,
            partition = letter.partition,
            first_offset = letter.first_offset,
            last_offset = letter.last_offset,
            attempts = letter.attempts,
            error = %letter.error,
            "Dead-lettering records"
        );
        self.stats.records_dead_lettered += records;

        if let Err(e) = self.dead_letters.send(&letter).await {
            warn!(
                forwarder = %self.name,
                key = %letter.key(),
                error = %e,
                "Dead letter not published, continuing"
            );
        }
    }

    async fn commit_batch(&mut self, batch: &Batch) {
        self.transition(ForwarderState::Committing);

        let advanced = self.committer.commit_all(batch.highest_offsets()).await;
        self.stats.commits += advanced as u64;
        self.error_backoff.reset();
    }
}

//! Document storage
//!
//! Writers persist documents as upserts keyed by document id, so writing the
//! same batch twice leaves storage unchanged.
use async_trait::async_trait;

use crate::error::Result;
use crate::model::Document;

pub mod memory;
pub mod mongo;

pub use memory::MemorySink;
pub use mongo::MongoSink;

/// A document that was not persisted by a write call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDocument {
    pub id: String,
    pub error: String,
}

/// Outcome of writing one batch of documents
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteResult {
    pub written: usize,
    pub failed: Vec<FailedDocument>,
}

impl WriteResult {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.written + self.failed.len()
    }
}

/// Storage backend for documents.
///
/// `Err` means the call failed as a whole (connection lost, credentials
/// rejected); per-document failures are reported in [`WriteResult::failed`].
#[async_trait]
pub trait DocumentSink: Send + Sync {
    async fn write(&self, documents: &[Document]) -> Result<WriteResult>;
}

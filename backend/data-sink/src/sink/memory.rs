//! In-memory document sink for dry runs and tests
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

use super::{DocumentSink, WriteResult};
use crate::error::Result;
use crate::model::Document;

/// Upserts documents into a map keyed by id
#[derive(Debug, Default)]
pub struct MemorySink {
    documents: Mutex<BTreeMap<String, Value>>,
    write_calls: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        self.lock().get(id).cloned()
    }

    /// Stored ids in sorted order
    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        self.documents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DocumentSink for MemorySink {
    async fn write(&self, documents: &[Document]) -> Result<WriteResult> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);

        let mut stored = self.lock();
        for doc in documents {
            stored.insert(doc.id.clone(), doc.to_json());
        }

        debug!(count = documents.len(), total = stored.len(), "Upserted documents in memory");

        Ok(WriteResult {
            written: documents.len(),
            failed: Vec::new(),
        })
    }
}

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::PersistenceStore;
use crate::error::Result;
use crate::ingest::dedupe::FingerprintEntry;
use crate::orchestration::job::{OutcomeStatus, ProcessingOutcome};
use crate::types::ContentHash;

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    fingerprints: HashMap<ContentHash, FingerprintEntry>,
    outcomes: Vec<ProcessingOutcome>,
}

impl InMemoryStore {
    pub fn fingerprint_count(&self) -> usize {
        self.lock().fingerprints.len()
    }

    pub fn outcomes(&self) -> Vec<ProcessingOutcome> {
        self.lock().outcomes.clone()
    }

    pub fn count_status(&self, status: OutcomeStatus) -> usize {
        self.lock()
            .outcomes
            .iter()
            .filter(|outcome| outcome.status == status)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn lookup(&self, hash: &ContentHash) -> Result<Option<FingerprintEntry>> {
        Ok(self.lock().fingerprints.get(hash).cloned())
    }

    async fn insert(&self, entry: FingerprintEntry) -> Result<()> {
        self.lock()
            .fingerprints
            .entry(entry.content_hash.clone())
            .or_insert(entry);
        Ok(())
    }

    async fn save(&self, outcome: &ProcessingOutcome) -> Result<()> {
        self.lock().outcomes.push(outcome.clone());
        Ok(())
    }
}

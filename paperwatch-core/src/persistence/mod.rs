//! Storage collaborator for fingerprints and finished outcomes.

use async_trait::async_trait;

use crate::error::Result;
use crate::ingest::dedupe::FingerprintEntry;
use crate::orchestration::job::ProcessingOutcome;
use crate::types::ContentHash;

pub mod jsonl;
pub mod memory;

pub use jsonl::JsonlStore;
pub use memory::InMemoryStore;

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn lookup(&self, hash: &ContentHash) -> Result<Option<FingerprintEntry>>;

    /// Record a first sighting. Callers guarantee the hash is not yet present.
    async fn insert(&self, entry: FingerprintEntry) -> Result<()>;

    async fn save(&self, outcome: &ProcessingOutcome) -> Result<()>;
}

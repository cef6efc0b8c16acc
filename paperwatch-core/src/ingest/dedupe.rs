//! Content fingerprinting and first-seen admission.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::persistence::PersistenceStore;
use crate::types::ContentHash;

const HASH_CHUNK: usize = 64 * 1024;

/// First sighting of a piece of content. Entries are never removed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintEntry {
    pub content_hash: ContentHash,
    pub first_seen_path: PathBuf,
    pub first_seen_at: DateTime<Utc>,
}

impl FingerprintEntry {
    pub fn new(content_hash: ContentHash, first_seen_path: PathBuf) -> Self {
        Self {
            content_hash,
            first_seen_path,
            first_seen_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted(ContentHash),
    Rejected {
        existing_path: PathBuf,
        hash: ContentHash,
    },
}

impl Admission {
    pub fn hash(&self) -> &ContentHash {
        match self {
            Admission::Admitted(hash) | Admission::Rejected { hash, .. } => hash,
        }
    }
}

/// Set of seen fingerprints with an atomic membership test plus insert.
#[async_trait]
pub trait FingerprintIndex: Send + Sync {
    /// Insert `entry` unless its hash is already present. Two concurrent calls
    /// with the same hash must yield exactly one `Admitted`.
    async fn check_and_insert(&self, entry: FingerprintEntry) -> Result<Admission>;
}

/// [`FingerprintIndex`] backed by a [`PersistenceStore`]. Lookup and insert
/// run under one lock so the store itself does not need to be transactional.
pub struct StoreFingerprintIndex {
    store: Arc<dyn PersistenceStore>,
    gate: Mutex<()>,
}

impl fmt::Debug for StoreFingerprintIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreFingerprintIndex").finish_non_exhaustive()
    }
}

impl StoreFingerprintIndex {
    pub fn new(store: Arc<dyn PersistenceStore>) -> Self {
        Self {
            store,
            gate: Mutex::new(()),
        }
    }
}

#[async_trait]
impl FingerprintIndex for StoreFingerprintIndex {
    async fn check_and_insert(&self, entry: FingerprintEntry) -> Result<Admission> {
        let _guard = self.gate.lock().await;
        if let Some(existing) = self.store.lookup(&entry.content_hash).await? {
            return Ok(Admission::Rejected {
                existing_path: existing.first_seen_path,
                hash: entry.content_hash,
            });
        }
        let hash = entry.content_hash.clone();
        self.store.insert(entry).await?;
        Ok(Admission::Admitted(hash))
    }
}

/// Hashes a settled file and admits it only if the fingerprint is new.
#[derive(Clone)]
pub struct Deduplicator {
    index: Arc<dyn FingerprintIndex>,
}

impl fmt::Debug for Deduplicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deduplicator").finish_non_exhaustive()
    }
}

impl Deduplicator {
    pub fn new(index: Arc<dyn FingerprintIndex>) -> Self {
        Self { index }
    }

    /// Hash `path` and admit it if its content has not been seen before.
    pub async fn try_admit(&self, path: &Path) -> Result<Admission> {
        let hash = hash_file(path).await?;
        let admission = self
            .index
            .check_and_insert(FingerprintEntry::new(hash, path.to_path_buf()))
            .await?;
        match &admission {
            Admission::Admitted(hash) => debug!(
                target: "paperwatch::dedupe",
                path = %path.display(),
                hash = hash.short(),
                "content admitted"
            ),
            Admission::Rejected {
                existing_path,
                hash,
            } => debug!(
                target: "paperwatch::dedupe",
                path = %path.display(),
                existing = %existing_path.display(),
                hash = hash.short(),
                "duplicate content"
            ),
        }
        Ok(admission)
    }
}

/// SHA-256 over the full file content, streamed in fixed-size chunks.
pub async fn hash_file(path: &Path) -> Result<ContentHash> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|err| PipelineError::path_io(path, err))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let read = file
            .read(&mut buf)
            .await
            .map_err(|err| PipelineError::path_io(path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(ContentHash::from_digest(&hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;
    use tempfile::tempdir;

    fn dedupe() -> (Deduplicator, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::default());
        let index = StoreFingerprintIndex::new(store.clone());
        (Deduplicator::new(Arc::new(index)), store)
    }

    #[tokio::test]
    async fn hash_ignores_name() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.pdf");
        let b = dir.path().join("b.PDF");
        std::fs::write(&a, b"same bytes").unwrap();
        std::fs::write(&b, b"same bytes").unwrap();
        assert_eq!(hash_file(&a).await.unwrap(), hash_file(&b).await.unwrap());

        // sha256("abc")
        let abc = dir.path().join("abc");
        std::fs::write(&abc, b"abc").unwrap();
        assert_eq!(
            hash_file(&abc).await.unwrap().as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn second_copy_is_rejected_with_first_path() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.pdf");
        let b = dir.path().join("b.pdf");
        std::fs::write(&a, vec![1u8; 4096]).unwrap();
        std::fs::write(&b, vec![1u8; 4096]).unwrap();

        let (dedupe, store) = dedupe();
        assert!(matches!(
            dedupe.try_admit(&a).await.unwrap(),
            Admission::Admitted(_)
        ));
        match dedupe.try_admit(&b).await.unwrap() {
            Admission::Rejected { existing_path, .. } => assert_eq!(existing_path, a),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(store.fingerprint_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_identical_content_admits_exactly_one() {
        let dir = tempdir().unwrap();
        let payload = vec![42u8; 512 * 1024];
        let paths: Vec<_> = (0..8)
            .map(|n| {
                let path = dir.path().join(format!("copy-{n}.pdf"));
                std::fs::write(&path, &payload).unwrap();
                path
            })
            .collect();

        let (dedupe, _store) = dedupe();
        let handles: Vec<_> = paths
            .into_iter()
            .map(|path| {
                let dedupe = dedupe.clone();
                tokio::spawn(async move { dedupe.try_admit(&path).await.unwrap() })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), Admission::Admitted(_)) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let (dedupe, _store) = dedupe();
        let err = dedupe
            .try_admit(Path::new("/definitely/not/here.pdf"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}

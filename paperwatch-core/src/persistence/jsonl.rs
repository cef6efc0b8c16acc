//! Append-only JSON-lines store.
//!
//! `fingerprints.jsonl` is replayed on open so content seen before a restart
//! is still recognised as a duplicate. `outcomes.jsonl` is write-only from the
//! pipeline's point of view.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::PersistenceStore;
use crate::error::{PipelineError, Result};
use crate::ingest::dedupe::FingerprintEntry;
use crate::orchestration::job::ProcessingOutcome;
use crate::types::ContentHash;

pub const FINGERPRINTS_FILE: &str = "fingerprints.jsonl";
pub const OUTCOMES_FILE: &str = "outcomes.jsonl";

pub struct JsonlStore {
    dir: PathBuf,
    state: Mutex<JsonlState>,
}

struct JsonlState {
    fingerprints: HashMap<ContentHash, FingerprintEntry>,
    fingerprint_log: File,
    outcome_log: File,
}

impl fmt::Debug for JsonlStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonlStore")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl JsonlStore {
    /// Open (or create) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| PipelineError::path_io(&dir, err))?;

        let fingerprint_path = dir.join(FINGERPRINTS_FILE);
        let fingerprints = load_fingerprints(&fingerprint_path).await?;
        info!(
            target: "paperwatch::dedupe",
            path = %fingerprint_path.display(),
            known = fingerprints.len(),
            "fingerprint index loaded"
        );

        let fingerprint_log = open_append(&fingerprint_path).await?;
        let outcome_log = open_append(&dir.join(OUTCOMES_FILE)).await?;

        Ok(Self {
            dir,
            state: Mutex::new(JsonlState {
                fingerprints,
                fingerprint_log,
                outcome_log,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn fingerprint_count(&self) -> usize {
        self.state.lock().await.fingerprints.len()
    }
}

#[async_trait]
impl PersistenceStore for JsonlStore {
    async fn lookup(&self, hash: &ContentHash) -> Result<Option<FingerprintEntry>> {
        Ok(self.state.lock().await.fingerprints.get(hash).cloned())
    }

    async fn insert(&self, entry: FingerprintEntry) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.fingerprints.contains_key(&entry.content_hash) {
            return Ok(());
        }
        append_line(&mut state.fingerprint_log, &entry).await?;
        state.fingerprints.insert(entry.content_hash.clone(), entry);
        Ok(())
    }

    async fn save(&self, outcome: &ProcessingOutcome) -> Result<()> {
        let mut state = self.state.lock().await;
        append_line(&mut state.outcome_log, outcome).await
    }
}

async fn load_fingerprints(path: &Path) -> Result<HashMap<ContentHash, FingerprintEntry>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(err) => return Err(PipelineError::path_io(path, err)),
    };

    let mut fingerprints = HashMap::new();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<FingerprintEntry>(line) {
            Ok(entry) => {
                fingerprints
                    .entry(entry.content_hash.clone())
                    .or_insert(entry);
            }
            // A crash mid-append leaves a torn last line.
            Err(err) => warn!(
                target: "paperwatch::dedupe",
                path = %path.display(),
                line = index + 1,
                error = %err,
                "skipping unreadable fingerprint record"
            ),
        }
    }
    Ok(fingerprints)
}

async fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|err| PipelineError::path_io(path, err))
}

async fn append_line<T: Serialize>(file: &mut File, value: &T) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::job::{FailureReason, Job};
    use tempfile::tempdir;

    fn hash(n: u8) -> ContentHash {
        ContentHash::from_digest(&[n; 32])
    }

    #[tokio::test]
    async fn fingerprints_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = JsonlStore::open(dir.path()).await.unwrap();
            store
                .insert(FingerprintEntry::new(hash(1), PathBuf::from("/inbox/a.pdf")))
                .await
                .unwrap();
        }

        let store = JsonlStore::open(dir.path()).await.unwrap();
        let entry = store.lookup(&hash(1)).await.unwrap().expect("entry reloaded");
        assert_eq!(entry.first_seen_path, PathBuf::from("/inbox/a.pdf"));
        assert!(store.lookup(&hash(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn torn_trailing_line_is_skipped() {
        let dir = tempdir().unwrap();
        {
            let store = JsonlStore::open(dir.path()).await.unwrap();
            store
                .insert(FingerprintEntry::new(hash(3), PathBuf::from("/inbox/c.pdf")))
                .await
                .unwrap();
        }
        let log = dir.path().join(FINGERPRINTS_FILE);
        let mut contents = std::fs::read_to_string(&log).unwrap();
        contents.push_str("{\"content_hash\":\"ab");
        std::fs::write(&log, contents).unwrap();

        let store = JsonlStore::open(dir.path()).await.unwrap();
        assert_eq!(store.fingerprint_count().await, 1);
    }

    #[tokio::test]
    async fn outcomes_append_one_line_each() {
        let dir = tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).await.unwrap();
        let job = Job::new(PathBuf::from("/inbox/d.pdf"), hash(4));
        store
            .save(&ProcessingOutcome::failed(&job, 2, FailureReason::DeadlineExceeded))
            .await
            .unwrap();
        store
            .save(&ProcessingOutcome::failed(&job, 5, FailureReason::Shutdown))
            .await
            .unwrap();

        let contents = std::fs::read_to_string(dir.path().join(OUTCOMES_FILE)).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["status"], "failed");
        assert_eq!(lines[1]["error_reason"]["kind"], "shutdown");
    }
}

//! Jobs, their state machine, and the terminal outcome record.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::orchestration::service::ClassificationResult;
use crate::types::{ContentHash, JobId};

/// Lifecycle of a file moving through the pipeline.
///
/// `Detected → Stabilizing → {Stable | Abandoned}`, then for unique content
/// `Queued → Processing → {Completed | Failed}`. Duplicates and timed-out
/// files branch to `Skipped` straight from `Stable` and never reach the queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Detected,
    Stabilizing,
    Stable,
    Abandoned,
    Queued,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl JobState {
    pub fn can_advance_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Detected, Stabilizing)
                | (Stabilizing, Stable)
                | (Stabilizing, Abandoned)
                | (Stable, Queued)
                | (Stable, Skipped)
                // Admitted but never queued (queue closed or full past the
                // enqueue timeout).
                | (Stable, Failed)
                | (Queued, Processing)
                // Forced shutdown drains queued jobs without a service call.
                | (Queued, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }

    pub fn advance(self, next: JobState) -> Result<JobState> {
        if self.can_advance_to(next) {
            Ok(next)
        } else {
            Err(PipelineError::IllegalTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Abandoned | JobState::Completed | JobState::Failed | JobState::Skipped
        )
    }
}

/// A file observed in the inbox, before it is known to be complete.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileEvent {
    pub path: PathBuf,
    pub first_observed_at: DateTime<Utc>,
    pub last_observed_size: Option<u64>,
}

impl FileEvent {
    pub fn new(path: PathBuf, size: Option<u64>) -> Self {
        Self {
            path,
            first_observed_at: Utc::now(),
            last_observed_size: size,
        }
    }
}

/// Unit of work handed from the deduplicator to the worker pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub path: PathBuf,
    pub content_hash: ContentHash,
    /// Set by the queue at admission; strictly increasing per queue.
    pub sequence: u64,
    pub enqueued_at: Option<DateTime<Utc>>,
    /// Number of service attempts made so far.
    pub attempt: u16,
    /// The file was forwarded because stabilization hit its timeout.
    pub stabilized_by_timeout: bool,
    pub state: JobState,
}

impl Job {
    pub fn new(path: PathBuf, content_hash: ContentHash) -> Self {
        Self {
            id: JobId::new(),
            path,
            content_hash,
            sequence: 0,
            enqueued_at: None,
            attempt: 0,
            stabilized_by_timeout: false,
            state: JobState::Stable,
        }
    }

    pub fn with_stabilized_by_timeout(mut self, flag: bool) -> Self {
        self.stabilized_by_timeout = flag;
        self
    }

    pub fn transition(&mut self, next: JobState) -> Result<()> {
        self.state = self.state.advance(next)?;
        Ok(())
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Terminal status recorded for every file the pipeline finishes with.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Failed,
    SkippedDuplicate,
    SkippedTimeout,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeStatus::Completed => write!(f, "completed"),
            OutcomeStatus::Failed => write!(f, "failed"),
            OutcomeStatus::SkippedDuplicate => write!(f, "skipped_duplicate"),
            OutcomeStatus::SkippedTimeout => write!(f, "skipped_timeout"),
        }
    }
}

/// Why a job ended in `Failed` (or was skipped).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The service refused the document; retrying would not help.
    Rejected(String),
    /// Every attempt failed with a retryable error.
    RetriesExhausted { attempts: u16, last_error: String },
    /// The per-document deadline ran out across attempts.
    DeadlineExceeded,
    /// Grace period expired (or the queue closed) before the job finished.
    Shutdown,
    /// No queue slot freed up before the enqueue timeout.
    QueueTimeout,
    /// The source file could not be read.
    Io(String),
    /// Processing task panicked.
    Panicked(String),
    /// File never stopped growing before the stabilization timeout.
    StabilizationTimeout,
    /// Content already seen at `existing_path`.
    Duplicate { existing_path: PathBuf },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Rejected(msg) => write!(f, "rejected by service: {msg}"),
            FailureReason::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "gave up after {attempts} attempts: {last_error}"),
            FailureReason::DeadlineExceeded => write!(f, "per-document deadline exceeded"),
            FailureReason::Shutdown => write!(f, "cancelled by shutdown"),
            FailureReason::QueueTimeout => write!(f, "timed out waiting for a queue slot"),
            FailureReason::Io(msg) => write!(f, "io error: {msg}"),
            FailureReason::Panicked(msg) => write!(f, "processing panicked: {msg}"),
            FailureReason::StabilizationTimeout => {
                write!(f, "file size never stabilized")
            }
            FailureReason::Duplicate { existing_path } => {
                write!(f, "duplicate of {}", existing_path.display())
            }
        }
    }
}

/// Immutable record of how the pipeline finished with a file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessingOutcome {
    pub job_id: JobId,
    pub status: OutcomeStatus,
    pub source_path: PathBuf,
    pub content_hash: Option<ContentHash>,
    pub attempts: u16,
    /// Where the file ended up. `None` when relocation itself failed.
    pub final_location: Option<PathBuf>,
    pub error_reason: Option<FailureReason>,
    pub result: Option<ClassificationResult>,
    pub finished_at: DateTime<Utc>,
}

impl ProcessingOutcome {
    pub fn completed(job: &Job, attempts: u16, result: ClassificationResult) -> Self {
        Self {
            job_id: job.id,
            status: OutcomeStatus::Completed,
            source_path: job.path.clone(),
            content_hash: Some(job.content_hash.clone()),
            attempts,
            final_location: None,
            error_reason: None,
            result: Some(result),
            finished_at: Utc::now(),
        }
    }

    pub fn failed(job: &Job, attempts: u16, reason: FailureReason) -> Self {
        Self {
            job_id: job.id,
            status: OutcomeStatus::Failed,
            source_path: job.path.clone(),
            content_hash: Some(job.content_hash.clone()),
            attempts,
            final_location: None,
            error_reason: Some(reason),
            result: None,
            finished_at: Utc::now(),
        }
    }

    /// Outcome for a file that never became a queued job.
    pub fn skipped(
        status: OutcomeStatus,
        source_path: PathBuf,
        content_hash: Option<ContentHash>,
        reason: FailureReason,
    ) -> Self {
        Self {
            job_id: JobId::new(),
            status,
            source_path,
            content_hash,
            attempts: 0,
            final_location: None,
            error_reason: Some(reason),
            result: None,
            finished_at: Utc::now(),
        }
    }

    pub fn with_final_location(mut self, location: Option<PathBuf>) -> Self {
        self.final_location = location;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash() -> ContentHash {
        ContentHash::from_digest(&[7u8; 32])
    }

    #[test]
    fn happy_path_transitions() {
        let mut job = Job::new(PathBuf::from("/inbox/a.pdf"), hash());
        job.transition(JobState::Queued).unwrap();
        job.transition(JobState::Processing).unwrap();
        job.transition(JobState::Completed).unwrap();
        assert!(job.state.is_terminal());
    }

    #[test]
    fn skipped_jobs_never_reach_queue() {
        assert!(JobState::Stable.can_advance_to(JobState::Skipped));
        assert!(!JobState::Skipped.can_advance_to(JobState::Queued));
        assert!(!JobState::Abandoned.can_advance_to(JobState::Queued));
    }

    #[test]
    fn completed_job_cannot_be_reprocessed() {
        let err = JobState::Completed
            .advance(JobState::Processing)
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::IllegalTransition {
                from: JobState::Completed,
                to: JobState::Processing
            }
        ));
    }

    #[test]
    fn failure_reason_serializes_with_kind_tag() {
        let json = serde_json::to_value(FailureReason::Shutdown).unwrap();
        assert_eq!(json["kind"], "shutdown");
        let json = serde_json::to_value(FailureReason::RetriesExhausted {
            attempts: 5,
            last_error: "503".into(),
        })
        .unwrap();
        assert_eq!(json["detail"]["attempts"], 5);
    }
}

//! Per-candidate intake: stabilize, fingerprint, then enqueue.
//!
//! Every candidate runs in its own task on the shared tracker, bounded by a
//! semaphore, so a slow-growing file never holds up its neighbours.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::dedupe::{Admission, Deduplicator};
use super::ownership::ActivePaths;
use super::stabilize::{StabilizationGate, StabilizationOutcome};
use crate::error::Result;
use crate::orchestration::config::{PipelineConfig, TimeoutPolicy};
use crate::orchestration::events::{PipelineEvent, PipelineEvents};
use crate::orchestration::job::{
    FailureReason, FileEvent, Job, JobState, OutcomeStatus, ProcessingOutcome,
};
use crate::orchestration::outcome::OutcomeRecorder;
use crate::orchestration::queue::{EnqueueError, JobQueue};
use crate::orchestration::stats::PipelineStats;
use crate::types::JobId;

/// Where a candidate ended up once intake let go of it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CandidateFate {
    /// Queued for the worker pool, which now owns the path.
    Enqueued(JobId),
    /// Relocated with a terminal outcome without reaching a worker.
    Finished(OutcomeStatus),
    /// Terminal outcome recorded but the file could not leave the inbox. The
    /// path stays claimed so later sweeps do not pick it up again.
    Stranded(OutcomeStatus),
    /// This path already produced the recorded fingerprint, so an earlier
    /// run finished with it and could not move it. Nothing new is recorded
    /// and the path stays claimed.
    AlreadyHandled,
    /// Shutdown began before the file settled. The file is left in place.
    Abandoned,
    /// Transient I/O failure. The file is left in place for a later sweep.
    Dropped,
}

#[derive(Clone)]
pub struct Intake {
    inner: Arc<IntakeInner>,
}

struct IntakeInner {
    gate: StabilizationGate,
    on_timeout: TimeoutPolicy,
    dedupe: Deduplicator,
    queue: Arc<JobQueue>,
    enqueue_timeout: Option<Duration>,
    recorder: OutcomeRecorder,
    active: ActivePaths,
    stats: PipelineStats,
    events: PipelineEvents,
    permits: Arc<Semaphore>,
}

impl fmt::Debug for Intake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Intake")
            .field("gate", &self.inner.gate)
            .field("on_timeout", &self.inner.on_timeout)
            .field("enqueue_timeout", &self.inner.enqueue_timeout)
            .field("available_permits", &self.inner.permits.available_permits())
            .finish()
    }
}

impl Intake {
    pub fn new(
        config: &PipelineConfig,
        dedupe: Deduplicator,
        queue: Arc<JobQueue>,
        recorder: OutcomeRecorder,
        active: ActivePaths,
        stats: PipelineStats,
        events: PipelineEvents,
    ) -> Self {
        Self {
            inner: Arc::new(IntakeInner {
                gate: StabilizationGate::from_config(&config.stabilization),
                on_timeout: config.stabilization.on_timeout,
                dedupe,
                queue,
                enqueue_timeout: config.queue.enqueue_timeout(),
                recorder,
                active,
                stats,
                events,
                permits: Arc::new(Semaphore::new(
                    config.watch.max_concurrent_stabilizations.max(1),
                )),
            }),
        }
    }

    /// Fan candidates out to intake tasks until the channel closes or
    /// `cancel` fires.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<FileEvent>,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.inner.active.release(&event.path);
                    break;
                }
                permit = Arc::clone(&self.inner.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        self.inner.active.release(&event.path);
                        break;
                    }
                },
            };

            let intake = self.clone();
            let cancel = cancel.clone();
            tracker.spawn(async move {
                let _permit = permit;
                intake.handle(event, &cancel).await;
            });
        }

        // Claimed by the watcher but never started.
        rx.close();
        while let Ok(event) = rx.try_recv() {
            self.inner.active.release(&event.path);
        }
        debug!(target: "paperwatch::intake", "intake dispatcher stopped");
    }

    /// Drive one candidate as far as the queue. Path ownership is released
    /// here unless the job was enqueued or the file is stuck in the inbox.
    pub async fn handle(&self, event: FileEvent, cancel: &CancellationToken) -> CandidateFate {
        let path = event.path.clone();
        let fate = match self.process(event, cancel).await {
            Ok(fate) => fate,
            Err(err) => {
                if err.is_not_found() {
                    debug!(target: "paperwatch::intake", path = %path.display(), "candidate vanished");
                } else {
                    warn!(
                        target: "paperwatch::intake",
                        path = %path.display(),
                        error = %err,
                        "dropping candidate"
                    );
                }
                self.inner.stats.record_dropped();
                CandidateFate::Dropped
            }
        };

        match fate {
            CandidateFate::Finished(_) | CandidateFate::Abandoned | CandidateFate::Dropped => {
                self.inner.active.release(&path);
            }
            CandidateFate::Enqueued(_)
            | CandidateFate::Stranded(_)
            | CandidateFate::AlreadyHandled => {}
        }
        fate
    }

    async fn process(&self, event: FileEvent, cancel: &CancellationToken) -> Result<CandidateFate> {
        let inner = &self.inner;
        let path = event.path;

        let (size, by_timeout) = match inner.gate.await_stable(&path, cancel).await? {
            StabilizationOutcome::Abandoned => {
                inner.stats.record_abandoned();
                inner.events.publish(PipelineEvent::Abandoned { path });
                return Ok(CandidateFate::Abandoned);
            }
            StabilizationOutcome::Stable { size, .. } => {
                inner.stats.record_stable();
                (size, false)
            }
            StabilizationOutcome::StableByTimeout { size, .. } => {
                inner.stats.record_stable_by_timeout();
                (size, true)
            }
        };
        inner.events.publish(PipelineEvent::Stabilized {
            path: path.clone(),
            size,
            by_timeout,
        });

        if by_timeout && inner.on_timeout == TimeoutPolicy::Skip {
            warn!(
                target: "paperwatch::intake",
                path = %path.display(),
                size,
                "file never stabilized; skipping"
            );
            let outcome = ProcessingOutcome::skipped(
                OutcomeStatus::SkippedTimeout,
                path,
                None,
                FailureReason::StabilizationTimeout,
            );
            return Ok(self.finish(outcome).await);
        }

        match inner.dedupe.try_admit(&path).await? {
            Admission::Rejected { existing_path, .. } if existing_path == path => {
                warn!(
                    target: "paperwatch::intake",
                    path = %path.display(),
                    "content already recorded from this path; leaving it in place"
                );
                Ok(CandidateFate::AlreadyHandled)
            }
            Admission::Rejected {
                existing_path,
                hash,
            } => {
                inner.stats.record_duplicate();
                inner.events.publish(PipelineEvent::Duplicate {
                    path: path.clone(),
                    existing_path: existing_path.clone(),
                });
                let outcome = ProcessingOutcome::skipped(
                    OutcomeStatus::SkippedDuplicate,
                    path,
                    Some(hash),
                    FailureReason::Duplicate { existing_path },
                );
                Ok(self.finish(outcome).await)
            }
            Admission::Admitted(hash) => {
                inner.stats.record_admitted();
                inner.events.publish(PipelineEvent::Admitted {
                    path: path.clone(),
                    hash: hash.clone(),
                });
                let job = Job::new(path, hash).with_stabilized_by_timeout(by_timeout);
                Ok(self.enqueue(job).await)
            }
        }
    }

    async fn enqueue(&self, job: Job) -> CandidateFate {
        let inner = &self.inner;
        let job_id = job.id;
        let path: PathBuf = job.path.clone();

        match inner.queue.enqueue(job, inner.enqueue_timeout).await {
            Ok(sequence) => {
                inner.events.publish(PipelineEvent::Enqueued {
                    job_id,
                    path,
                    sequence,
                });
                CandidateFate::Enqueued(job_id)
            }
            Err(err) => {
                let reason = match &err {
                    EnqueueError::Closed(_) => FailureReason::Shutdown,
                    EnqueueError::TimedOut { .. } => FailureReason::QueueTimeout,
                };
                warn!(
                    target: "paperwatch::intake",
                    job = %job_id,
                    path = %path.display(),
                    error = %err,
                    "admitted job could not be queued"
                );
                let mut job = err.into_job();
                if let Err(err) = job.transition(JobState::Failed) {
                    debug!(target: "paperwatch::intake", job = %job_id, error = %err, "unexpected job state");
                }
                self.finish(ProcessingOutcome::failed(&job, 0, reason)).await
            }
        }
    }

    async fn finish(&self, outcome: ProcessingOutcome) -> CandidateFate {
        let outcome = self.inner.recorder.finish(outcome).await;
        if outcome.final_location.is_some() {
            CandidateFate::Finished(outcome.status)
        } else {
            CandidateFate::Stranded(outcome.status)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::ingest::dedupe::StoreFingerprintIndex;
    use crate::orchestration::config::LayoutConfig;
    use crate::persistence::InMemoryStore;
    use crate::relocate::FileRelocator;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        inbox: PathBuf,
        root: PathBuf,
        intake: Intake,
        queue: Arc<JobQueue>,
        store: Arc<InMemoryStore>,
        active: ActivePaths,
        stats: PipelineStats,
    }

    async fn fixture(on_timeout: TimeoutPolicy, required_stable_reads: u32) -> Fixture {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let inbox = root.join("inbox");
        std::fs::create_dir_all(&inbox).unwrap();

        let mut config = PipelineConfig::default();
        config.layout = LayoutConfig {
            inbox: inbox.clone(),
            output_root: None,
        };
        config.stabilization.interval_ms = 10;
        config.stabilization.timeout_ms = 200;
        config.stabilization.required_stable_reads = required_stable_reads;
        config.stabilization.on_timeout = on_timeout;
        config.queue.capacity = 4;
        config.queue.enqueue_timeout_ms = Some(50);

        let store = Arc::new(InMemoryStore::default());
        let relocator = Arc::new(FileRelocator::from_layout(&config.layout));
        relocator.ensure_dirs().await.unwrap();
        let stats = PipelineStats::default();
        let events = PipelineEvents::default();
        let recorder = OutcomeRecorder::new(relocator, store.clone(), stats.clone(), events.clone());
        let dedupe = Deduplicator::new(Arc::new(StoreFingerprintIndex::new(store.clone())));
        let queue = Arc::new(JobQueue::new(config.queue.capacity));
        let active = ActivePaths::new();
        let intake = Intake::new(
            &config,
            dedupe,
            Arc::clone(&queue),
            recorder,
            active.clone(),
            stats.clone(),
            events,
        );

        Fixture {
            _dir: dir,
            inbox,
            root,
            intake,
            queue,
            store,
            active,
            stats,
        }
    }

    fn candidate(active: &ActivePaths, path: &Path) -> FileEvent {
        assert!(active.claim(path));
        FileEvent::new(path.to_path_buf(), None)
    }

    #[tokio::test]
    async fn unique_file_is_enqueued_and_stays_owned() {
        let fx = fixture(TimeoutPolicy::Proceed, 1).await;
        let path = fx.inbox.join("a.pdf");
        std::fs::write(&path, b"alpha").unwrap();

        let fate = fx
            .intake
            .handle(candidate(&fx.active, &path), &CancellationToken::new())
            .await;
        assert!(matches!(fate, CandidateFate::Enqueued(_)));
        assert_eq!(fx.queue.len(), 1);
        assert!(fx.active.contains(&path));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn duplicate_moves_to_duplicates() {
        let fx = fixture(TimeoutPolicy::Proceed, 1).await;
        let a = fx.inbox.join("a.pdf");
        let b = fx.inbox.join("b.pdf");
        std::fs::write(&a, b"same").unwrap();
        std::fs::write(&b, b"same").unwrap();
        let cancel = CancellationToken::new();

        fx.intake.handle(candidate(&fx.active, &a), &cancel).await;
        let fate = fx.intake.handle(candidate(&fx.active, &b), &cancel).await;

        assert_eq!(fate, CandidateFate::Finished(OutcomeStatus::SkippedDuplicate));
        assert!(!b.exists());
        assert!(fx.root.join("duplicates/b.pdf").exists());
        assert!(!fx.active.contains(&b));
        assert_eq!(fx.queue.len(), 1);

        let outcomes = fx.store.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(
            outcomes[0].error_reason,
            Some(FailureReason::Duplicate { existing_path: a })
        );
    }

    #[tokio::test]
    async fn closed_queue_fails_admitted_job_with_shutdown() {
        let fx = fixture(TimeoutPolicy::Proceed, 1).await;
        let path = fx.inbox.join("late.pdf");
        std::fs::write(&path, b"late").unwrap();
        fx.queue.close();

        let fate = fx
            .intake
            .handle(candidate(&fx.active, &path), &CancellationToken::new())
            .await;
        assert_eq!(fate, CandidateFate::Finished(OutcomeStatus::Failed));
        assert!(fx.root.join("error/late.pdf").exists());
        assert_eq!(
            fx.store.outcomes()[0].error_reason,
            Some(FailureReason::Shutdown)
        );
    }

    #[tokio::test]
    async fn full_queue_times_out_into_error_dir() {
        let fx = fixture(TimeoutPolicy::Proceed, 1).await;
        let cancel = CancellationToken::new();
        for n in 0..4 {
            let path = fx.inbox.join(format!("fill-{n}.pdf"));
            std::fs::write(&path, format!("fill {n}")).unwrap();
            fx.intake.handle(candidate(&fx.active, &path), &cancel).await;
        }
        assert_eq!(fx.queue.len(), 4);

        let path = fx.inbox.join("overflow.pdf");
        std::fs::write(&path, b"overflow").unwrap();
        let fate = fx.intake.handle(candidate(&fx.active, &path), &cancel).await;
        assert_eq!(fate, CandidateFate::Finished(OutcomeStatus::Failed));
        assert_eq!(
            fx.store.outcomes()[0].error_reason,
            Some(FailureReason::QueueTimeout)
        );
        assert!(fx.root.join("error/overflow.pdf").exists());
    }

    #[tokio::test]
    async fn cancelled_stabilization_leaves_file_in_place() {
        let fx = fixture(TimeoutPolicy::Proceed, 1).await;
        let path = fx.inbox.join("pending.pdf");
        std::fs::write(&path, b"pending").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let fate = fx.intake.handle(candidate(&fx.active, &path), &cancel).await;
        assert_eq!(fate, CandidateFate::Abandoned);
        assert!(path.exists());
        assert!(!fx.active.contains(&path));
        assert!(fx.store.outcomes().is_empty());
    }

    /// Appends to `path` every 5ms for about half a second.
    fn spawn_grower(path: PathBuf) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            use std::io::Write;
            for _ in 0..100 {
                let Ok(mut file) = std::fs::OpenOptions::new().append(true).open(&path) else {
                    return;
                };
                let _ = file.write_all(&[1u8; 64]);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    }

    #[tokio::test]
    async fn skip_policy_sends_unsettled_file_to_error() {
        let fx = fixture(TimeoutPolicy::Skip, 5).await;
        let path = fx.inbox.join("growing.pdf");
        std::fs::write(&path, b"start").unwrap();
        let grower = spawn_grower(path.clone());

        let fate = fx
            .intake
            .handle(candidate(&fx.active, &path), &CancellationToken::new())
            .await;
        grower.abort();
        assert_eq!(fate, CandidateFate::Finished(OutcomeStatus::SkippedTimeout));
        assert_eq!(
            fx.store.outcomes()[0].error_reason,
            Some(FailureReason::StabilizationTimeout)
        );
        assert!(fx.root.join("error/growing.pdf").exists());
    }

    #[tokio::test]
    async fn proceed_policy_queues_unsettled_file_flagged() {
        let fx = fixture(TimeoutPolicy::Proceed, 5).await;
        let path = fx.inbox.join("growing.pdf");
        std::fs::write(&path, b"start").unwrap();
        let grower = spawn_grower(path.clone());

        let fate = fx
            .intake
            .handle(candidate(&fx.active, &path), &CancellationToken::new())
            .await;
        grower.abort();
        assert!(matches!(fate, CandidateFate::Enqueued(_)), "got {fate:?}");
        assert!(fx.active.contains(&path));

        let job = fx.queue.dequeue().await.unwrap();
        assert_eq!(job.path, path);
        assert!(job.stabilized_by_timeout);

        let stats = fx.stats.snapshot();
        assert_eq!(stats.stable_by_timeout, 1);
        assert_eq!(stats.stable, 0);
        assert_eq!(stats.admitted, 1);
        assert!(fx.store.outcomes().is_empty());
    }

    #[tokio::test]
    async fn unmovable_file_stays_claimed() {
        let fx = fixture(TimeoutPolicy::Proceed, 1).await;
        let path = fx.inbox.join("stuck.pdf");
        std::fs::write(&path, b"stuck").unwrap();
        std::fs::remove_dir(fx.root.join("error")).unwrap();
        fx.queue.close();

        let fate = fx
            .intake
            .handle(candidate(&fx.active, &path), &CancellationToken::new())
            .await;
        assert_eq!(fate, CandidateFate::Stranded(OutcomeStatus::Failed));
        assert!(path.exists());
        assert!(fx.active.contains(&path));
        assert_eq!(fx.store.outcomes().len(), 1);
        assert_eq!(fx.store.outcomes()[0].final_location, None);
    }

    #[tokio::test]
    async fn fingerprint_from_same_path_is_not_a_duplicate() {
        let fx = fixture(TimeoutPolicy::Proceed, 1).await;
        let path = fx.inbox.join("again.pdf");
        std::fs::write(&path, b"again").unwrap();
        let cancel = CancellationToken::new();

        let first = fx.intake.handle(candidate(&fx.active, &path), &cancel).await;
        assert!(matches!(first, CandidateFate::Enqueued(_)));
        fx.queue.dequeue().await.unwrap();
        fx.active.release(&path);

        let second = fx.intake.handle(candidate(&fx.active, &path), &cancel).await;
        assert_eq!(second, CandidateFate::AlreadyHandled);
        assert!(path.exists());
        assert!(fx.active.contains(&path));
        assert!(fx.store.outcomes().is_empty());
        assert!(!fx.root.join("duplicates/again.pdf").exists());
        assert_eq!(fx.stats.snapshot().duplicates, 0);
    }

    #[tokio::test]
    async fn vanished_file_is_dropped() {
        let fx = fixture(TimeoutPolicy::Proceed, 1).await;
        let path = fx.inbox.join("ghost.pdf");
        let fate = fx
            .intake
            .handle(candidate(&fx.active, &path), &CancellationToken::new())
            .await;
        assert_eq!(fate, CandidateFate::Dropped);
        assert!(!fx.active.contains(&path));
    }
}

//! Fixed-size pool of queue consumers.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use super::client::RetryingServiceClient;
use super::job::{FailureReason, Job, JobState, ProcessingOutcome};
use super::outcome::OutcomeRecorder;
use super::queue::JobQueue;
use crate::ingest::ownership::ActivePaths;

/// Everything a worker needs, shared by every worker in the pool.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<JobQueue>,
    pub client: RetryingServiceClient,
    pub recorder: OutcomeRecorder,
    pub active: ActivePaths,
    /// Fires once the shutdown grace period has run out.
    pub force: CancellationToken,
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("queue", &self.queue)
            .field("client", &self.client)
            .field("force", &self.force.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    size: usize,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Start `size` workers on `tracker`. They exit once the queue is closed
    /// and drained.
    pub fn spawn(size: usize, context: WorkerContext, tracker: &TaskTracker) -> Self {
        let size = size.max(1);
        let in_flight = Arc::new(AtomicUsize::new(0));
        for worker_id in 0..size {
            let context = context.clone();
            let in_flight = Arc::clone(&in_flight);
            tracker.spawn(async move { worker_loop(worker_id, context, in_flight).await });
        }
        debug!(target: "paperwatch::worker", workers = size, "worker pool started");
        Self { size, in_flight }
    }

    /// Number of workers spawned.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs claimed from the queue and not yet finalized.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

async fn worker_loop(worker_id: usize, context: WorkerContext, in_flight: Arc<AtomicUsize>) {
    debug!(target: "paperwatch::worker", worker = worker_id, "worker started");

    while let Some(mut job) = context.queue.dequeue().await {
        in_flight.fetch_add(1, Ordering::AcqRel);
        let path = job.path.clone();

        let outcome = if context.force.is_cancelled() {
            debug!(
                target: "paperwatch::worker",
                worker = worker_id,
                job = %job.id,
                "grace period over; failing queued job without a service call"
            );
            set_state(&mut job, JobState::Failed);
            ProcessingOutcome::failed(&job, 0, FailureReason::Shutdown)
        } else {
            set_state(&mut job, JobState::Processing);
            run_job(worker_id, &context, job).await
        };

        let outcome = context.recorder.finish(outcome).await;
        if outcome.final_location.is_some() {
            context.active.release(&path);
        } else {
            warn!(
                target: "paperwatch::worker",
                worker = worker_id,
                path = %path.display(),
                "file is still in the inbox; keeping it claimed"
            );
        }
        in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    debug!(target: "paperwatch::worker", worker = worker_id, "worker exiting; queue drained");
}

/// Run the service call in its own task so a panic is contained to this job.
async fn run_job(worker_id: usize, context: &WorkerContext, mut job: Job) -> ProcessingOutcome {
    let client = context.client.clone();
    let force = context.force.clone();
    let call_job = job.clone();
    let handle = tokio::spawn(async move { client.process(&call_job, &force).await });

    match handle.await {
        Ok(Ok(success)) => {
            job.attempt = success.attempts;
            set_state(&mut job, JobState::Completed);
            ProcessingOutcome::completed(&job, success.attempts, success.result)
        }
        Ok(Err(failure)) => {
            job.attempt = failure.attempts;
            set_state(&mut job, JobState::Failed);
            ProcessingOutcome::failed(&job, failure.attempts, failure.reason)
        }
        Err(join_err) => {
            let message = if join_err.is_panic() {
                panic_message(join_err.into_panic())
            } else {
                join_err.to_string()
            };
            error!(
                target: "paperwatch::worker",
                worker = worker_id,
                job = %job.id,
                %message,
                "job task panicked"
            );
            set_state(&mut job, JobState::Failed);
            ProcessingOutcome::failed(&job, job.attempt, FailureReason::Panicked(message))
        }
    }
}

fn set_state(job: &mut Job, next: JobState) {
    if let Err(err) = job.transition(next) {
        warn!(target: "paperwatch::worker", job = %job.id, error = %err, "forcing job state");
        job.state = next;
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

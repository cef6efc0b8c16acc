//! Coordinated shutdown: `Running -> Draining -> Terminated`.
//!
//! Draining cancels the intake token (watcher and pending stabilizations stop
//! at once) and closes the queue, while queued and in-flight jobs keep going.
//! If they have not all finished when the grace period runs out, the force
//! token cancels in-flight service calls and the remaining jobs fail with
//! [`FailureReason::Shutdown`](super::job::FailureReason::Shutdown).

use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use super::queue::JobQueue;

/// Upper bound on the wait for tasks to unwind after the force token fires.
const FORCE_SETTLE: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Running,
    Draining,
    Terminated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// The grace period ran out and in-flight work was cancelled.
    pub forced: bool,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct ShutdownCoordinator {
    state: watch::Sender<PipelineState>,
    intake: CancellationToken,
    force: CancellationToken,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        let (state, _) = watch::channel(PipelineState::Running);
        Self {
            state,
            intake: CancellationToken::new(),
            force: CancellationToken::new(),
            grace,
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Cancelled when draining starts. Watches and stabilizations hold this.
    pub fn intake_token(&self) -> CancellationToken {
        self.intake.clone()
    }

    /// Cancelled when the grace period expires. Service calls hold this.
    pub fn force_token(&self) -> CancellationToken {
        self.force.clone()
    }

    /// Drain `tasks` within the grace period, forcing cancellation after it.
    /// A second call waits for the first to finish.
    pub async fn shutdown(&self, queue: &JobQueue, tasks: &TaskTracker) -> ShutdownReport {
        let started = Instant::now();
        let began = self.state.send_if_modified(|state| {
            if *state == PipelineState::Running {
                *state = PipelineState::Draining;
                true
            } else {
                false
            }
        });
        if !began {
            let mut rx = self.subscribe();
            let _ = rx.wait_for(|state| *state == PipelineState::Terminated).await;
            return ShutdownReport {
                forced: self.force.is_cancelled(),
                elapsed: started.elapsed(),
            };
        }

        info!(
            target: "paperwatch::shutdown",
            grace_ms = self.grace.as_millis() as u64,
            queued = queue.len(),
            "draining pipeline"
        );
        self.intake.cancel();
        queue.close();
        tasks.close();

        let drained = tokio::time::timeout_at(started + self.grace, tasks.wait())
            .await
            .is_ok();

        if !drained {
            warn!(
                target: "paperwatch::shutdown",
                remaining_tasks = tasks.len(),
                "grace period expired; cancelling in-flight work"
            );
            self.force.cancel();
            if tokio::time::timeout(FORCE_SETTLE, tasks.wait()).await.is_err() {
                error!(
                    target: "paperwatch::shutdown",
                    remaining_tasks = tasks.len(),
                    "tasks still running after forced cancellation"
                );
            }
        }

        self.state.send_replace(PipelineState::Terminated);
        let report = ShutdownReport {
            forced: !drained,
            elapsed: started.elapsed(),
        };
        info!(
            target: "paperwatch::shutdown",
            forced = report.forced,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "pipeline terminated"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn drains_within_grace() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(2));
        let mut states = coordinator.subscribe();
        let queue = JobQueue::new(1);
        let tasks = TaskTracker::new();
        let intake = coordinator.intake_token();
        tasks.spawn(async move { intake.cancelled().await });
        tasks.spawn(tokio::time::sleep(Duration::from_millis(500)));

        let report = coordinator.shutdown(&queue, &tasks).await;
        assert!(!report.forced);
        assert!(report.elapsed >= Duration::from_millis(500));
        assert!(report.elapsed < Duration::from_secs(2));
        assert!(queue.is_closed());
        assert!(!coordinator.force_token().is_cancelled());
        assert_eq!(coordinator.state(), PipelineState::Terminated);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), PipelineState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn forces_after_grace() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(2));
        let queue = JobQueue::new(1);
        let tasks = TaskTracker::new();
        let force = coordinator.force_token();
        tasks.spawn(async move { force.cancelled().await });

        let report = coordinator.shutdown(&queue, &tasks).await;
        assert!(report.forced);
        assert!(report.elapsed >= Duration::from_secs(2));
        assert!(report.elapsed < Duration::from_secs(3));
        assert_eq!(coordinator.state(), PipelineState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn observers_see_draining() {
        let coordinator = std::sync::Arc::new(ShutdownCoordinator::new(Duration::from_secs(5)));
        let queue = std::sync::Arc::new(JobQueue::new(1));
        let tasks = TaskTracker::new();
        tasks.spawn(tokio::time::sleep(Duration::from_secs(1)));

        let mut states = coordinator.subscribe();
        let handle = {
            let coordinator = std::sync::Arc::clone(&coordinator);
            let queue = std::sync::Arc::clone(&queue);
            let tasks = tasks.clone();
            tokio::spawn(async move { coordinator.shutdown(&queue, &tasks).await })
        };

        states
            .wait_for(|state| *state == PipelineState::Draining)
            .await
            .unwrap();
        assert!(coordinator.intake_token().is_cancelled());

        let second = coordinator.shutdown(&queue, &tasks).await;
        assert_eq!(coordinator.state(), PipelineState::Terminated);
        assert!(!second.forced);
        assert!(!handle.await.unwrap().forced);
    }
}

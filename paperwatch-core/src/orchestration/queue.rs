//! Bounded FIFO between intake and the worker pool.
//!
//! Capacity is enforced with a fair semaphore of free slots, so the
//! `(C+1)`th producer parks until a worker claims a job (or its timeout
//! elapses). A second semaphore counts queued jobs for consumers. Closing the
//! queue rejects new producers immediately while consumers keep draining what
//! is already queued; `dequeue` returns `None` only once the queue is both
//! closed and empty.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::job::{Job, JobState};

#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The queue is draining for shutdown. The job is handed back.
    #[error("job queue is closed")]
    Closed(Box<Job>),
    /// No slot freed up in time. The job is handed back.
    #[error("timed out after {waited:?} waiting for a queue slot")]
    TimedOut { job: Box<Job>, waited: Duration },
}

impl EnqueueError {
    /// Recover the job that could not be queued.
    pub fn into_job(self) -> Job {
        match self {
            EnqueueError::Closed(job) => *job,
            EnqueueError::TimedOut { job, .. } => *job,
        }
    }
}

struct QueueState {
    items: VecDeque<Job>,
    next_sequence: u64,
    closed: bool,
}

/// Bounded FIFO shared by intake and the workers. Closing it lets workers
/// drain what is left and then stop.
pub struct JobQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    free_slots: Semaphore,
    queued: Semaphore,
    closed: CancellationToken,
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                next_sequence: 1,
                closed: false,
            }),
            free_slots: Semaphore::new(capacity),
            queued: Semaphore::new(0),
            closed: CancellationToken::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Enqueue a job, parking while the queue is full.
    ///
    /// `timeout` bounds the wait for a free slot; `None` waits until a slot
    /// frees or the queue closes.
    pub async fn enqueue(
        &self,
        mut job: Job,
        timeout: Option<Duration>,
    ) -> Result<u64, EnqueueError> {
        if self.is_closed() {
            return Err(EnqueueError::Closed(Box::new(job)));
        }

        let acquire = self.free_slots.acquire();
        let permit = match timeout {
            Some(limit) => match tokio::time::timeout(limit, acquire).await {
                Ok(permit) => permit,
                Err(_) => {
                    debug!(
                        target: "paperwatch::queue",
                        job = %job.id,
                        waited_ms = limit.as_millis() as u64,
                        "enqueue timed out while queue full"
                    );
                    return Err(EnqueueError::TimedOut {
                        job: Box::new(job),
                        waited: limit,
                    });
                }
            },
            None => acquire.await,
        };

        // The slot semaphore is closed together with the queue.
        let Ok(permit) = permit else {
            return Err(EnqueueError::Closed(Box::new(job)));
        };

        let mut state = self.lock();
        if state.closed {
            // Permit drops here and returns the slot.
            return Err(EnqueueError::Closed(Box::new(job)));
        }
        permit.forget();

        if let Err(err) = job.transition(JobState::Queued) {
            debug!(target: "paperwatch::queue", job = %job.id, error = %err, "unexpected job state at enqueue");
            job.state = JobState::Queued;
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        job.sequence = sequence;
        job.enqueued_at = Some(Utc::now());
        trace!(
            target: "paperwatch::queue",
            job = %job.id,
            sequence,
            depth = state.items.len() + 1,
            "job enqueued"
        );
        state.items.push_back(job);
        drop(state);

        self.queued.add_permits(1);
        Ok(sequence)
    }

    /// Claim the oldest job. Parks while empty; returns `None` once the queue
    /// has been closed and fully drained.
    pub async fn dequeue(&self) -> Option<Job> {
        loop {
            if let Ok(permit) = self.queued.try_acquire() {
                permit.forget();
                return self.pop_claimed();
            }

            if self.is_closed() {
                return None;
            }

            tokio::select! {
                biased;
                permit = self.queued.acquire() => match permit {
                    Ok(permit) => {
                        permit.forget();
                        return self.pop_claimed();
                    }
                    Err(_) => return None,
                },
                _ = self.closed.cancelled() => continue,
            }
        }
    }

    /// Stop accepting jobs. Already-queued jobs stay dequeueable and parked
    /// producers are released with [`EnqueueError::Closed`].
    pub fn close(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.free_slots.close();
        self.closed.cancel();
        debug!(target: "paperwatch::queue", remaining = self.len(), "job queue closed");
    }

    fn pop_claimed(&self) -> Option<Job> {
        let job = self.lock().items.pop_front();
        if job.is_some() {
            self.free_slots.add_permits(1);
        }
        job
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::*;
    use crate::types::ContentHash;

    fn job(n: u8) -> Job {
        Job::new(
            PathBuf::from(format!("/inbox/{n}.pdf")),
            ContentHash::from_digest(&[n; 32]),
        )
    }

    #[tokio::test]
    async fn preserves_fifo_order() {
        let queue = JobQueue::new(8);
        for n in 0..5 {
            queue.enqueue(job(n), None).await.unwrap();
        }
        let mut seen = Vec::new();
        while let Some(job) = tokio::time::timeout(Duration::from_millis(10), queue.dequeue())
            .await
            .ok()
            .flatten()
        {
            seen.push(job.sequence);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_blocks_until_slot_frees() {
        let queue = Arc::new(JobQueue::new(2));
        queue.enqueue(job(1), None).await.unwrap();
        queue.enqueue(job(2), None).await.unwrap();
        assert_eq!(queue.len(), 2);

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(job(3), None).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!producer.is_finished(), "third enqueue must park");
        assert_eq!(queue.len(), 2);

        let first = queue.dequeue().await.unwrap();
        assert_eq!(first.sequence, 1);
        let sequence = producer.await.unwrap().unwrap();
        assert_eq!(sequence, 3);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_times_out_and_returns_job() {
        let queue = JobQueue::new(1);
        queue.enqueue(job(1), None).await.unwrap();

        let rejected = job(2);
        let id = rejected.id;
        let err = queue
            .enqueue(rejected, Some(Duration::from_millis(250)))
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::TimedOut { .. }));
        assert_eq!(err.into_job().id, id);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn close_rejects_producers_but_drains_consumers() {
        let queue = Arc::new(JobQueue::new(1));
        queue.enqueue(job(1), None).await.unwrap();

        let parked = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(job(2), None).await })
        };
        tokio::task::yield_now().await;

        queue.close();
        assert!(matches!(
            parked.await.unwrap(),
            Err(EnqueueError::Closed(_))
        ));
        assert!(matches!(
            queue.enqueue(job(3), None).await,
            Err(EnqueueError::Closed(_))
        ));

        assert_eq!(queue.dequeue().await.unwrap().sequence, 1);
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn parked_consumer_wakes_on_close() {
        let queue = Arc::new(JobQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert!(consumer.await.unwrap().is_none());
    }
}

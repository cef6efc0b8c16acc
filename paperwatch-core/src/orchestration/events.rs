use std::path::PathBuf;
use std::pin::Pin;

use futures::Stream;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use super::job::ProcessingOutcome;
use crate::types::{ContentHash, JobId};

/// Lifecycle notifications published as files move through the pipeline.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Detected {
        path: PathBuf,
    },
    Stabilized {
        path: PathBuf,
        size: u64,
        by_timeout: bool,
    },
    Abandoned {
        path: PathBuf,
    },
    Admitted {
        path: PathBuf,
        hash: ContentHash,
    },
    Duplicate {
        path: PathBuf,
        existing_path: PathBuf,
    },
    Enqueued {
        job_id: JobId,
        path: PathBuf,
        sequence: u64,
    },
    Outcome(Box<ProcessingOutcome>),
}

/// Stream of pipeline events for one subscriber.
pub type PipelineEventStream = Pin<Box<dyn Stream<Item = PipelineEvent> + Send>>;

/// In-process fan-out of [`PipelineEvent`]s. Publishing never blocks; slow
/// subscribers observe `Lagged` instead of stalling the pipeline.
#[derive(Clone, Debug)]
pub struct PipelineEvents {
    sender: broadcast::Sender<PipelineEvent>,
}

impl Default for PipelineEvents {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl PipelineEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Subscribe as a stream. Lagged events are skipped; the stream ends
    /// when every publisher is gone.
    pub fn stream(&self) -> PipelineEventStream {
        let rx = self.sender.subscribe();
        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }))
    }

    pub fn publish(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }
}

//! Single exit point for a job: relocate, persist, count, publish.

use std::fmt;
use std::sync::Arc;

use tracing::{error, info};

use super::events::{PipelineEvent, PipelineEvents};
use super::job::{OutcomeStatus, ProcessingOutcome};
use super::stats::PipelineStats;
use crate::persistence::PersistenceStore;
use crate::relocate::{Destination, FileRelocator};

/// Last stop for every file: relocate it, persist the outcome, publish it.
///
/// Relocation and persistence failures are logged, never propagated; the
/// outcome still records where (or whether) the file ended up.
#[derive(Clone)]
pub struct OutcomeRecorder {
    relocator: Arc<FileRelocator>,
    store: Arc<dyn PersistenceStore>,
    stats: PipelineStats,
    events: PipelineEvents,
}

impl fmt::Debug for OutcomeRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutcomeRecorder")
            .field("relocator", &self.relocator)
            .finish_non_exhaustive()
    }
}

impl OutcomeRecorder {
    pub fn new(
        relocator: Arc<FileRelocator>,
        store: Arc<dyn PersistenceStore>,
        stats: PipelineStats,
        events: PipelineEvents,
    ) -> Self {
        Self {
            relocator,
            store,
            stats,
            events,
        }
    }

    pub async fn finish(&self, outcome: ProcessingOutcome) -> ProcessingOutcome {
        let destination = destination_for(outcome.status);
        let location = match self
            .relocator
            .relocate(&outcome.source_path, destination)
            .await
        {
            Ok(location) => Some(location),
            Err(err) => {
                error!(
                    target: "paperwatch::worker",
                    job = %outcome.job_id,
                    path = %outcome.source_path.display(),
                    %destination,
                    error = %err,
                    "failed to relocate file"
                );
                None
            }
        };
        let outcome = outcome.with_final_location(location);

        if let Err(err) = self.store.save(&outcome).await {
            error!(
                target: "paperwatch::worker",
                job = %outcome.job_id,
                error = %err,
                "failed to persist outcome"
            );
        }

        match outcome.status {
            OutcomeStatus::Completed => self.stats.record_completed(),
            OutcomeStatus::Failed => self.stats.record_failed(),
            OutcomeStatus::SkippedDuplicate | OutcomeStatus::SkippedTimeout => {}
        }

        let reason = outcome
            .error_reason
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        info!(
            target: "paperwatch::worker",
            job = %outcome.job_id,
            path = %outcome.source_path.display(),
            status = %outcome.status,
            attempts = outcome.attempts,
            %reason,
            "file finished"
        );
        self.events
            .publish(PipelineEvent::Outcome(Box::new(outcome.clone())));
        outcome
    }
}

pub fn destination_for(status: OutcomeStatus) -> Destination {
    match status {
        OutcomeStatus::Completed => Destination::Processed,
        OutcomeStatus::SkippedDuplicate => Destination::Duplicates,
        OutcomeStatus::Failed | OutcomeStatus::SkippedTimeout => Destination::Error,
    }
}

//! Top-level lifecycle: wiring, `start`, and the two-phase shutdown.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use super::client::RetryingServiceClient;
use super::config::PipelineConfig;
use super::events::{PipelineEvent, PipelineEventStream, PipelineEvents};
use super::outcome::OutcomeRecorder;
use super::queue::JobQueue;
use super::service::ClassificationService;
use super::shutdown::{PipelineState, ShutdownCoordinator, ShutdownReport};
use super::stats::{PipelineStats, StatsSnapshot};
use super::worker::{WorkerContext, WorkerPool};
use crate::error::{PipelineError, Result};
use crate::ingest::dedupe::{Deduplicator, StoreFingerprintIndex};
use crate::ingest::fs_watch::FileWatcher;
use crate::ingest::intake::Intake;
use crate::ingest::ownership::ActivePaths;
use crate::persistence::PersistenceStore;
use crate::relocate::FileRelocator;

/// Wires the watcher, intake, queue and worker pool together and owns their
/// lifetime.
pub struct PipelineRuntime {
    config: PipelineConfig,
    store: Arc<dyn PersistenceStore>,
    service: Arc<dyn ClassificationService>,
    queue: Arc<JobQueue>,
    active: ActivePaths,
    stats: PipelineStats,
    events: PipelineEvents,
    coordinator: ShutdownCoordinator,
    tasks: TaskTracker,
    workers: Option<WorkerPool>,
}

impl fmt::Debug for PipelineRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineRuntime")
            .field("inbox", &self.config.layout.inbox)
            .field("state", &self.coordinator.state())
            .field("queue", &self.queue)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl PipelineRuntime {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn PersistenceStore>,
        service: Arc<dyn ClassificationService>,
    ) -> Result<Self> {
        config.validate()?;
        let coordinator = ShutdownCoordinator::new(config.shutdown.grace());
        Ok(Self {
            queue: Arc::new(JobQueue::new(config.queue.capacity)),
            config,
            store,
            service,
            active: ActivePaths::new(),
            stats: PipelineStats::default(),
            events: PipelineEvents::default(),
            coordinator,
            tasks: TaskTracker::new(),
            workers: None,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn event_stream(&self) -> PipelineEventStream {
        self.events.stream()
    }

    pub fn state(&self) -> PipelineState {
        self.coordinator.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<PipelineState> {
        self.coordinator.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Create the output layout and start every pipeline task. Fails only on
    /// setup problems (missing inbox permissions, unwritable output root).
    pub async fn start(&mut self) -> Result<()> {
        if self.workers.is_some() {
            return Ok(());
        }
        if self.coordinator.state() != PipelineState::Running {
            return Err(PipelineError::Cancelled(
                "pipeline already shut down".to_string(),
            ));
        }

        let layout = &self.config.layout;
        tokio::fs::create_dir_all(&layout.inbox)
            .await
            .map_err(|err| PipelineError::path_io(&layout.inbox, err))?;
        tokio::fs::read_dir(&layout.inbox)
            .await
            .map_err(|err| PipelineError::path_io(&layout.inbox, err))?;
        let relocator = Arc::new(FileRelocator::from_layout(layout));
        relocator.ensure_dirs().await?;

        let recorder = OutcomeRecorder::new(
            relocator,
            Arc::clone(&self.store),
            self.stats.clone(),
            self.events.clone(),
        );

        let workers = WorkerPool::spawn(
            self.config.workers.count,
            WorkerContext {
                queue: Arc::clone(&self.queue),
                client: RetryingServiceClient::from_config(Arc::clone(&self.service), &self.config),
                recorder: recorder.clone(),
                active: self.active.clone(),
                force: self.coordinator.force_token(),
            },
            &self.tasks,
        );

        let intake = Intake::new(
            &self.config,
            Deduplicator::new(Arc::new(StoreFingerprintIndex::new(Arc::clone(&self.store)))),
            Arc::clone(&self.queue),
            recorder,
            self.active.clone(),
            self.stats.clone(),
            self.events.clone(),
        );

        let (tx, rx) = mpsc::channel(self.config.watch.candidate_channel_capacity);
        let cancel = self.coordinator.intake_token();
        self.tasks
            .spawn(intake.run(rx, self.tasks.clone(), cancel.clone()));

        let watcher = FileWatcher::new(
            layout.inbox.clone(),
            self.config.watch.clone(),
            self.active.clone(),
            self.stats.clone(),
            self.events.clone(),
        );
        self.tasks.spawn(async move {
            if let Err(err) = watcher.run(tx, cancel).await {
                error!(target: "paperwatch::watch", error = %err, "inbox watcher failed");
            }
        });

        info!(
            target: "paperwatch::shutdown",
            inbox = %layout.inbox.display(),
            output_root = %layout.output_root().display(),
            workers = workers.size(),
            queue_capacity = self.queue.capacity(),
            "pipeline started"
        );
        self.workers = Some(workers);
        Ok(())
    }

    /// Drain and stop. Safe to call more than once.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.coordinator.shutdown(&self.queue, &self.tasks).await
    }

    /// Start (if needed), run until `signal` fires, then shut down.
    pub async fn run_until(mut self, signal: CancellationToken) -> Result<ShutdownReport> {
        self.start().await?;
        signal.cancelled().await;
        info!(target: "paperwatch::shutdown", "termination requested");
        Ok(self.shutdown().await)
    }
}

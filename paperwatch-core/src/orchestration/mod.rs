pub mod client;
pub mod config;
pub mod events;
#[cfg(feature = "http")]
pub mod http;
pub mod job;
pub mod outcome;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod runtime;
pub mod service;
pub mod shutdown;
pub mod stats;
pub mod worker;

pub use client::{RetryingServiceClient, ServiceFailure, ServiceSuccess};
pub use events::{PipelineEvent, PipelineEventStream, PipelineEvents};
#[cfg(feature = "http")]
pub use http::HttpClassificationService;
pub use job::{FailureReason, FileEvent, Job, JobState, OutcomeStatus, ProcessingOutcome};
pub use queue::{EnqueueError, JobQueue};
pub use service::{ClassificationResult, ClassificationService, Document, ServiceError};
pub use shutdown::ShutdownCoordinator;
pub use stats::{PipelineStats, StatsSnapshot};
pub use worker::{WorkerContext, WorkerPool};

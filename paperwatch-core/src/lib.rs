//! # Paperwatch Core
//!
//! Ingestion and scheduling pipeline for documents dropped into a watched
//! inbox (typically scanner output).
//!
//! ## Overview
//!
//! A file moves through the pipeline in this order:
//!
//! - **Watch**: [`ingest::fs_watch::FileWatcher`] turns directory activity into candidates
//! - **Stabilize**: [`ingest::stabilize::StabilizationGate`] waits until the file stops growing
//! - **Deduplicate**: [`ingest::dedupe::Deduplicator`] admits only first-seen content
//! - **Queue**: [`orchestration::queue::JobQueue`] applies backpressure between intake and workers
//! - **Process**: [`orchestration::worker::WorkerPool`] calls the classification service through
//!   [`orchestration::client::RetryingServiceClient`]
//! - **Finish**: the file is moved to `processed/`, `duplicates/` or `error/` and its
//!   [`orchestration::job::ProcessingOutcome`] is persisted
//!
//! [`orchestration::shutdown::ShutdownCoordinator`] supervises the whole chain and
//! [`orchestration::runtime::PipelineRuntime`] wires it together.
//!
//! ## Feature Flags
//!
//! - `http`: reqwest-backed [`orchestration::http::HttpClassificationService`]
//! - `native-watch`: notify-backed inbox notifications (polling is always available)

pub mod error;
pub mod ingest;
pub mod orchestration;
pub mod persistence;
pub mod relocate;
pub mod types;

pub use error::{PipelineError, Result};
pub use orchestration::config::PipelineConfig;
pub use orchestration::runtime::PipelineRuntime;
pub use orchestration::shutdown::{PipelineState, ShutdownReport};

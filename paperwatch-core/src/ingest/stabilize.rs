//! Write-completion gating.
//!
//! Scanners often write a PDF in phases (image pages first, OCR layer
//! later), so a file is only read once its size has stopped changing for a
//! configured number of consecutive polls. The gate is a best-effort guard
//! against reading half-written files, not a completeness guarantee: once the
//! timeout elapses the file is released anyway and flagged as such.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{PipelineError, Result};
use crate::orchestration::config::StabilizationConfig;

/// Per-file bookkeeping for one quiescence check.
#[derive(Debug, Clone)]
pub struct StabilizationRecord {
    pub path: PathBuf,
    pub poll_count: u32,
    pub consecutive_stable_reads: u32,
    pub last_size: u64,
    pub deadline: Instant,
}

impl StabilizationRecord {
    fn new(path: PathBuf, initial_size: u64, deadline: Instant) -> Self {
        Self {
            path,
            poll_count: 0,
            consecutive_stable_reads: 0,
            last_size: initial_size,
            deadline,
        }
    }

    /// Fold one size observation into the record.
    fn observe(&mut self, size: u64) {
        self.poll_count += 1;
        if size == self.last_size {
            self.consecutive_stable_reads += 1;
        } else {
            self.consecutive_stable_reads = 0;
            self.last_size = size;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilizationOutcome {
    /// Size held steady for the required number of consecutive polls.
    Stable { size: u64, polls: u32 },
    /// The timeout elapsed while the file was still changing.
    StableByTimeout { size: u64, polls: u32 },
    /// Shutdown started before the file settled. The file is left untouched.
    Abandoned,
}

impl StabilizationOutcome {
    pub fn is_timeout(&self) -> bool {
        matches!(self, StabilizationOutcome::StableByTimeout { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StabilizationGate {
    interval: Duration,
    timeout: Duration,
    required_stable_reads: u32,
}

impl StabilizationGate {
    pub fn new(interval: Duration, timeout: Duration, required_stable_reads: u32) -> Self {
        Self {
            interval,
            timeout,
            required_stable_reads: required_stable_reads.max(1),
        }
    }

    pub fn from_config(config: &StabilizationConfig) -> Self {
        Self::new(
            config.interval(),
            config.timeout(),
            config.required_stable_reads,
        )
    }

    /// Poll `path` until its size is stable, the timeout elapses, or `cancel`
    /// fires. Returns an error if the file disappears or cannot be stat'ed.
    pub async fn await_stable(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<StabilizationOutcome> {
        let initial = file_size(path).await?;
        let mut record =
            StabilizationRecord::new(path.to_path_buf(), initial, Instant::now() + self.timeout);

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(
                        target: "paperwatch::stabilize",
                        path = %record.path.display(),
                        polls = record.poll_count,
                        "stabilization abandoned"
                    );
                    return Ok(StabilizationOutcome::Abandoned);
                }
                _ = ticker.tick() => {}
            }

            let size = file_size(path).await?;
            record.observe(size);
            trace!(
                target: "paperwatch::stabilize",
                path = %record.path.display(),
                size,
                stable_reads = record.consecutive_stable_reads,
                "size poll"
            );

            if record.consecutive_stable_reads >= self.required_stable_reads {
                return Ok(StabilizationOutcome::Stable {
                    size,
                    polls: record.poll_count,
                });
            }

            if Instant::now() >= record.deadline {
                debug!(
                    target: "paperwatch::stabilize",
                    path = %record.path.display(),
                    size,
                    polls = record.poll_count,
                    "stabilization timed out; releasing file"
                );
                return Ok(StabilizationOutcome::StableByTimeout {
                    size,
                    polls: record.poll_count,
                });
            }
        }
    }
}

async fn file_size(path: &Path) -> Result<u64> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|err| PipelineError::path_io(path, err))?;
    if !metadata.is_file() {
        return Err(PipelineError::path_io(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
        ));
    }
    Ok(metadata.len())
}

use std::ops::RangeInclusive;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Global knobs that tune pipeline behaviour.
///
/// Every section carries defaults so a deployment only needs to override the
/// handful of values it cares about (typically the inbox and worker count).
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    /// Inbox and output directory layout.
    pub layout: LayoutConfig,
    /// Filesystem watch mode, debounce and candidate filtering.
    pub watch: WatchConfig,
    /// Write-completion gating.
    pub stabilization: StabilizationConfig,
    /// Job queue sizing and backpressure.
    pub queue: QueueConfig,
    /// Worker pool sizing.
    pub workers: WorkerConfig,
    /// Per-call and per-document deadlines for the classification service.
    pub client: ClientConfig,
    /// Retry/backoff policy shared by all workers.
    pub retry: RetryConfig,
    /// Outbound request budget shared by all workers.
    pub rate_limit: RateLimitConfig,
    /// Graceful shutdown tuning.
    pub shutdown: ShutdownConfig,
}

impl PipelineConfig {
    /// Check every section against its accepted range.
    pub fn validate(&self) -> Result<()> {
        self.layout.validate()?;
        self.watch.validate()?;
        self.stabilization.validate()?;
        self.queue.validate()?;
        self.workers.validate()?;
        self.client.validate()?;
        self.retry.validate()?;
        self.rate_limit.validate()?;
        self.shutdown.validate()?;
        Ok(())
    }
}

fn check_range<T>(name: &str, value: T, range: RangeInclusive<T>) -> Result<()>
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(PipelineError::InvalidConfig(format!(
            "{name} = {value} is outside the accepted range {}..={}",
            range.start(),
            range.end()
        )))
    }
}

const ONE_HOUR_MS: u64 = 60 * 60 * 1_000;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Directory scanners drop files into.
    pub inbox: PathBuf,
    /// Parent of `processed/`, `duplicates/` and `error/`. Defaults to the
    /// inbox's parent so relocated files leave the watched directory.
    pub output_root: Option<PathBuf>,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            inbox: PathBuf::from("inbox"),
            output_root: None,
        }
    }
}

impl LayoutConfig {
    pub fn output_root(&self) -> PathBuf {
        match &self.output_root {
            Some(root) => root.clone(),
            None => self
                .inbox
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.output_root().join("processed")
    }

    pub fn duplicates_dir(&self) -> PathBuf {
        self.output_root().join("duplicates")
    }

    pub fn error_dir(&self) -> PathBuf {
        self.output_root().join("error")
    }

    /// Output directories must not sit inside the inbox, or relocated files
    /// would be picked up again. Paths are compared lexically.
    pub fn validate(&self) -> Result<()> {
        let inbox = lexical(&self.inbox);
        for (name, dir) in [
            ("processed", self.processed_dir()),
            ("duplicates", self.duplicates_dir()),
            ("error", self.error_dir()),
        ] {
            if lexical(&dir).starts_with(&inbox) {
                return Err(PipelineError::InvalidConfig(format!(
                    "{name} directory {} lies inside the inbox {}",
                    dir.display(),
                    self.inbox.display()
                )));
            }
        }
        Ok(())
    }
}

/// Drop `.` segments and fold `..` where a parent is known.
fn lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                } else {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    /// Native notifications with a periodic rescan as a safety net. Falls back
    /// to polling if the platform watcher cannot be created.
    #[default]
    Native,
    /// Directory scans every `poll_interval_ms`.
    Poll,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub mode: WatchMode,
    /// Cadence for poll mode (and for the native fallback).
    pub poll_interval_ms: u64,
    /// Safety-net rescan cadence while native notifications are active.
    pub rescan_interval_ms: Option<u64>,
    /// Quiet period before a burst of notifications for a path is emitted.
    pub debounce_window_ms: u64,
    /// Lowercase extensions (without dot) accepted as candidates. Empty accepts all.
    pub extensions: Vec<String>,
    /// Buffered candidates between the watcher and intake.
    pub candidate_channel_capacity: usize,
    /// Upper bound on files being stabilized/hashed at once.
    pub max_concurrent_stabilizations: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            mode: WatchMode::Native,
            poll_interval_ms: 2_000,
            rescan_interval_ms: Some(60_000),
            debounce_window_ms: 250,
            extensions: vec!["pdf".to_string()],
            candidate_channel_capacity: 256,
            max_concurrent_stabilizations: 64,
        }
    }
}

impl WatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rescan_interval(&self) -> Option<Duration> {
        self.rescan_interval_ms.map(Duration::from_millis)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    fn validate(&self) -> Result<()> {
        check_range("watch.poll_interval_ms", self.poll_interval_ms, 10..=ONE_HOUR_MS)?;
        check_range("watch.debounce_window_ms", self.debounce_window_ms, 0..=60_000)?;
        if let Some(rescan) = self.rescan_interval_ms {
            check_range("watch.rescan_interval_ms", rescan, 10..=ONE_HOUR_MS * 24)?;
        }
        check_range(
            "watch.candidate_channel_capacity",
            self.candidate_channel_capacity,
            1..=100_000,
        )?;
        check_range(
            "watch.max_concurrent_stabilizations",
            self.max_concurrent_stabilizations,
            1..=10_000,
        )
    }
}

/// What happens to a file whose size never settled before the timeout.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Forward the file anyway; the job is flagged `stabilized_by_timeout`.
    #[default]
    Proceed,
    /// Record a `SkippedTimeout` outcome and move the file to `error/`.
    Skip,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizationConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub required_stable_reads: u32,
    pub on_timeout: TimeoutPolicy,
}

impl Default for StabilizationConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            timeout_ms: 60_000,
            required_stable_reads: 2,
            on_timeout: TimeoutPolicy::Proceed,
        }
    }
}

impl StabilizationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        check_range("stabilization.interval_ms", self.interval_ms, 10..=60_000)?;
        check_range(
            "stabilization.timeout_ms",
            self.timeout_ms,
            self.interval_ms..=ONE_HOUR_MS,
        )?;
        check_range(
            "stabilization.required_stable_reads",
            self.required_stable_reads,
            1..=100,
        )
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queued (not yet claimed) jobs.
    pub capacity: usize,
    /// How long an admitted job may wait for a free slot. `None` waits until
    /// shutdown.
    pub enqueue_timeout_ms: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            enqueue_timeout_ms: Some(5 * 60 * 1_000),
        }
    }
}

impl QueueConfig {
    pub fn enqueue_timeout(&self) -> Option<Duration> {
        self.enqueue_timeout_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<()> {
        check_range("queue.capacity", self.capacity, 1..=100_000)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub count: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { count: 4 }
    }
}

impl WorkerConfig {
    fn validate(&self) -> Result<()> {
        check_range("workers.count", self.count, 1..=256)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// A single service call that takes longer than this is retried.
    pub call_timeout_ms: u64,
    /// Hard budget per document across every attempt and backoff.
    pub document_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 2 * 60 * 1_000,
            document_timeout_ms: 10 * 60 * 1_000,
        }
    }
}

impl ClientConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn document_timeout(&self) -> Duration {
        Duration::from_millis(self.document_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        check_range("client.call_timeout_ms", self.call_timeout_ms, 1..=ONE_HOUR_MS)?;
        check_range(
            "client.document_timeout_ms",
            self.document_timeout_ms,
            self.call_timeout_ms..=ONE_HOUR_MS * 24,
        )
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per document, the first call included.
    pub max_retries: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
    /// Minimum jitter in milliseconds so tiny delays still randomise a bit.
    pub jitter_min_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            jitter_ratio: 0.25,
            jitter_min_ms: 50,
        }
    }
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    fn validate(&self) -> Result<()> {
        check_range("retry.max_retries", self.max_retries, 1..=50)?;
        check_range(
            "retry.backoff_base_ms",
            self.backoff_base_ms,
            0..=self.backoff_max_ms,
        )?;
        check_range("retry.jitter_ratio", self.jitter_ratio, 0.0..=1.0)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    /// Tokens available after an idle period.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst: 5,
        }
    }
}

impl RateLimitConfig {
    fn validate(&self) -> Result<()> {
        check_range(
            "rate_limit.requests_per_minute",
            self.requests_per_minute,
            1..=100_000,
        )?;
        check_range("rate_limit.burst", self.burst, 1..=100_000)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Window in which queued and in-flight jobs may finish after a
    /// termination signal.
    pub grace_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_ms: 30_000 }
    }
}

impl ShutdownConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    fn validate(&self) -> Result<()> {
        check_range("shutdown.grace_ms", self.grace_ms, 0..=ONE_HOUR_MS)
    }
}

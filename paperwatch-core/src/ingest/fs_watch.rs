//! Inbox watcher.
//!
//! Native notifications from `notify` are debounced per path and flushed as
//! candidates once a path has been quiet for the debounce window. A periodic
//! rescan backs up the native stream, and a plain polling loop takes over when
//! native watching is unavailable or poll mode is configured. Every candidate
//! is claimed in [`ActivePaths`] before it is emitted, so a file already in the
//! pipeline is never emitted twice.

use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::ownership::ActivePaths;
use crate::error::{PipelineError, Result};
use crate::orchestration::config::{WatchConfig, WatchMode};
use crate::orchestration::events::{PipelineEvent, PipelineEvents};
use crate::orchestration::job::FileEvent;
use crate::orchestration::stats::PipelineStats;

#[cfg(feature = "native-watch")]
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

#[derive(Debug)]
pub struct FileWatcher {
    inbox: PathBuf,
    config: WatchConfig,
    active: ActivePaths,
    stats: PipelineStats,
    events: PipelineEvents,
}

/// Whether the watcher should keep going after handing off candidates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

impl FileWatcher {
    pub fn new(
        inbox: PathBuf,
        config: WatchConfig,
        active: ActivePaths,
        stats: PipelineStats,
        events: PipelineEvents,
    ) -> Self {
        Self {
            inbox,
            config,
            active,
            stats,
            events,
        }
    }

    /// Hidden files and files outside the extension allow-list are ignored.
    pub fn accepts(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            return false;
        };
        if name.starts_with('.') {
            return false;
        }
        if self.config.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                self.config
                    .extensions
                    .iter()
                    .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
            })
    }

    /// Watch the inbox until `cancel` fires or the candidate receiver is
    /// dropped. Only an unreadable inbox at startup is an error.
    pub async fn run(mut self, tx: mpsc::Sender<FileEvent>, cancel: CancellationToken) -> Result<()> {
        self.inbox = tokio::fs::canonicalize(&self.inbox)
            .await
            .map_err(|err| PipelineError::path_io(&self.inbox, err))?;

        info!(
            target: "paperwatch::watch",
            inbox = %self.inbox.display(),
            mode = ?self.config.mode,
            "watching inbox"
        );

        if self.sweep(&tx, &cancel).await? == Flow::Stop {
            return Ok(());
        }

        if self.config.mode == WatchMode::Native && self.watch_native(&tx, &cancel).await == Flow::Stop {
            return Ok(());
        }

        self.poll_loop(&tx, &cancel).await;
        debug!(target: "paperwatch::watch", "watcher stopped");
        Ok(())
    }

    /// Run on native notifications. Returns [`Flow::Continue`] when the caller
    /// should fall back to polling.
    #[cfg(feature = "native-watch")]
    async fn watch_native(&self, tx: &mpsc::Sender<FileEvent>, cancel: &CancellationToken) -> Flow {
        match self.start_native().await {
            Ok((watcher, rx)) => {
                let flow = self.native_loop(watcher, rx, tx, cancel).await;
                if flow == Flow::Continue {
                    warn!(
                        target: "paperwatch::watch",
                        "native watcher stream ended; falling back to polling"
                    );
                }
                flow
            }
            Err(err) => {
                warn!(
                    target: "paperwatch::watch",
                    error = %err,
                    "native watcher unavailable; falling back to polling"
                );
                Flow::Continue
            }
        }
    }

    #[cfg(not(feature = "native-watch"))]
    async fn watch_native(&self, _tx: &mpsc::Sender<FileEvent>, _cancel: &CancellationToken) -> Flow {
        warn!(
            target: "paperwatch::watch",
            "built without native watching; falling back to polling"
        );
        Flow::Continue
    }

    async fn poll_loop(&self, tx: &mpsc::Sender<FileEvent>, cancel: &CancellationToken) {
        let mut ticker = ticker(self.config.poll_interval());
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match self.sweep(tx, cancel).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => return,
                Err(err) => warn!(target: "paperwatch::watch", error = %err, "inbox scan failed"),
            }
        }
    }

    /// Emit every eligible file currently in the inbox, in name order.
    async fn sweep(&self, tx: &mpsc::Sender<FileEvent>, cancel: &CancellationToken) -> Result<Flow> {
        let mut entries = tokio::fs::read_dir(&self.inbox)
            .await
            .map_err(|err| PipelineError::path_io(&self.inbox, err))?;

        let mut paths = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => paths.push(entry.path()),
                Ok(None) => break,
                Err(err) => {
                    warn!(target: "paperwatch::watch", error = %err, "inbox listing interrupted");
                    break;
                }
            }
        }
        paths.sort();

        for path in paths {
            if self.emit(path, tx, cancel).await == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    async fn emit(&self, path: PathBuf, tx: &mpsc::Sender<FileEvent>, cancel: &CancellationToken) -> Flow {
        if cancel.is_cancelled() {
            return Flow::Stop;
        }
        if !self.accepts(&path) || self.active.contains(&path) {
            return Flow::Continue;
        }

        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return Flow::Continue,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                trace!(target: "paperwatch::watch", path = %path.display(), "path vanished before emit");
                return Flow::Continue;
            }
            Err(err) => {
                warn!(
                    target: "paperwatch::watch",
                    path = %path.display(),
                    error = %err,
                    "inaccessible file dropped"
                );
                self.stats.record_dropped();
                return Flow::Continue;
            }
        };

        if !self.active.claim(&path) {
            return Flow::Continue;
        }

        debug!(target: "paperwatch::watch", path = %path.display(), size, "candidate detected");
        self.stats.record_detected();
        self.events.publish(PipelineEvent::Detected { path: path.clone() });

        let event = FileEvent::new(path.clone(), Some(size));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.active.release(&path);
                Flow::Stop
            }
            sent = tx.send(event) => match sent {
                Ok(()) => Flow::Continue,
                Err(_) => {
                    self.active.release(&path);
                    Flow::Stop
                }
            },
        }
    }

    #[cfg(feature = "native-watch")]
    async fn start_native(&self) -> Result<(RecommendedWatcher, mpsc::Receiver<WatchMessage>)> {
        let (tx, rx) = mpsc::channel(self.config.candidate_channel_capacity.max(64));
        let inbox = self.inbox.clone();
        let watcher = tokio::task::spawn_blocking(move || init_watcher(&inbox, tx))
            .await
            .map_err(|err| PipelineError::Watcher(format!("watcher initialization panicked: {err}")))??;
        Ok((watcher, rx))
    }

    #[cfg(feature = "native-watch")]
    async fn native_loop(
        &self,
        _watcher: RecommendedWatcher,
        mut rx: mpsc::Receiver<WatchMessage>,
        tx: &mpsc::Sender<FileEvent>,
        cancel: &CancellationToken,
    ) -> Flow {
        let debounce = self.config.debounce_window();
        let mut pending: std::collections::BTreeSet<PathBuf> = std::collections::BTreeSet::new();
        let mut flush_at = Instant::now();
        let mut rescan = self.config.rescan_interval().map(ticker);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Flow::Stop,
                msg = rx.recv() => match msg {
                    Some(WatchMessage::Event(event)) => {
                        if is_arrival(&event.kind) {
                            pending.extend(event.paths);
                            flush_at = Instant::now() + debounce;
                        }
                    }
                    Some(WatchMessage::Error(error)) => {
                        warn!(target: "paperwatch::watch", %error, "watcher error; rescanning inbox");
                        if self.rescan(tx, cancel).await == Flow::Stop {
                            return Flow::Stop;
                        }
                    }
                    None => return Flow::Continue,
                },
                _ = tokio::time::sleep_until(flush_at), if !pending.is_empty() => {
                    for path in std::mem::take(&mut pending) {
                        if self.emit(path, tx, cancel).await == Flow::Stop {
                            return Flow::Stop;
                        }
                    }
                }
                _ = next_tick(&mut rescan) => {
                    if self.rescan(tx, cancel).await == Flow::Stop {
                        return Flow::Stop;
                    }
                }
            }
        }
    }

    #[cfg(feature = "native-watch")]
    async fn rescan(&self, tx: &mpsc::Sender<FileEvent>, cancel: &CancellationToken) -> Flow {
        match self.sweep(tx, cancel).await {
            Ok(flow) => flow,
            Err(err) => {
                warn!(target: "paperwatch::watch", error = %err, "inbox rescan failed");
                Flow::Continue
            }
        }
    }
}

fn ticker(period: std::time::Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[cfg(feature = "native-watch")]
async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(feature = "native-watch")]
enum WatchMessage {
    Event(Event),
    Error(String),
}

#[cfg(feature = "native-watch")]
fn is_arrival(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any)
}

#[cfg(feature = "native-watch")]
fn init_watcher(inbox: &Path, tx: mpsc::Sender<WatchMessage>) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| {
            let msg = match res {
                Ok(event) => WatchMessage::Event(event),
                Err(err) => WatchMessage::Error(err.to_string()),
            };
            // Receiver gone means the watch loop already exited.
            let _ = tx.blocking_send(msg);
        },
        NotifyConfig::default(),
    )
    .map_err(|err| {
        PipelineError::Watcher(format!(
            "failed to create watcher for {}: {err}",
            inbox.display()
        ))
    })?;

    watcher
        .watch(inbox, RecursiveMode::NonRecursive)
        .map_err(|err| PipelineError::Watcher(format!("failed to watch {}: {err}", inbox.display())))?;
    Ok(watcher)
}

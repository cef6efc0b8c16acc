#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use paperwatch_core::PipelineConfig;
use paperwatch_core::orchestration::config::WatchMode;
use paperwatch_core::orchestration::{
    ClassificationResult, ClassificationService, Document, PipelineEvent, ProcessingOutcome,
    ServiceError,
};
use serde_json::json;
use tokio::sync::broadcast;

/// Pipeline tuned for tests: polling, short stabilization, fast retries.
pub fn fast_config(inbox: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.layout.inbox = inbox.to_path_buf();
    config.watch.mode = WatchMode::Poll;
    config.watch.poll_interval_ms = 50;
    config.stabilization.interval_ms = 50;
    config.stabilization.timeout_ms = 2_000;
    config.stabilization.required_stable_reads = 2;
    config.workers.count = 3;
    config.retry.backoff_base_ms = 10;
    config.retry.backoff_max_ms = 100;
    config.retry.jitter_min_ms = 1;
    config.rate_limit.requests_per_minute = 6_000;
    config.rate_limit.burst = 50;
    config.shutdown.grace_ms = 2_000;
    config
}

/// Classification fake with a fixed latency. Files named in `hang_on` never
/// get an answer.
#[derive(Debug, Default)]
pub struct ScriptedService {
    latency: Duration,
    hang_on: HashSet<String>,
    started: AtomicUsize,
    finished: AtomicUsize,
    seen: Mutex<Vec<(String, usize)>>,
}

impl ScriptedService {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn hang_on(mut self, file_name: &str) -> Self {
        self.hang_on.insert(file_name.to_string());
        self
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    /// `(file_name, byte_len)` of every submitted document.
    pub fn seen(&self) -> Vec<(String, usize)> {
        self.seen.lock().unwrap().clone()
    }

    /// Wait until `count` calls are in progress or done.
    pub async fn wait_started(&self, count: usize, limit: Duration) {
        tokio::time::timeout(limit, async {
            while self.started() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("only {} of {count} calls started", self.started()));
    }
}

#[async_trait]
impl ClassificationService for ScriptedService {
    async fn submit(&self, document: &Document) -> Result<ClassificationResult, ServiceError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((document.file_name.clone(), document.len()));

        if self.hang_on.contains(&document.file_name) {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.latency).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(ClassificationResult(json!({
            "file": document.file_name,
            "bytes": document.len(),
        })))
    }
}

pub fn shared(service: ScriptedService) -> Arc<ScriptedService> {
    Arc::new(service)
}

/// Collect `count` outcome events, failing the test after `limit`.
pub async fn collect_outcomes(
    rx: &mut broadcast::Receiver<PipelineEvent>,
    count: usize,
    limit: Duration,
) -> Vec<ProcessingOutcome> {
    let mut outcomes = Vec::new();
    let result = tokio::time::timeout(limit, async {
        while outcomes.len() < count {
            match rx.recv().await {
                Ok(PipelineEvent::Outcome(outcome)) => outcomes.push(*outcome),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await;
    assert!(
        result.is_ok(),
        "timed out with {} of {count} outcomes",
        outcomes.len()
    );
    outcomes
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn dir_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| file_name(&entry.path()))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

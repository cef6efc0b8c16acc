use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
struct Counters {
    detected: AtomicU64,
    dropped: AtomicU64,
    stable: AtomicU64,
    stable_by_timeout: AtomicU64,
    abandoned: AtomicU64,
    admitted: AtomicU64,
    duplicates: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Monotonic pipeline counters, cheap to clone and share across tasks.
#[derive(Clone, Debug, Default)]
pub struct PipelineStats {
    counters: Arc<Counters>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub detected: u64,
    pub dropped: u64,
    pub stable: u64,
    pub stable_by_timeout: u64,
    pub abandoned: u64,
    pub admitted: u64,
    pub duplicates: u64,
    pub completed: u64,
    pub failed: u64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $name(&self) {
                self.counters.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl PipelineStats {
    counter! {
        record_detected => detected,
        record_dropped => dropped,
        record_stable => stable,
        record_stable_by_timeout => stable_by_timeout,
        record_abandoned => abandoned,
        record_admitted => admitted,
        record_duplicate => duplicates,
        record_completed => completed,
        record_failed => failed,
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = &self.counters;
        StatsSnapshot {
            detected: c.detected.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            stable: c.stable.load(Ordering::Relaxed),
            stable_by_timeout: c.stable_by_timeout.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
            admitted: c.admitted.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }
}

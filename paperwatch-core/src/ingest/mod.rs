//! Everything between a file landing in the inbox and its job being queued.

pub mod dedupe;
pub mod fs_watch;
pub mod intake;
pub mod ownership;
pub mod stabilize;

pub use dedupe::{Admission, Deduplicator, FingerprintEntry, FingerprintIndex, StoreFingerprintIndex};
pub use fs_watch::FileWatcher;
pub use intake::{CandidateFate, Intake};
pub use ownership::ActivePaths;
pub use stabilize::{StabilizationGate, StabilizationOutcome, StabilizationRecord};

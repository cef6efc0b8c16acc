use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error on {path}: {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Illegal job transition: {from:?} -> {to:?}")]
    IllegalTransition {
        from: crate::orchestration::job::JobState,
        to: crate::orchestration::job::JobState,
    },

    #[error("Watcher error: {0}")]
    Watcher(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn path_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::PathIo {
            path: path.into(),
            source,
        }
    }

    /// True when the underlying cause is a file that vanished between
    /// detection and read. Those candidates are dropped rather than retried.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Io(err) | Self::PathIo { source: err, .. } => {
                err.kind() == std::io::ErrorKind::NotFound
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

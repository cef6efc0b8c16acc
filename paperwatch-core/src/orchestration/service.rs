//! Boundary with the external document classification service.
//!
//! Whether a failure is worth retrying is decided here, once, by
//! [`ServiceError::is_retryable`]. Callers never inspect error strings.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bytes of a single inbox file, read once and shared across attempts.
#[derive(Clone)]
pub struct Document {
    pub file_name: String,
    pub bytes: Arc<[u8]>,
}

impl Document {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("file_name", &self.file_name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Structured result returned by the service. Opaque to the pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassificationResult(pub serde_json::Value);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("rate limited by service")]
    RateLimited { retry_after: Option<Duration> },

    #[error("service unavailable (status {status})")]
    Unavailable { status: u16 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("document rejected: {0}")]
    Rejected(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl ServiceError {
    /// Rate limits, server-side faults, transport hiccups and timeouts are
    /// retried. Anything describing the document itself is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::RateLimited { .. }
            | ServiceError::Unavailable { .. }
            | ServiceError::Transport(_)
            | ServiceError::Timeout(_) => true,
            ServiceError::Rejected(_) | ServiceError::MalformedResponse(_) => false,
        }
    }

    /// Minimum wait requested by the service before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ServiceError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// A network collaborator that turns document bytes into a structured result.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClassificationService: Send + Sync {
    async fn submit(
        &self,
        document: &Document,
    ) -> std::result::Result<ClassificationResult, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_closed() {
        assert!(ServiceError::RateLimited { retry_after: None }.is_retryable());
        assert!(ServiceError::Unavailable { status: 503 }.is_retryable());
        assert!(ServiceError::Transport("reset".into()).is_retryable());
        assert!(ServiceError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!ServiceError::Rejected("not a pdf".into()).is_retryable());
        assert!(!ServiceError::MalformedResponse("eof".into()).is_retryable());
    }

    #[test]
    fn retry_after_only_from_rate_limit() {
        let hint = Duration::from_secs(3);
        assert_eq!(
            ServiceError::RateLimited {
                retry_after: Some(hint)
            }
            .retry_after(),
            Some(hint)
        );
        assert_eq!(ServiceError::Unavailable { status: 502 }.retry_after(), None);
    }
}

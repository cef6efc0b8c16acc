//! Client the workers call. Each attempt takes a rate limiter token and runs
//! under the per-call timeout. The whole document also has a deadline.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::config::{ClientConfig, PipelineConfig};
use super::job::{FailureReason, Job};
use super::rate_limit::TokenBucket;
use super::retry::BackoffPolicy;
use super::service::{ClassificationResult, ClassificationService, Document, ServiceError};
use crate::types::JobId;

#[derive(Debug, Clone)]
pub struct ServiceSuccess {
    pub result: ClassificationResult,
    pub attempts: u16,
}

#[derive(Debug, Clone, Error)]
#[error("{reason} (after {attempts} attempt(s))")]
pub struct ServiceFailure {
    pub reason: FailureReason,
    pub attempts: u16,
}

impl ServiceFailure {
    fn new(reason: FailureReason, attempts: u16) -> Self {
        Self { reason, attempts }
    }
}

/// Wraps one logical classification call with rate limiting, per-call
/// timeouts, bounded retries and a hard per-document deadline.
#[derive(Clone)]
pub struct RetryingServiceClient {
    service: Arc<dyn ClassificationService>,
    limiter: Arc<TokenBucket>,
    backoff: BackoffPolicy,
    limits: ClientConfig,
}

impl fmt::Debug for RetryingServiceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryingServiceClient")
            .field("limiter", &self.limiter)
            .field("backoff", &self.backoff)
            .field("limits", &self.limits)
            .finish()
    }
}

impl RetryingServiceClient {
    pub fn new(
        service: Arc<dyn ClassificationService>,
        limiter: Arc<TokenBucket>,
        backoff: BackoffPolicy,
        limits: ClientConfig,
    ) -> Self {
        Self {
            service,
            limiter,
            backoff,
            limits,
        }
    }

    pub fn from_config(service: Arc<dyn ClassificationService>, config: &PipelineConfig) -> Self {
        Self::new(
            service,
            Arc::new(TokenBucket::new(config.rate_limit)),
            BackoffPolicy::new(config.retry),
            config.client,
        )
    }

    /// Read the job's file and classify it.
    pub async fn process(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<ServiceSuccess, ServiceFailure> {
        let bytes = tokio::fs::read(&job.path).await.map_err(|err| {
            ServiceFailure::new(
                FailureReason::Io(format!("{}: {err}", job.path.display())),
                0,
            )
        })?;
        let document = Document::new(job.file_name(), bytes);
        self.process_document(job.id, &document, cancel).await
    }

    /// Submit `document`, retrying retryable failures until the attempt
    /// budget runs out or `cancel` fires.
    pub async fn process_document(
        &self,
        job_id: JobId,
        document: &Document,
        cancel: &CancellationToken,
    ) -> Result<ServiceSuccess, ServiceFailure> {
        let deadline = Instant::now() + self.limits.document_timeout();
        let max_attempts = self.backoff.max_attempts();
        let mut attempts: u16 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ServiceFailure::new(FailureReason::Shutdown, attempts));
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ServiceFailure::new(FailureReason::Shutdown, attempts));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ServiceFailure::new(FailureReason::DeadlineExceeded, attempts));
                }
                acquired = self.limiter.acquire(cancel) => {
                    if !acquired {
                        return Err(ServiceFailure::new(FailureReason::Shutdown, attempts));
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ServiceFailure::new(FailureReason::DeadlineExceeded, attempts));
            }
            let call_budget = self.limits.call_timeout().min(remaining);
            let clipped_by_deadline = call_budget < self.limits.call_timeout();

            attempts += 1;
            debug!(
                target: "paperwatch::client",
                job = %job_id,
                attempt = attempts,
                bytes = document.len(),
                "submitting document"
            );

            let call = tokio::time::timeout(call_budget, self.service.submit(document));
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ServiceFailure::new(FailureReason::Shutdown, attempts));
                }
                response = call => response,
            };

            let error = match response {
                Ok(Ok(result)) => return Ok(ServiceSuccess { result, attempts }),
                Ok(Err(err)) => err,
                Err(_) if clipped_by_deadline => {
                    return Err(ServiceFailure::new(FailureReason::DeadlineExceeded, attempts));
                }
                Err(_) => ServiceError::Timeout(call_budget),
            };

            if !error.is_retryable() {
                warn!(
                    target: "paperwatch::client",
                    job = %job_id,
                    attempt = attempts,
                    error = %error,
                    "service rejected document"
                );
                return Err(ServiceFailure::new(
                    FailureReason::Rejected(error.to_string()),
                    attempts,
                ));
            }

            if attempts >= max_attempts {
                warn!(
                    target: "paperwatch::client",
                    job = %job_id,
                    attempts,
                    error = %error,
                    "retry budget exhausted"
                );
                return Err(ServiceFailure::new(
                    FailureReason::RetriesExhausted {
                        attempts,
                        last_error: error.to_string(),
                    },
                    attempts,
                ));
            }

            let delay = self.next_delay(attempts, &error);
            if Instant::now() + delay >= deadline {
                return Err(ServiceFailure::new(FailureReason::DeadlineExceeded, attempts));
            }

            warn!(
                target: "paperwatch::client",
                job = %job_id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retryable service error"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ServiceFailure::new(FailureReason::Shutdown, attempts));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn next_delay(&self, attempt: u16, error: &ServiceError) -> Duration {
        let backoff = self.backoff.delay_for(attempt, &mut rand::rng());
        match error.retry_after() {
            Some(hint) => backoff.max(hint),
            None => backoff,
        }
    }
}

//! HTTP adapter for the classification service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use tracing::trace;
use url::Url;

use super::service::{ClassificationResult, ClassificationService, Document, ServiceError};
use crate::error::{PipelineError, Result};

const DOCUMENT_NAME_HEADER: &str = "x-document-name";
const MAX_ERROR_BODY: usize = 512;

/// POSTs raw document bytes to a single endpoint and expects a JSON body
/// back. Timeouts are enforced by the retrying client, not here.
#[derive(Debug, Clone)]
pub struct HttpClassificationService {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Option<String>,
}

impl HttpClassificationService {
    pub fn new(endpoint: Url, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("paperwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| PipelineError::InvalidConfig(format!("http client: {err}")))?;
        Ok(Self {
            client,
            endpoint,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl ClassificationService for HttpClassificationService {
    async fn submit(
        &self,
        document: &Document,
    ) -> std::result::Result<ClassificationResult, ServiceError> {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(DOCUMENT_NAME_HEADER, header_safe(&document.file_name))
            .body(document.bytes.to_vec());
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        trace!(target: "paperwatch::client", %status, file = %document.file_name, "service responded");

        if status.is_success() {
            let body = response.bytes().await.map_err(transport_error)?;
            let value = serde_json::from_slice(&body)
                .map_err(|err| ServiceError::MalformedResponse(err.to_string()))?;
            return Ok(ClassificationResult(value));
        }

        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after, &body))
    }
}

/// Map a non-success status onto the retry classification.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ServiceError {
    match status.as_u16() {
        429 => ServiceError::RateLimited { retry_after },
        408 | 500..=599 => ServiceError::Unavailable {
            status: status.as_u16(),
        },
        code => {
            let mut detail: String = body.chars().take(MAX_ERROR_BODY).collect();
            if detail.trim().is_empty() {
                detail = status.canonical_reason().unwrap_or("unknown").to_string();
            }
            ServiceError::Rejected(format!("status {code}: {}", detail.trim()))
        }
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn transport_error(err: reqwest::Error) -> ServiceError {
    if err.is_builder() {
        ServiceError::Rejected(err.to_string())
    } else if err.is_decode() {
        ServiceError::MalformedResponse(err.to_string())
    } else {
        ServiceError::Transport(err.to_string())
    }
}

fn header_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .collect()
}

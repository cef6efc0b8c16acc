use std::path::PathBuf;

use paperwatch_core::PipelineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {var} ({value:?}): {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid URL in {var}")]
    InvalidUrl {
        var: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

impl ConfigLoadError {
    pub(crate) fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            var,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

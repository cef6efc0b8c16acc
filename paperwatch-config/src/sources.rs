use std::collections::HashMap;
use std::path::PathBuf;

use paperwatch_core::PipelineConfig;
use serde::{Deserialize, Serialize};

/// Raw configuration as defined in a TOML file.
///
/// Pipeline sections (`[layout]`, `[watch]`, `[stabilization]`, ...) sit at the
/// top level next to the daemon-only `[classifier]` and `[state]` tables.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(flatten)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub classifier: FileClassifierConfig,
    #[serde(default)]
    pub state: FileStateConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileClassifierConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileStateConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

/// Raw environment overrides. Values are kept as strings and parsed while
/// the settings are composed so a malformed value is reported, not ignored.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub inbox: Option<String>,
    pub output_root: Option<String>,
    pub extensions: Option<String>,
    pub watch_mode: Option<String>,
    pub poll_interval: Option<String>,
    pub debounce: Option<String>,
    pub stabilization_interval: Option<String>,
    pub stabilization_timeout: Option<String>,
    pub stabilization_required_stable_reads: Option<String>,
    pub stabilization_on_timeout: Option<String>,
    pub queue_capacity: Option<String>,
    pub queue_enqueue_timeout: Option<String>,
    pub worker_count: Option<String>,
    pub document_timeout: Option<String>,
    pub call_timeout: Option<String>,
    pub max_retries: Option<String>,
    pub retry_backoff_base: Option<String>,
    pub retry_backoff_max: Option<String>,
    pub rate_limit_per_minute: Option<String>,
    pub rate_limit_burst: Option<String>,
    pub shutdown_grace: Option<String>,
    pub classifier_url: Option<String>,
    pub classifier_api_key: Option<String>,
    pub state_dir: Option<String>,
}

impl EnvConfig {
    /// Read overrides from the process environment.
    pub fn gather() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read overrides from an explicit set of pairs.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let vars: HashMap<&str, &str> = pairs.into_iter().collect();
        Self::from_lookup(|name| vars.get(name).map(|value| value.to_string()))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        Self {
            config_path: var("PAPERWATCH_CONFIG").map(PathBuf::from),
            inbox: var("PAPERWATCH_INBOX"),
            output_root: var("PAPERWATCH_OUTPUT_ROOT"),
            extensions: lookup("PAPERWATCH_EXTENSIONS"),
            watch_mode: var("PAPERWATCH_WATCH_MODE"),
            poll_interval: var("PAPERWATCH_POLL_INTERVAL"),
            debounce: var("PAPERWATCH_DEBOUNCE"),
            stabilization_interval: var("STABILIZATION_INTERVAL"),
            stabilization_timeout: var("STABILIZATION_TIMEOUT"),
            stabilization_required_stable_reads: var("STABILIZATION_REQUIRED_STABLE_READS"),
            stabilization_on_timeout: var("STABILIZATION_ON_TIMEOUT"),
            queue_capacity: var("QUEUE_CAPACITY"),
            queue_enqueue_timeout: var("QUEUE_ENQUEUE_TIMEOUT"),
            worker_count: var("WORKER_COUNT"),
            document_timeout: var("DOCUMENT_TIMEOUT"),
            call_timeout: var("CALL_TIMEOUT"),
            max_retries: var("MAX_RETRIES"),
            retry_backoff_base: var("RETRY_BACKOFF_BASE"),
            retry_backoff_max: var("RETRY_BACKOFF_MAX"),
            rate_limit_per_minute: var("RATE_LIMIT_PER_MINUTE"),
            rate_limit_burst: var("RATE_LIMIT_BURST"),
            shutdown_grace: var("SHUTDOWN_GRACE"),
            classifier_url: var("CLASSIFIER_URL"),
            classifier_api_key: var("CLASSIFIER_API_KEY"),
            state_dir: var("PAPERWATCH_STATE_DIR"),
        }
    }
}

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use paperwatch_core::PipelineConfig;
use paperwatch_core::orchestration::config::{TimeoutPolicy, WatchMode};
use tracing::{debug, info};
use url::Url;

use crate::error::ConfigLoadError;
use crate::models::{Settings, SettingsMetadata};
use crate::sources::{EnvConfig, FileConfig};
use crate::util::{parse_csv, parse_duration_ms, parse_optional_duration_ms};

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] = ["paperwatch.toml", "config/paperwatch.toml"];

#[derive(Debug, Default, Clone)]
pub struct SettingsLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Takes precedence over both the file and `PAPERWATCH_INBOX`.
    pub inbox: Option<PathBuf>,
}

/// Builds [`Settings`] from defaults, an optional TOML file and the
/// environment, in that order of increasing precedence.
#[derive(Debug, Default)]
pub struct SettingsLoader {
    options: SettingsLoaderOptions,
}

impl SettingsLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: SettingsLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn with_inbox<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.inbox = Some(path.into());
        self
    }

    /// Load `.env` into the process environment, then resolve settings from
    /// it. A missing `.env` is not an error.
    pub fn load(&self) -> Result<Settings, ConfigLoadError> {
        let loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| ()),
            None => dotenvy::dotenv().map(|_| ()),
        };
        let env_file_loaded = match loaded {
            Ok(()) => true,
            Err(dotenvy::Error::Io(_)) => false,
            Err(err) => return Err(err.into()),
        };

        let mut settings = self.load_from(EnvConfig::gather())?;
        settings.metadata.env_file_loaded = env_file_loaded;
        Ok(settings)
    }

    /// Resolve settings from an already gathered environment. Does not touch
    /// the process environment.
    pub fn load_from(&self, env: EnvConfig) -> Result<Settings, ConfigLoadError> {
        let (file, config_path) = self.load_file_config(&env)?;
        let settings = self.compose(file.unwrap_or_default(), env, config_path)?;
        settings.pipeline.validate()?;

        info!(
            target: "paperwatch::config",
            config = ?settings.metadata.config_path,
            inbox = %settings.pipeline.layout.inbox.display(),
            workers = settings.pipeline.workers.count,
            "configuration loaded"
        );
        Ok(settings)
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let (path, explicit) = match (&self.options.config_path, &env.config_path) {
            (Some(path), _) | (None, Some(path)) => (path.clone(), true),
            (None, None) => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists())
            {
                Some(path) => (path, false),
                None => {
                    debug!(target: "paperwatch::config", "no config file found; using defaults");
                    return Ok((None, None));
                }
            },
        };

        if explicit && !path.exists() {
            return Err(ConfigLoadError::MissingConfig { path });
        }
        let file = read_file_config(&path)?;
        Ok((Some(file), Some(path)))
    }

    fn compose(
        &self,
        file: FileConfig,
        env: EnvConfig,
        config_path: Option<PathBuf>,
    ) -> Result<Settings, ConfigLoadError> {
        let FileConfig {
            pipeline: mut config,
            classifier,
            state,
        } = file;

        apply_env(&mut config, &env)?;
        if let Some(inbox) = &self.options.inbox {
            config.layout.inbox = inbox.clone();
        }

        let classifier_url = env
            .classifier_url
            .map(|raw| ("CLASSIFIER_URL", raw))
            .or_else(|| classifier.url.map(|raw| ("classifier.url", raw)))
            .map(|(var, raw)| {
                Url::parse(raw.trim()).map_err(|source| ConfigLoadError::InvalidUrl { var, source })
            })
            .transpose()?;

        Ok(Settings {
            pipeline: config,
            classifier_url,
            classifier_api_key: env.classifier_api_key.or(classifier.api_key),
            state_dir: env.state_dir.map(PathBuf::from).or(state.dir),
            metadata: SettingsMetadata {
                config_path,
                env_file_loaded: false,
            },
        })
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn apply_env(config: &mut PipelineConfig, env: &EnvConfig) -> Result<(), ConfigLoadError> {
    if let Some(raw) = &env.inbox {
        config.layout.inbox = PathBuf::from(raw);
    }
    if let Some(raw) = &env.output_root {
        config.layout.output_root = Some(PathBuf::from(raw));
    }
    // An empty list accepts every extension.
    if let Some(raw) = &env.extensions {
        config.watch.extensions = parse_csv(raw)
            .into_iter()
            .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
            .collect();
    }
    if let Some(raw) = &env.watch_mode {
        config.watch.mode = parse_watch_mode(raw)?;
    }
    set_duration(&mut config.watch.poll_interval_ms, "PAPERWATCH_POLL_INTERVAL", &env.poll_interval)?;
    set_duration(&mut config.watch.debounce_window_ms, "PAPERWATCH_DEBOUNCE", &env.debounce)?;

    let stabilization = &mut config.stabilization;
    set_duration(&mut stabilization.interval_ms, "STABILIZATION_INTERVAL", &env.stabilization_interval)?;
    set_duration(&mut stabilization.timeout_ms, "STABILIZATION_TIMEOUT", &env.stabilization_timeout)?;
    set_number(
        &mut stabilization.required_stable_reads,
        "STABILIZATION_REQUIRED_STABLE_READS",
        &env.stabilization_required_stable_reads,
    )?;
    if let Some(raw) = &env.stabilization_on_timeout {
        stabilization.on_timeout = parse_timeout_policy(raw)?;
    }

    set_number(&mut config.queue.capacity, "QUEUE_CAPACITY", &env.queue_capacity)?;
    if let Some(raw) = &env.queue_enqueue_timeout {
        config.queue.enqueue_timeout_ms = parse_optional_duration_ms(raw)
            .map_err(|reason| ConfigLoadError::invalid("QUEUE_ENQUEUE_TIMEOUT", raw, reason))?;
    }
    set_number(&mut config.workers.count, "WORKER_COUNT", &env.worker_count)?;

    set_duration(&mut config.client.document_timeout_ms, "DOCUMENT_TIMEOUT", &env.document_timeout)?;
    set_duration(&mut config.client.call_timeout_ms, "CALL_TIMEOUT", &env.call_timeout)?;

    set_number(&mut config.retry.max_retries, "MAX_RETRIES", &env.max_retries)?;
    set_duration(&mut config.retry.backoff_base_ms, "RETRY_BACKOFF_BASE", &env.retry_backoff_base)?;
    set_duration(&mut config.retry.backoff_max_ms, "RETRY_BACKOFF_MAX", &env.retry_backoff_max)?;

    set_number(
        &mut config.rate_limit.requests_per_minute,
        "RATE_LIMIT_PER_MINUTE",
        &env.rate_limit_per_minute,
    )?;
    set_number(&mut config.rate_limit.burst, "RATE_LIMIT_BURST", &env.rate_limit_burst)?;

    set_duration(&mut config.shutdown.grace_ms, "SHUTDOWN_GRACE", &env.shutdown_grace)?;
    Ok(())
}

fn set_duration(
    target: &mut u64,
    var: &'static str,
    raw: &Option<String>,
) -> Result<(), ConfigLoadError> {
    if let Some(raw) = raw {
        *target = parse_duration_ms(raw).map_err(|reason| ConfigLoadError::invalid(var, raw, reason))?;
    }
    Ok(())
}

fn set_number<T>(target: &mut T, var: &'static str, raw: &Option<String>) -> Result<(), ConfigLoadError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = raw {
        *target = raw
            .trim()
            .parse()
            .map_err(|err: T::Err| ConfigLoadError::invalid(var, raw, err.to_string()))?;
    }
    Ok(())
}

fn parse_watch_mode(raw: &str) -> Result<WatchMode, ConfigLoadError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "native" => Ok(WatchMode::Native),
        "poll" | "polling" => Ok(WatchMode::Poll),
        _ => Err(ConfigLoadError::invalid(
            "PAPERWATCH_WATCH_MODE",
            raw,
            "expected `native` or `poll`",
        )),
    }
}

fn parse_timeout_policy(raw: &str) -> Result<TimeoutPolicy, ConfigLoadError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "proceed" => Ok(TimeoutPolicy::Proceed),
        "skip" => Ok(TimeoutPolicy::Skip),
        _ => Err(ConfigLoadError::invalid(
            "STABILIZATION_ON_TIMEOUT",
            raw,
            "expected `proceed` or `skip`",
        )),
    }
}

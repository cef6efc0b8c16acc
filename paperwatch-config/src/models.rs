use std::path::PathBuf;

use paperwatch_core::PipelineConfig;
use url::Url;

use crate::error::ConfigLoadError;

/// Directory name for the JSONL store when no state dir is configured.
pub const DEFAULT_STATE_DIR_NAME: &str = ".paperwatch";

/// Fully resolved daemon settings.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub pipeline: PipelineConfig,
    pub classifier_url: Option<Url>,
    pub classifier_api_key: Option<String>,
    /// Explicit JSONL store location. See [`Settings::state_dir`].
    pub state_dir: Option<PathBuf>,
    pub metadata: SettingsMetadata,
}

/// Where the settings came from.
#[derive(Debug, Clone, Default)]
pub struct SettingsMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

impl Settings {
    /// JSONL store location, `<output_root>/.paperwatch` unless overridden.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            self.pipeline
                .layout
                .output_root()
                .join(DEFAULT_STATE_DIR_NAME)
        })
    }

    /// The daemon cannot run without a classification endpoint.
    pub fn require_classifier_url(&self) -> Result<&Url, ConfigLoadError> {
        self.classifier_url
            .as_ref()
            .ok_or_else(|| ConfigLoadError::invalid("CLASSIFIER_URL", "", "must be set"))
    }
}

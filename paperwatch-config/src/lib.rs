//! Configuration loading for paperwatch.
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! environment variables (optionally seeded from a `.env` file). The result is
//! validated before it is handed to the pipeline.

pub mod error;
pub mod loader;
pub mod models;
pub mod sources;
pub mod util;

pub use error::ConfigLoadError;
pub use loader::{SettingsLoader, SettingsLoaderOptions};
pub use models::{Settings, SettingsMetadata};
pub use sources::{EnvConfig, FileConfig};

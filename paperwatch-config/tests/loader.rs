use std::path::PathBuf;

use paperwatch_config::{ConfigLoadError, EnvConfig, SettingsLoader};
use paperwatch_core::orchestration::config::{TimeoutPolicy, WatchMode};
use tempfile::tempdir;

const SAMPLE: &str = r#"
[layout]
inbox = "/srv/scans/inbox"

[watch]
mode = "poll"
extensions = ["pdf", "tiff"]

[queue]
capacity = 16

[workers]
count = 2

[classifier]
url = "https://classifier.internal/v1/documents"
api_key = "from-file"
"#;

fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("paperwatch.toml");
    std::fs::write(&path, contents).unwrap();
    (dir, path)
}

#[test]
fn defaults_apply_without_file_or_env() {
    let settings = SettingsLoader::new()
        .load_from(EnvConfig::default())
        .unwrap();

    assert_eq!(settings.pipeline.layout.inbox, PathBuf::from("inbox"));
    assert_eq!(settings.pipeline.watch.mode, WatchMode::Native);
    assert_eq!(settings.pipeline.queue.capacity, 64);
    assert!(settings.classifier_url.is_none());
    assert!(settings.metadata.config_path.is_none());
    assert_eq!(settings.state_dir(), PathBuf::from("./.paperwatch"));
    assert!(settings.require_classifier_url().is_err());
}

#[test]
fn file_values_fill_pipeline_sections() {
    let (_dir, path) = write_config(SAMPLE);
    let settings = SettingsLoader::new()
        .with_config_path(&path)
        .load_from(EnvConfig::default())
        .unwrap();

    let pipeline = &settings.pipeline;
    assert_eq!(pipeline.layout.inbox, PathBuf::from("/srv/scans/inbox"));
    assert_eq!(pipeline.watch.mode, WatchMode::Poll);
    assert_eq!(pipeline.watch.extensions, vec!["pdf", "tiff"]);
    assert_eq!(pipeline.queue.capacity, 16);
    assert_eq!(pipeline.workers.count, 2);
    // Untouched sections keep their defaults.
    assert_eq!(pipeline.retry.max_retries, 5);
    assert_eq!(
        settings.require_classifier_url().unwrap().as_str(),
        "https://classifier.internal/v1/documents"
    );
    assert_eq!(settings.classifier_api_key.as_deref(), Some("from-file"));
    assert_eq!(settings.metadata.config_path, Some(path));
    assert_eq!(
        settings.state_dir(),
        PathBuf::from("/srv/scans/.paperwatch")
    );
}

#[test]
fn environment_overrides_file() {
    let (_dir, path) = write_config(SAMPLE);
    let env = EnvConfig::from_pairs([
        ("PAPERWATCH_EXTENSIONS", ".PDF, jpg"),
        ("WORKER_COUNT", "8"),
        ("STABILIZATION_INTERVAL", "250ms"),
        ("STABILIZATION_TIMEOUT", "2min"),
        ("STABILIZATION_ON_TIMEOUT", "skip"),
        ("QUEUE_ENQUEUE_TIMEOUT", "none"),
        ("SHUTDOWN_GRACE", "5s"),
        ("CLASSIFIER_API_KEY", "from-env"),
        ("PAPERWATCH_STATE_DIR", "/var/lib/paperwatch"),
    ]);
    let settings = SettingsLoader::new()
        .with_config_path(&path)
        .load_from(env)
        .unwrap();

    let pipeline = &settings.pipeline;
    assert_eq!(pipeline.watch.extensions, vec!["pdf", "jpg"]);
    assert_eq!(pipeline.workers.count, 8);
    assert_eq!(pipeline.stabilization.interval_ms, 250);
    assert_eq!(pipeline.stabilization.timeout_ms, 120_000);
    assert_eq!(pipeline.stabilization.on_timeout, TimeoutPolicy::Skip);
    assert_eq!(pipeline.queue.enqueue_timeout_ms, None);
    assert_eq!(pipeline.shutdown.grace_ms, 5_000);
    assert_eq!(settings.classifier_api_key.as_deref(), Some("from-env"));
    assert_eq!(settings.state_dir(), PathBuf::from("/var/lib/paperwatch"));
}

#[test]
fn explicit_inbox_wins_over_environment() {
    let env = EnvConfig::from_pairs([("PAPERWATCH_INBOX", "/from/env")]);
    let settings = SettingsLoader::new()
        .with_inbox("/from/cli")
        .load_from(env)
        .unwrap();
    assert_eq!(settings.pipeline.layout.inbox, PathBuf::from("/from/cli"));
}

#[test]
fn config_path_can_come_from_environment() {
    let (_dir, path) = write_config("[workers]\ncount = 3\n");
    let raw = path.to_string_lossy().into_owned();
    let env = EnvConfig::from_pairs([("PAPERWATCH_CONFIG", raw.as_str())]);
    let settings = SettingsLoader::new().load_from(env).unwrap();
    assert_eq!(settings.pipeline.workers.count, 3);
}

#[test]
fn missing_explicit_file_is_an_error() {
    let dir = tempdir().unwrap();
    let err = SettingsLoader::new()
        .with_config_path(dir.path().join("absent.toml"))
        .load_from(EnvConfig::default())
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
}

#[test]
fn malformed_file_reports_parse_error() {
    let (_dir, path) = write_config("[queue\ncapacity = 1");
    let err = SettingsLoader::new()
        .with_config_path(&path)
        .load_from(EnvConfig::default())
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::Parse { .. }));
}

#[test]
fn malformed_env_values_are_reported() {
    let err = SettingsLoader::new()
        .load_from(EnvConfig::from_pairs([("SHUTDOWN_GRACE", "soon")]))
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigLoadError::InvalidValue {
            var: "SHUTDOWN_GRACE",
            ..
        }
    ));

    let err = SettingsLoader::new()
        .load_from(EnvConfig::from_pairs([("CLASSIFIER_URL", "not a url")]))
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::InvalidUrl { .. }));
}

#[test]
fn out_of_range_values_fail_validation() {
    let err = SettingsLoader::new()
        .load_from(EnvConfig::from_pairs([("WORKER_COUNT", "0")]))
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::Pipeline(_)));
    assert!(err.to_string().contains("workers.count"));
}

#[test]
fn env_file_values_are_loaded() {
    let dir = tempdir().unwrap();
    let env_file = dir.path().join("paperwatch.env");
    std::fs::write(&env_file, "PAPERWATCH_TEST_ONLY_MARKER=loaded\n").unwrap();

    let settings = SettingsLoader::new().with_env_file(&env_file).load().unwrap();
    assert!(settings.metadata.env_file_loaded);
    assert_eq!(
        std::env::var("PAPERWATCH_TEST_ONLY_MARKER").as_deref(),
        Ok("loaded")
    );
}

//! # paperwatchd
//!
//! Watches a scanner inbox, waits for each file to finish writing, drops
//! duplicate content and forwards the rest to the classification service.
//! Relocated files end up in `processed/`, `duplicates/` or `error/` next to
//! the inbox.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use paperwatch_config::{Settings, SettingsLoader, SettingsLoaderOptions};
use paperwatch_core::PipelineRuntime;
use paperwatch_core::orchestration::HttpClassificationService;
use paperwatch_core::persistence::JsonlStore;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "paperwatchd")]
#[command(about = "Watch a scanner inbox and submit finished documents for classification")]
struct Cli {
    /// Path to a TOML configuration file (defaults to ./paperwatch.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to a .env file loaded before environment overrides
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Inbox directory (overrides config and PAPERWATCH_INBOX)
    #[arg(long)]
    inbox: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = SettingsLoader::with_options(SettingsLoaderOptions {
        config_path: cli.config,
        env_file: cli.env_file,
        inbox: cli.inbox,
    })
    .load()
    .context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,paperwatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if settings.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &settings.metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }

    run(settings).await
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let endpoint = settings
        .require_classifier_url()
        .context("a classification endpoint is required")?
        .clone();
    let state_dir = settings.state_dir();

    let store = JsonlStore::open(&state_dir)
        .await
        .with_context(|| format!("failed to open state store at {}", state_dir.display()))?;
    info!(
        path = %state_dir.display(),
        fingerprints = store.fingerprint_count().await,
        "state store opened"
    );

    let service = HttpClassificationService::new(endpoint, settings.classifier_api_key.clone())
        .context("failed to build classification client")?;
    info!(endpoint = %service.endpoint(), "classification service configured");

    let mut runtime = PipelineRuntime::new(settings.pipeline, Arc::new(store), Arc::new(service))
        .context("invalid pipeline configuration")?;
    let mut events = runtime.event_stream();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if let Ok(line) = serde_json::to_string(&event) {
                debug!(target: "paperwatch::events", "{line}");
            }
        }
    });
    runtime.start().await.context("failed to start pipeline")?;

    let stop = CancellationToken::new();
    tokio::spawn(forward_signals(stop.clone()));
    stop.cancelled().await;

    let report = runtime.shutdown().await;
    let stats = runtime.stats();
    if report.forced {
        warn!(
            elapsed_ms = report.elapsed.as_millis() as u64,
            "grace period expired; in-flight jobs were cancelled"
        );
    }
    info!(
        elapsed_ms = report.elapsed.as_millis() as u64,
        forced = report.forced,
        stats = %serde_json::to_string(&stats).unwrap_or_default(),
        "paperwatchd stopped"
    );
    Ok(())
}

/// Cancel `token` on the first SIGINT/SIGTERM (Ctrl+C elsewhere).
async fn forward_signals(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};

        let (mut sigterm, mut sigint) = match (
            unix_signal(SignalKind::terminate()),
            unix_signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(err), _) | (_, Err(err)) => {
                warn!(error = %err, "failed to install unix signal handlers; using ctrl-c only");
                if signal::ctrl_c().await.is_ok() {
                    info!("received ctrl-c, shutting down");
                }
                token.cancel();
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
        } else {
            info!("received ctrl-c, shutting down");
        }
    }

    token.cancel();
}

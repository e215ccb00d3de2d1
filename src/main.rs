//! relaydesk server binary: loads settings, opens the store, and serves the
//! HTTP/WebSocket gateway until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relaydesk_server::config::{load_settings_from_path, settings_path};
use relaydesk_server::{AppState, CannedAssistant};
use relaydesk_store::Database;
use relaydesk_telemetry::{init_telemetry, TelemetryConfig};

/// Chat session and handoff server.
#[derive(Parser, Debug)]
#[command(name = "relaydesk", about = "Chat session and handoff server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the SQLite database (overrides settings).
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Settings file. Defaults to `~/.relaydesk/settings.json`.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Human-readable logs instead of JSON lines.
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_file = cli.settings.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&settings_file)
        .with_context(|| format!("Failed to load settings from {}", settings_file.display()))?;
    if let Some(host) = cli.host {
        settings.host = host;
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }
    if let Some(db_path) = cli.db_path {
        settings.db_path = db_path;
    }

    let telemetry = init_telemetry(TelemetryConfig {
        json: !cli.pretty,
        log_to_sqlite: settings.log_to_sqlite,
        log_db_path: settings.log_db_path.clone(),
        ..Default::default()
    });

    tracing::info!(settings = %settings_file.display(), "starting relaydesk");

    let db = Database::open(&settings.db_path)
        .with_context(|| format!("Failed to open database: {}", settings.db_path.display()))?;

    let assistant = Arc::new(CannedAssistant::new(settings.assistant_fallback_reply.clone()));
    let state = AppState::new(db, settings, assistant, telemetry.metrics())
        .context("Failed to initialize server state")?;

    let handle = relaydesk_server::start(state)
        .await
        .context("Failed to start server")?;
    tracing::info!(port = handle.port, "relaydesk ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    handle.shutdown(None).await;
    Ok(())
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use courier_core::SystemClock;
use courier_engine::{transport_from_settings, CourierServices};
use courier_server::{ServerConfig, ShutdownCoordinator};
use courier_settings::{load_settings_from_path, settings_path};
use courier_store::Database;
use courier_telemetry::{init_telemetry, TelemetryConfig};

/// Compliance-window aware message delivery daemon.
#[derive(Debug, Parser)]
#[command(name = "courier", version, about)]
struct Cli {
    /// Settings file (defaults to ~/.courier/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the HTTP port from settings.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let path = cli.config.unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("loading settings from {}", path.display()))?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    init_telemetry(&TelemetryConfig::from_settings(&settings.logging));
    tracing::info!(settings = %path.display(), "starting courier");

    let db = Database::open(&settings.database.path).context("opening database")?;

    let transport = transport_from_settings(&settings.transport);
    tracing::info!(transport = transport.name(), "transport selected");

    let (services, renewals) =
        CourierServices::build(db, &settings, transport, Arc::new(SystemClock))?;

    let mut shutdown = ShutdownCoordinator::from_settings(&settings.server);
    let token = shutdown.token();
    shutdown.track_all(
        "reconciler",
        Arc::clone(&services.reconciler).spawn(Some(renewals), token.clone()),
    );

    let server = courier_server::start(ServerConfig::from_settings(&settings.server), services, token)
        .await
        .context("starting HTTP server")?;
    tracing::info!(port = server.port, "courier ready");
    shutdown.track("http", server.into_join_handle());

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;

    tracing::info!("shutting down");
    let report = shutdown.shutdown().await;
    if !report.is_clean() {
        tracing::warn!(
            panicked = ?report.panicked,
            aborted = ?report.aborted,
            "courier stopped with unfinished tasks"
        );
    }
    Ok(())
}

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use shutter_room::{
    build_router,
    principal::{AccountHeaderResolver, OpenResolver, PrincipalResolver},
    spawn_sweeper, AppState, Cli, RoomHub, ServerConfig,
};
use tokio::signal;
use tracing::info;

mod telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        participant_max = config.room.participant_max,
        lease_ttl_secs = config.room.lease_ttl.as_secs(),
        sweep_interval_ms = config.room.sweep_interval.as_millis() as u64,
        trust_account_header = config.trust_account_header,
        "starting shutter-room server"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let hub = RoomHub::new(config.room.clone());
    let resolver: Arc<dyn PrincipalResolver> = if config.trust_account_header {
        Arc::new(AccountHeaderResolver)
    } else {
        Arc::new(OpenResolver)
    };
    let state = AppState::new(hub.clone())
        .with_resolver(resolver)
        .with_metrics(metrics);

    let sweeper = spawn_sweeper(hub);
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("shutter-room listening on {}", config.listen_addr);

    let graceful = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal());
    graceful.await.context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    sweeper.shutdown().await;
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

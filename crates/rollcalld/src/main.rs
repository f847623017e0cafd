use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod preview;
mod session;

use config::{BusKind, Config};
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");
    let config = Config::from_env();

    let store = rollcall_store::AttendanceStore::open(&config.db_path).with_context(|| {
        format!("failed to open attendance database {}", config.db_path.display())
    })?;
    let store = Arc::new(store);

    let engine = engine::spawn_engine(&config, store.clone()).context("failed to start engine")?;

    let shutdown = CancellationToken::new();
    let service = AttendanceService::new(engine, store, shutdown.clone());

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("failed to claim {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(
        bus = ?config.bus,
        camera = config.camera_index,
        enrollment_dir = %config.enrollment_dir.display(),
        "rollcalld ready"
    );

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    shutdown.cancel();

    Ok(())
}

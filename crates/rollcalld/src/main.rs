use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod service;

use config::Config;
use rollcall_store::AttendanceStore;
use service::AttendanceService;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Arc::new(Config::from_env());
    config.ensure_dirs()?;

    let store = AttendanceStore::open(&config.db_path)?;
    let engine = engine::spawn_engine(&config)?;

    let service = AttendanceService::new(config.clone(), engine, store);

    let _conn = zbus::connection::Builder::session()?
        .name("io.rollcall.Attendance1")?
        .serve_at("/io/rollcall/Attendance1", service)?
        .build()
        .await?;

    tracing::info!("rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}

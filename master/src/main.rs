mod state;
mod handlers;
mod monitor;

use crate::state::AppState;
use anyhow::Result;
use std::{env, time::Duration};
use tokio::net::TcpListener;
use tracing::info;

pub const WORKER_DEAD_TIMEOUT: Duration = Duration::from_secs(20);
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Puerto HTTP del master (MASTER_PORT, default 8080).
fn master_port() -> u16 {
    env::var("MASTER_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("master=debug,common=info,tower_http=info,axum=info")
        .init();

    let state = AppState::new();

    // router HTTP
    let app = handlers::build_router(state.clone());

    // monitor de heartbeats en segundo plano
    let monitor_state = state.clone();
    tokio::spawn(async move {
        monitor::monitor_workers(monitor_state).await;
    });

    let listener = TcpListener::bind(("0.0.0.0", master_port())).await?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}

//! Agora server binary: wires the sync engine to an HTTP/SSE transport.
//!
//! Tunables come from the environment:
//! - `AGORA_ADDR` — bind address (default `127.0.0.1:8787`)
//! - `AGORA_BATCH_WINDOW_MS` — delta coalescing window
//! - `AGORA_HEARTBEAT_SECS` — keep-alive interval (timeout is 2x)

use std::sync::Arc;
use std::time::Duration;

use agora_sync::{EngineConfig, MemoryStore, SpaceStore, SyncEngine};

mod routes;
mod state;

use state::AppState;

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn engine_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    if let Some(ms) = env_u64("AGORA_BATCH_WINDOW_MS") {
        config.batch_window = Duration::from_millis(ms);
    }
    if let Some(secs) = env_u64("AGORA_HEARTBEAT_SECS") {
        config.heartbeat_interval = Duration::from_secs(secs);
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let store = Arc::new(MemoryStore::new());
    let engine = SyncEngine::new(store.clone() as Arc<dyn SpaceStore>, engine_config());
    let _sweeper = engine.start();

    let state = AppState::new(engine, store);
    let app = routes::router(state);

    let addr = std::env::var("AGORA_ADDR").unwrap_or_else(|_| "127.0.0.1:8787".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Agora server listening on {addr}");

    axum::serve(listener, app).await?;
    Ok(())
}

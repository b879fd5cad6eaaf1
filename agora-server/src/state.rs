//! Shared state for HTTP handlers.

use std::sync::Arc;

use agora_sync::{MemoryStore, SyncEngine};

pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub store: Arc<MemoryStore>,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine>, store: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self { engine, store })
    }
}

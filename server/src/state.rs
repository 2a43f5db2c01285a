//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::commands::{builtin_registry, RegistryError};
use crate::config::Config;
use crate::loot::LootStore;
use crate::store::{MemoryStore, Store};
use crate::tasks::decode::DecodeChain;
use crate::tasks::TaskManager;
use crate::transfer::TransferManager;
use crate::tunnel::TunnelRegistry;

#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    pub tasks: Arc<TaskManager>,
    pub tunnels: Arc<TunnelRegistry>,
    /// Sending side of the chunk pull protocol.
    pub transfers: Arc<TransferManager>,
}

impl AppState {
    /// Wire every component together over an in-memory store.
    pub fn new(config: Config) -> Result<Self, RegistryError> {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(config: Config, store: Arc<dyn Store>) -> Result<Self, RegistryError> {
        let transfers = Arc::new(TransferManager::new(config.transfer.clone()));
        let tunnels = Arc::new(TunnelRegistry::new(config.tunnel.clone()));
        let registry = Arc::new(builtin_registry(transfers.clone())?);
        let tasks = Arc::new(TaskManager::new(
            store,
            registry,
            DecodeChain::with_legacy(&config.tasks.legacy_encoding),
            LootStore::new(&config.tasks.loot_dir),
            transfers.clone(),
            tunnels.clone(),
        ));
        Ok(Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            tasks,
            tunnels,
            transfers,
        })
    }
}

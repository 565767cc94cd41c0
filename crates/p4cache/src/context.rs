//! Explicit process-wide context.
//!
//! Ties the central cache manager, the connection manager and the alert
//! channel together and owns their lifecycle.

use std::sync::Arc;

use tracing::info;

use crate::alerts::AlertManager;
use crate::central::CentralCacheManager;
use crate::config::{CacheSettings, ServerConfig};
use crate::connection::ServerConnectionManager;
use crate::connector::ConnectorFactory;
use crate::error::Result;
use crate::server::P4Server;
use crate::store::{JsonFileStore, StateStore};
use crate::types::ClientServerId;

/// Entry point for embedding the cache.
pub struct P4CacheContext {
    settings: Arc<CacheSettings>,
    alerts: Arc<AlertManager>,
    central: Arc<CentralCacheManager>,
    connections: ServerConnectionManager,
}

impl P4CacheContext {
    pub fn new(
        settings: CacheSettings,
        store: Arc<dyn StateStore>,
        connectors: Arc<dyn ConnectorFactory>,
    ) -> Self {
        let settings = Arc::new(settings);
        let alerts = Arc::new(AlertManager::new());
        let central = Arc::new(CentralCacheManager::new(store, Arc::clone(&settings)));
        let connections = ServerConnectionManager::new(
            Arc::clone(&central),
            connectors,
            Arc::clone(&alerts),
            Arc::clone(&settings),
        );
        Self {
            settings,
            alerts,
            central,
            connections,
        }
    }

    /// Context persisting to the JSON store in `settings.state_dir`.
    pub fn with_state_dir(settings: CacheSettings, connectors: Arc<dyn ConnectorFactory>) -> Result<Self> {
        let store = JsonFileStore::open(settings.require_state_dir()?)?;
        Ok(Self::new(settings, Arc::new(store), connectors))
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    pub fn central(&self) -> &Arc<CentralCacheManager> {
        &self.central
    }

    pub fn connections(&self) -> &ServerConnectionManager {
        &self.connections
    }

    /// Facade for a workspace. Fails for a missing client name.
    pub async fn server_for(&self, config: &ServerConfig, client_name: Option<&str>) -> Result<P4Server> {
        let connection = self.connections.connection_for(config, client_name).await?;
        Ok(P4Server::new(connection))
    }

    /// Configuration changed somewhere. Facades obtained earlier stop
    /// working; cached state and queued updates are kept.
    pub async fn config_updated(&self) {
        self.central.config_updated().await;
        self.connections.invalidate_all().await;
    }

    /// A workspace's configuration is unusable: its server goes invalid and
    /// its cache is saved and unloaded.
    pub async fn config_invalid(&self, config: &ServerConfig, client_name: Option<&str>) -> Result<()> {
        self.connections.invalidate_config(config, client_name).await;
        if client_name.is_some() {
            let id = ClientServerId::new(config.id(), client_name.map(str::to_string));
            self.central.remove_client(&id).await?;
        }
        Ok(())
    }

    /// Discard cached server state for a workspace so it reloads.
    pub async fn flush_state(&self, client: &ClientServerId, include_local: bool) -> bool {
        self.central.flush_state(client, include_local).await
    }

    /// Save every loaded workspace.
    pub async fn persist(&self) -> Result<usize> {
        self.central.save_all().await
    }

    /// Stop background work, release waiters and save everything.
    pub async fn shutdown(&self) -> Result<usize> {
        self.connections.invalidate_all().await;
        let saved = self.central.dispose().await?;
        info!(saved, "cache shut down");
        Ok(saved)
    }
}

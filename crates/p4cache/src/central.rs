//! Process-wide registry of workspace caches.
//!
//! Holds every loaded [`ClientLocalServerState`] and the
//! [`ClientCacheManager`] wrapping it. Managers are cheap and are dropped
//! whenever configuration changes; states survive until their workspace is
//! removed, and are written to the [`StateStore`] on the way out.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::client::ClientCacheManager;
use crate::config::{CacheSettings, ServerConfig};
use crate::error::{CacheError, Result};
use crate::state::ClientLocalServerState;
use crate::store::StateStore;
use crate::types::{CASE_INSENSITIVE_FS, ClientServerId};

#[derive(Default)]
struct Registry {
    managers: HashMap<ClientServerId, Arc<ClientCacheManager>>,
    states: HashMap<ClientServerId, Arc<RwLock<ClientLocalServerState>>>,
}

/// Owner of all workspace caches.
pub struct CentralCacheManager {
    store: Arc<dyn StateStore>,
    settings: Arc<CacheSettings>,
    registry: Mutex<Registry>,
    disposed: AtomicBool,
}

impl CentralCacheManager {
    pub fn new(store: Arc<dyn StateStore>, settings: Arc<CacheSettings>) -> Self {
        Self {
            store,
            settings,
            registry: Mutex::new(Registry::default()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Run a store call on the blocking pool; file stores do disk I/O.
    async fn with_store<T, F>(&self, call: F) -> Result<T>
    where
        F: FnOnce(&dyn StateStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || call(store.as_ref()))
            .await
            .map_err(|e| CacheError::Internal(format!("state store task failed: {}", e)))?
    }

    fn manager(
        &self,
        config: &ServerConfig,
        client: &ClientServerId,
        state: Arc<RwLock<ClientLocalServerState>>,
    ) -> Arc<ClientCacheManager> {
        Arc::new(ClientCacheManager::new(
            config.clone(),
            Arc::clone(&self.settings),
            state,
            client.clone(),
        ))
    }

    /// Cache manager for a workspace, loading or creating its state.
    ///
    /// A brand-new state needs to know whether the server compares paths
    /// case-insensitively; `probe` asks it. The probe runs without holding
    /// the registry lock, and if it fails the local filesystem's rule is
    /// used.
    #[instrument(skip(self, config, probe), fields(client = %client))]
    pub async fn get_client_cache_manager<F, Fut>(
        &self,
        client: &ClientServerId,
        config: &ServerConfig,
        probe: F,
    ) -> Result<Arc<ClientCacheManager>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        if self.is_disposed() {
            return Err(CacheError::Disposed);
        }
        if client.client_name().is_none() {
            return Err(CacheError::InvalidClient(client.clone()));
        }
        {
            let mut registry = self.registry.lock().await;
            if let Some(manager) = registry.managers.get(client) {
                return Ok(Arc::clone(manager));
            }
            if let Some(state) = registry.states.get(client).cloned() {
                let manager = self.manager(config, client, state);
                registry.managers.insert(client.clone(), Arc::clone(&manager));
                return Ok(manager);
            }
        }

        let state = match self.load(client).await {
            Some(state) => state,
            None => {
                let case_insensitive = match probe().await {
                    Ok(case_insensitive) => case_insensitive,
                    Err(e) => {
                        warn!(error = %e, fallback = CASE_INSENSITIVE_FS, "server case sensitivity unknown, using local filesystem rule");
                        CASE_INSENSITIVE_FS
                    }
                };
                debug!(case_insensitive, "new workspace state");
                ClientLocalServerState::new(client.clone(), case_insensitive)
            }
        };

        let mut registry = self.registry.lock().await;
        if self.is_disposed() {
            return Err(CacheError::Disposed);
        }
        if let Some(manager) = registry.managers.get(client) {
            return Ok(Arc::clone(manager));
        }
        let state = Arc::clone(
            registry
                .states
                .entry(client.clone())
                .or_insert_with(|| Arc::new(RwLock::new(state))),
        );
        let manager = self.manager(config, client, state);
        registry.managers.insert(client.clone(), Arc::clone(&manager));
        Ok(manager)
    }

    async fn load(&self, client: &ClientServerId) -> Option<ClientLocalServerState> {
        let id = client.clone();
        match self.with_store(move |store| store.load(&id)).await {
            Ok(Some(doc)) => match ClientLocalServerState::from_document(doc) {
                Ok(state) => {
                    info!(pending = state.pending().len(), "workspace state restored");
                    Some(state)
                }
                Err(e) => {
                    warn!(error = %e, "discarding unreadable workspace state");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "workspace state could not be loaded");
                None
            }
        }
    }

    /// Configuration changed: managers are rebuilt on next use, states stay.
    pub async fn config_updated(&self) {
        let mut registry = self.registry.lock().await;
        let dropped = registry.managers.len();
        registry.managers.clear();
        info!(dropped, "cache managers cleared after configuration change");
    }

    /// Unload a workspace after saving its state.
    pub async fn remove_client(&self, client: &ClientServerId) -> Result<()> {
        let removed = {
            let mut registry = self.registry.lock().await;
            registry.managers.remove(client);
            registry.states.remove(client)
        };
        if let Some(state) = removed {
            let doc = state.read().await.to_document();
            self.with_store(move |store| store.save(&doc)).await?;
            info!(client = %client, "workspace cache removed");
        }
        Ok(())
    }

    /// Unload a workspace and delete its saved state.
    pub async fn forget_client(&self, client: &ClientServerId) -> Result<()> {
        {
            let mut registry = self.registry.lock().await;
            registry.managers.remove(client);
            registry.states.remove(client);
        }
        let id = client.clone();
        self.with_store(move |store| store.remove(&id)).await
    }

    /// Discard cached server state for a workspace so it is reloaded.
    /// Returns `false` if the workspace is not loaded.
    pub async fn flush_state(&self, client: &ClientServerId, include_local: bool) -> bool {
        let state = self.registry.lock().await.states.get(client).cloned();
        match state {
            Some(state) => {
                state.write().await.flush(include_local);
                true
            }
            None => false,
        }
    }

    pub async fn loaded_clients(&self) -> Vec<ClientServerId> {
        let mut clients: Vec<_> = self.registry.lock().await.states.keys().cloned().collect();
        clients.sort();
        clients
    }

    /// Write every loaded workspace to the store. Returns how many were saved.
    pub async fn save_all(&self) -> Result<usize> {
        let states: Vec<_> = self.registry.lock().await.states.values().cloned().collect();
        let mut saved = 0;
        for state in states {
            let doc = state.read().await.to_document();
            self.with_store(move |store| store.save(&doc)).await?;
            saved += 1;
        }
        debug!(saved, "workspace states saved");
        Ok(saved)
    }

    /// Save everything and refuse further use.
    pub async fn dispose(&self) -> Result<usize> {
        let saved = self.save_all().await;
        self.disposed.store(true, Ordering::SeqCst);
        let mut registry = self.registry.lock().await;
        registry.managers.clear();
        registry.states.clear();
        saved
    }
}

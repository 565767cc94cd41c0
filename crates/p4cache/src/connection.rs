//! Online/offline state and scoped access to the server.
//!
//! Each server configuration has one [`ServerStatus`]. It starts online and
//! valid; connectivity failures flip it offline, and an invalid
//! configuration can never come back online. Each workspace gets a
//! [`ServerConnection`] that serializes its server work through a session
//! lock and replays queued updates whenever the server comes back.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::alerts::AlertManager;
use crate::central::CentralCacheManager;
use crate::client::{CacheKind, ClientCacheManager};
use crate::config::{CacheSettings, ServerConfig};
use crate::connector::{ConnectorFactory, ConnectorResult, ServerConnector};
use crate::error::{CacheError, ConnectorError, Result};
use crate::sync::{self, SyncReport};
use crate::types::{ChangeList, ClientServerId, ExtendedFileStatus, FilePath, FileResult, ServerInfo};

/// Connectivity of a server as seen by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Online,
    Offline,
}

/// Validity and connectivity of one server configuration.
#[derive(Debug)]
pub struct ServerStatus {
    config: ServerConfig,
    valid: AtomicBool,
    disposed: AtomicBool,
    state: watch::Sender<ConnectionState>,
}

impl ServerStatus {
    pub fn new(config: ServerConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Online);
        Self {
            config,
            valid: AtomicBool::new(true),
            disposed: AtomicBool::new(false),
            state,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Online and valid: server operations may run.
    pub fn is_working_online(&self) -> bool {
        self.is_valid() && !self.is_disposed() && self.state() == ConnectionState::Online
    }

    pub fn is_working_offline(&self) -> bool {
        !self.is_working_online()
    }

    /// Go online. Refused for an invalid or disposed configuration.
    pub fn connect(&self) -> bool {
        if !self.is_valid() || self.is_disposed() {
            debug!(server = %self.config.id(), "connect refused, configuration not usable");
            return false;
        }
        let changed = self.state.send_if_modified(|state| {
            let was_offline = *state == ConnectionState::Offline;
            *state = ConnectionState::Online;
            was_offline
        });
        if changed {
            info!(server = %self.config.id(), "server online");
        }
        true
    }

    /// Go offline. Returns whether the state changed.
    pub fn disconnect(&self) -> bool {
        let changed = self.state.send_if_modified(|state| {
            let was_online = *state == ConnectionState::Online;
            *state = ConnectionState::Offline;
            was_online
        });
        if changed {
            info!(server = %self.config.id(), "working offline");
        }
        changed
    }

    /// Mark the configuration permanently unusable. Waiters are released.
    pub fn on_config_invalid(&self) {
        if self.valid.swap(false, Ordering::SeqCst) {
            warn!(server = %self.config.id(), "server configuration invalid");
        }
        self.state.send_modify(|_| {});
    }

    /// Shut down. Waiters and watchers are released.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.state.send_modify(|_| {});
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Wait until the server is online. `None` waits forever.
    ///
    /// Returns `Ok(false)` if the timeout elapsed first, and an error once
    /// the configuration is invalid or disposed.
    pub async fn wait_for_online(&self, timeout: Option<Duration>) -> Result<bool> {
        let mut rx = self.state.subscribe();
        let wait = async {
            loop {
                if self.is_disposed() {
                    return Err(CacheError::Disposed);
                }
                if !self.is_valid() {
                    return Err(CacheError::InvalidConfig(self.config.id()));
                }
                if *rx.borrow_and_update() == ConnectionState::Online {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(CacheError::Disposed);
                }
            }
        };
        match timeout {
            None => wait.await.map(|()| true),
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result.map(|()| true),
                Err(_) => Ok(false),
            },
        }
    }
}

/// Server access for one workspace.
pub struct ServerConnection {
    client: ClientServerId,
    status: Arc<ServerStatus>,
    connector: Arc<dyn ServerConnector>,
    cache: Arc<ClientCacheManager>,
    alerts: Arc<AlertManager>,
    settings: Arc<CacheSettings>,
    session: Mutex<()>,
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("client", &self.client)
            .field("state", &self.status.state())
            .finish_non_exhaustive()
    }
}

impl ServerConnection {
    pub fn new(
        client: ClientServerId,
        status: Arc<ServerStatus>,
        connector: Arc<dyn ServerConnector>,
        cache: Arc<ClientCacheManager>,
        alerts: Arc<AlertManager>,
        settings: Arc<CacheSettings>,
    ) -> Self {
        Self {
            client,
            status,
            connector,
            cache,
            alerts,
            settings,
            session: Mutex::new(()),
        }
    }

    pub fn client(&self) -> &ClientServerId {
        &self.client
    }

    pub fn status(&self) -> &Arc<ServerStatus> {
        &self.status
    }

    pub fn cache(&self) -> &Arc<ClientCacheManager> {
        &self.cache
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn is_working_online(&self) -> bool {
        self.status.is_working_online()
    }

    pub fn is_working_offline(&self) -> bool {
        self.status.is_working_offline()
    }

    /// Acquire the workspace session. Fails with [`CacheError::Offline`]
    /// when the server is not usable.
    pub async fn scope(&self) -> Result<ConnectionScope<'_>> {
        if self.is_working_offline() {
            return Err(CacheError::Offline(self.status.config().id()));
        }
        let session = self.session.lock().await;
        // The server may have dropped while we waited.
        if self.is_working_offline() {
            return Err(CacheError::Offline(self.status.config().id()));
        }
        Ok(ConnectionScope {
            conn: self,
            _session: session,
        })
    }

    /// Send every queued update to the server.
    pub async fn flush_pending(&self) -> Result<SyncReport> {
        sync::flush_pending(self).await
    }

    /// Reload one cache from the server if it is stale, or always when
    /// `force` is set. Returns whether a reload happened.
    pub async fn refresh(&self, kind: CacheKind, force: bool) -> Result<bool> {
        sync::refresh(self, kind, force).await
    }

    /// Flush the queue now if the server is online, then again whenever it
    /// comes back online. Needs a running Tokio runtime.
    pub fn spawn_replay(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let conn: Weak<ServerConnection> = Arc::downgrade(self);
        let mut rx = self.status.subscribe();
        let client = self.client.clone();
        Some(runtime.spawn(async move {
            let mut online = *rx.borrow_and_update() == ConnectionState::Online;
            loop {
                let Some(strong) = conn.upgrade() else {
                    break;
                };
                if strong.status.is_disposed() {
                    break;
                }
                if online && strong.cache.has_pending().await {
                    match strong.flush_pending().await {
                        Ok(report) => debug!(client = %client, groups = report.groups.len(), remaining = report.remaining, "replayed pending updates"),
                        Err(e) => warn!(client = %client, error = %e, "replay failed"),
                    }
                }
                drop(strong);
                if rx.changed().await.is_err() {
                    break;
                }
                online = *rx.borrow_and_update() == ConnectionState::Online;
            }
            debug!(client = %client, "replay task stopped");
        }))
    }
}

/// Exclusive server session for one workspace.
///
/// Every call is bounded by the command timeout. Connectivity failures take
/// the server offline; authentication failures also raise a critical alert.
pub struct ConnectionScope<'a> {
    conn: &'a ServerConnection,
    _session: MutexGuard<'a, ()>,
}

impl<'a> ConnectionScope<'a> {
    pub fn connection(&self) -> &'a ServerConnection {
        self.conn
    }

    pub fn cache(&self) -> &'a ClientCacheManager {
        &self.conn.cache
    }

    pub fn alerts(&self) -> &'a AlertManager {
        &self.conn.alerts
    }

    pub fn settings(&self) -> &'a CacheSettings {
        &self.conn.settings
    }

    pub fn is_online(&self) -> bool {
        self.conn.is_working_online()
    }

    async fn call<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = ConnectorResult<T>>,
    {
        let status = &self.conn.status;
        if status.is_working_offline() {
            return Err(CacheError::Offline(status.config().id()));
        }
        let limit = self.conn.settings.command_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(ConnectorError::Disconnected(msg))) => {
                warn!(client = %self.conn.client, operation, error = %msg, "server disconnected");
                self.went_offline(&msg);
                Err(CacheError::Disconnected(msg))
            }
            Ok(Err(ConnectorError::Authentication(msg))) => {
                self.conn.alerts.critical(
                    "Authentication failed",
                    format!("{}: {}", status.config().id(), msg),
                );
                status.disconnect();
                Err(CacheError::Authentication(msg))
            }
            Ok(Err(ConnectorError::Command(msg))) => {
                debug!(client = %self.conn.client, operation, error = %msg, "command rejected");
                Err(CacheError::Validation(msg))
            }
            Err(_) => {
                let secs = limit.as_secs();
                warn!(client = %self.conn.client, operation, secs, "server command timed out");
                self.went_offline(&format!("{} timed out", operation));
                Err(CacheError::Timeout {
                    operation: operation.to_string(),
                    secs,
                })
            }
        }
    }

    fn went_offline(&self, reason: &str) {
        let status = &self.conn.status;
        if status.disconnect() && !status.config().auto_offline {
            self.conn.alerts.warning(
                "Working offline",
                format!("lost connection to {}: {}", status.config().id(), reason),
                Vec::new(),
            );
        }
    }

    pub async fn server_info(&self) -> Result<ServerInfo> {
        self.call("info", self.conn.connector.server_info()).await
    }

    pub async fn client_roots(&self) -> Result<Vec<FilePath>> {
        self.call("client", self.conn.connector.client_roots()).await
    }

    pub async fn file_status(&self, files: &[FilePath]) -> Result<Vec<ExtendedFileStatus>> {
        self.call("fstat", self.conn.connector.file_status(files)).await
    }

    pub async fn opened_files(&self, roots: &[FilePath]) -> Result<Vec<ExtendedFileStatus>> {
        self.call("opened", self.conn.connector.opened_files(roots)).await
    }

    pub async fn add_files(&self, files: &[FilePath], changelist: i32) -> Result<Vec<FileResult>> {
        self.call("add", self.conn.connector.add_files(files, changelist)).await
    }

    pub async fn edit_files(&self, files: &[FilePath], changelist: i32) -> Result<Vec<FileResult>> {
        self.call("edit", self.conn.connector.edit_files(files, changelist)).await
    }

    pub async fn reopen_files(&self, files: &[FilePath], changelist: i32) -> Result<Vec<FileResult>> {
        self.call("reopen", self.conn.connector.reopen_files(files, changelist)).await
    }

    pub async fn delete_files(&self, files: &[FilePath], changelist: i32) -> Result<Vec<FileResult>> {
        self.call("delete", self.conn.connector.delete_files(files, changelist)).await
    }

    pub async fn revert_files(&self, files: &[FilePath]) -> Result<Vec<FileResult>> {
        self.call("revert", self.conn.connector.revert_files(files)).await
    }

    pub async fn move_file(&self, source: &FilePath, target: &FilePath, changelist: i32) -> Result<Vec<FileResult>> {
        self.call("move", self.conn.connector.move_file(source, target, changelist)).await
    }

    pub async fn integrate_file(
        &self,
        source: &FilePath,
        target: &FilePath,
        changelist: i32,
    ) -> Result<Vec<FileResult>> {
        self.call("integrate", self.conn.connector.integrate_file(source, target, changelist))
            .await
    }

    pub async fn open_changelists(&self) -> Result<Vec<ChangeList>> {
        self.call("changes", self.conn.connector.open_changelists()).await
    }

    pub async fn create_changelist(&self, description: &str) -> Result<i32> {
        self.call("change", self.conn.connector.create_changelist(description)).await
    }

    pub async fn submit_changelist(&self, changelist: i32) -> Result<Vec<FileResult>> {
        self.call("submit", self.conn.connector.submit_changelist(changelist)).await
    }

    pub async fn job_statuses(&self) -> Result<Vec<String>> {
        self.call("jobspec", self.conn.connector.job_statuses()).await
    }
}

struct ServerEntry {
    status: Arc<ServerStatus>,
    connections: DashMap<String, Arc<ServerConnection>>,
}

/// Registry of server statuses and workspace connections.
pub struct ServerConnectionManager {
    central: Arc<CentralCacheManager>,
    connectors: Arc<dyn ConnectorFactory>,
    alerts: Arc<AlertManager>,
    settings: Arc<CacheSettings>,
    servers: Mutex<HashMap<String, Arc<ServerEntry>>>,
    replay_tasks: DashMap<ClientServerId, JoinHandle<()>>,
}

impl ServerConnectionManager {
    pub fn new(
        central: Arc<CentralCacheManager>,
        connectors: Arc<dyn ConnectorFactory>,
        alerts: Arc<AlertManager>,
        settings: Arc<CacheSettings>,
    ) -> Self {
        Self {
            central,
            connectors,
            alerts,
            settings,
            servers: Mutex::new(HashMap::new()),
            replay_tasks: DashMap::new(),
        }
    }

    async fn entry_for(&self, config: &ServerConfig) -> Arc<ServerEntry> {
        let mut servers = self.servers.lock().await;
        servers
            .entry(config.id())
            .or_insert_with(|| {
                debug!(server = %config.id(), "server status created");
                Arc::new(ServerEntry {
                    status: Arc::new(ServerStatus::new(config.clone())),
                    connections: DashMap::new(),
                })
            })
            .clone()
    }

    /// Status shared by every workspace of a server configuration.
    pub async fn status_for(&self, config: &ServerConfig) -> Arc<ServerStatus> {
        Arc::clone(&self.entry_for(config).await.status)
    }

    /// Connection for a workspace, created on first use.
    #[instrument(skip(self, config), fields(server = %config.id()))]
    pub async fn connection_for(
        &self,
        config: &ServerConfig,
        client_name: Option<&str>,
    ) -> Result<Arc<ServerConnection>> {
        let id = ClientServerId::new(config.id(), client_name.map(str::to_string));
        let Some(name) = client_name else {
            return Err(CacheError::InvalidClient(id));
        };
        let entry = self.entry_for(config).await;
        if let Some(conn) = entry.connections.get(name) {
            return Ok(Arc::clone(conn.value()));
        }
        if !entry.status.is_valid() {
            return Err(CacheError::InvalidConfig(config.id()));
        }

        let connector = self.connectors.connector_for(config, &id);
        let probe = Arc::clone(&connector);
        let status = Arc::clone(&entry.status);
        let limit = self.settings.command_timeout();
        let cache = self
            .central
            .get_client_cache_manager(&id, config, || async move {
                if status.is_working_offline() {
                    return Err(CacheError::Offline(status.config().id()));
                }
                match tokio::time::timeout(limit, probe.server_info()).await {
                    Ok(info) => Ok(!info?.case_sensitive),
                    Err(_) => Err(CacheError::Timeout {
                        operation: "info".into(),
                        secs: limit.as_secs(),
                    }),
                }
            })
            .await?;

        let conn = Arc::new(ServerConnection::new(
            id.clone(),
            Arc::clone(&entry.status),
            connector,
            cache,
            Arc::clone(&self.alerts),
            Arc::clone(&self.settings),
        ));
        let conn = match entry.connections.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => return Ok(Arc::clone(existing.get())),
            dashmap::mapref::entry::Entry::Vacant(slot) => Arc::clone(slot.insert(conn).value()),
        };
        if let Some(handle) = conn.spawn_replay() {
            self.replay_tasks.insert(id, handle);
        }
        Ok(conn)
    }

    /// Every live workspace connection.
    pub async fn connections(&self) -> Vec<Arc<ServerConnection>> {
        let servers = self.servers.lock().await;
        servers
            .values()
            .flat_map(|entry| {
                entry
                    .connections
                    .iter()
                    .map(|c| Arc::clone(c.value()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Take a server online or offline. Returns the resulting working state.
    pub async fn set_online(&self, config: &ServerConfig, online: bool) -> bool {
        let status = self.status_for(config).await;
        if online {
            status.connect();
        } else {
            status.disconnect();
        }
        status.is_working_online()
    }

    /// Mark a configuration invalid and drop the workspace's connection.
    /// The server entry goes away with its last connection.
    pub async fn invalidate_config(&self, config: &ServerConfig, client_name: Option<&str>) {
        let mut servers = self.servers.lock().await;
        let mut emptied = Vec::new();
        for (key, entry) in servers.iter() {
            if !entry.status.config().is_same_connection_as(config) {
                continue;
            }
            entry.status.on_config_invalid();
            if let Some(name) = client_name {
                entry.connections.remove(name);
                self.stop_replay(&ClientServerId::new(key.clone(), Some(name.to_string())));
            }
            if entry.connections.is_empty() {
                entry.status.dispose();
                emptied.push(key.clone());
            }
        }
        for key in emptied {
            servers.remove(&key);
        }
    }

    /// Dispose every server status and stop all background work.
    pub async fn invalidate_all(&self) {
        let mut servers = self.servers.lock().await;
        for entry in servers.values() {
            entry.status.dispose();
            entry.connections.clear();
        }
        servers.clear();
        self.replay_tasks.iter().for_each(|task| task.value().abort());
        self.replay_tasks.clear();
    }

    fn stop_replay(&self, client: &ClientServerId) {
        if let Some((_, handle)) = self.replay_tasks.remove(client) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> ServerStatus {
        ServerStatus::new(ServerConfig::new("p4:1666", "u"))
    }

    #[test]
    fn test_starts_online_and_valid() {
        let s = status();
        assert!(s.is_working_online());
        assert_eq!(s.state(), ConnectionState::Online);
    }

    #[test]
    fn test_disconnect_and_reconnect() {
        let s = status();
        assert!(s.disconnect());
        assert!(!s.disconnect());
        assert!(s.is_working_offline());
        assert!(s.connect());
        assert!(s.is_working_online());
    }

    #[test]
    fn test_invalid_config_never_online() {
        let s = status();
        s.on_config_invalid();
        assert!(s.is_working_offline());
        assert!(!s.connect());
        assert!(s.is_working_offline());
        // Going offline is always allowed.
        assert!(s.disconnect());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_online_times_out() {
        let s = status();
        s.disconnect();
        let online = s.wait_for_online(Some(Duration::from_secs(5))).await.unwrap();
        assert!(!online);
    }

    #[tokio::test]
    async fn test_wait_for_online_returns_immediately_when_online() {
        let s = status();
        assert!(s.wait_for_online(None).await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_online_wakes_on_connect() {
        let s = Arc::new(status());
        s.disconnect();
        let waiter = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.wait_for_online(Some(Duration::from_secs(30))).await })
        };
        tokio::task::yield_now().await;
        s.connect();
        assert!(waiter.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_dispose_releases_waiters() {
        let s = Arc::new(status());
        s.disconnect();
        let waiter = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.wait_for_online(None).await })
        };
        tokio::task::yield_now().await;
        s.dispose();
        assert!(matches!(waiter.await.unwrap(), Err(CacheError::Disposed)));
    }

    #[tokio::test]
    async fn test_invalid_config_releases_waiters() {
        let s = Arc::new(status());
        s.disconnect();
        let waiter = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.wait_for_online(None).await })
        };
        tokio::task::yield_now().await;
        s.on_config_invalid();
        assert!(matches!(waiter.await.unwrap(), Err(CacheError::InvalidConfig(_))));
    }
}

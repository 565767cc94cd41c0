//! Per-workspace facade used by commands and views.
//!
//! Reads are served from the cache, refreshed first when online and stale.
//! Writes are recorded locally, queued, and pushed to the server in the
//! background when it is reachable.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::client::{CacheKind, ClientCacheManager};
use crate::connection::ServerConnection;
use crate::error::{CacheError, Result};
use crate::state::{P4FileAction, PendingUpdateState};
use crate::sync::{SyncReport, load_file_actions};
use crate::types::{ChangeList, ClientServerId, ExtendedFileStatus, FilePath, FileResult};

/// Operations on one workspace.
#[derive(Debug)]
pub struct P4Server {
    connection: Arc<ServerConnection>,
    valid: AtomicBool,
}

impl P4Server {
    pub(crate) fn new(connection: Arc<ServerConnection>) -> Self {
        Self {
            connection,
            valid: AtomicBool::new(true),
        }
    }

    pub fn client(&self) -> &ClientServerId {
        self.connection.client()
    }

    pub fn connection(&self) -> &Arc<ServerConnection> {
        &self.connection
    }

    fn cache(&self) -> &ClientCacheManager {
        self.connection.cache()
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst) && self.connection.status().is_valid()
    }

    pub fn is_working_online(&self) -> bool {
        self.is_valid() && self.connection.is_working_online()
    }

    pub fn is_working_offline(&self) -> bool {
        !self.is_working_online()
    }

    fn ensure_valid(&self) -> Result<()> {
        if !self.valid.load(Ordering::SeqCst) {
            return Err(CacheError::Disposed);
        }
        if !self.connection.status().is_valid() {
            return Err(CacheError::InvalidConfig(self.client().server_config_id().to_string()));
        }
        Ok(())
    }

    /// Stop using this facade. The cache itself is untouched.
    pub fn dispose(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    /// Try to go online. Returns `false` if the configuration is invalid.
    pub fn go_online(&self) -> bool {
        self.connection.status().connect()
    }

    pub fn go_offline(&self) {
        self.connection.status().disconnect();
    }

    pub async fn wait_for_online(&self, timeout: Option<Duration>) -> Result<bool> {
        self.connection.status().wait_for_online(timeout).await
    }

    async fn refresh_quietly(&self, kind: CacheKind) {
        match self.connection.refresh(kind, false).await {
            Ok(refreshed) => debug!(client = %self.client(), ?kind, refreshed, "cache read"),
            Err(e) => warn!(client = %self.client(), ?kind, error = %e, "refresh failed, serving cached data"),
        }
    }

    /// Opened files: cached server state overridden by local changes.
    pub async fn get_open_files(&self) -> Result<Vec<P4FileAction>> {
        self.ensure_valid()?;
        self.refresh_quietly(CacheKind::FileActions).await;
        Ok(self.cache().open_files().await)
    }

    pub async fn get_open_changelists(&self) -> Result<Vec<ChangeList>> {
        self.ensure_valid()?;
        self.refresh_quietly(CacheKind::Changelists).await;
        Ok(self.cache().open_changelists().await)
    }

    pub async fn get_job_statuses(&self) -> Result<Vec<String>> {
        self.ensure_valid()?;
        self.refresh_quietly(CacheKind::JobStatuses).await;
        Ok(self.cache().job_statuses().await)
    }

    /// Workspace roots. They are loaded together with the open files.
    pub async fn get_client_roots(&self) -> Result<Vec<FilePath>> {
        self.ensure_valid()?;
        if self.cache().client_roots().await.is_empty() {
            self.refresh_quietly(CacheKind::FileActions).await;
        }
        Ok(self.cache().client_roots().await)
    }

    /// Current server status of each file. `None` when offline; directories
    /// are left out.
    pub async fn get_file_status(
        &self,
        files: &[FilePath],
    ) -> Result<Option<HashMap<FilePath, ExtendedFileStatus>>> {
        self.ensure_valid()?;
        if self.is_working_offline() {
            return Ok(None);
        }
        let files: Vec<FilePath> = files.iter().filter(|f| !f.is_dir()).cloned().collect();
        if files.is_empty() {
            return Ok(Some(HashMap::new()));
        }
        let scope = match self.connection.scope().await {
            Ok(scope) => scope,
            Err(CacheError::Offline(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let statuses: Vec<ExtendedFileStatus> = scope
            .file_status(&files)
            .await?
            .into_iter()
            .filter(|status| !status.is_status_message())
            .collect();
        if statuses.len() != files.len() {
            return Err(CacheError::Internal(format!(
                "requested status for {} files, server returned {}",
                files.len(),
                statuses.len()
            )));
        }
        Ok(Some(files.into_iter().zip(statuses).collect()))
    }

    /// `None`, directories, ignore-pattern matches and files outside the
    /// workspace are ignored.
    pub async fn is_ignored(&self, file: Option<&FilePath>) -> bool {
        match file {
            Some(file) => self.cache().is_ignored(file).await,
            None => true,
        }
    }

    pub async fn add_or_edit_files(&self, files: &[FilePath], changelist: i32) -> Result<()> {
        self.ensure_valid()?;
        let mut updates = Vec::new();
        for file in files {
            self.make_writable(file);
            updates.extend(self.cache().add_or_edit_file(file, changelist).await);
        }
        self.submit(updates).await;
        Ok(())
    }

    pub async fn edit_files(&self, files: &[FilePath], changelist: i32) -> Result<()> {
        self.ensure_valid()?;
        let mut updates = Vec::new();
        for file in files {
            self.make_writable(file);
            updates.extend(self.cache().edit_file(file, changelist).await);
        }
        self.submit(updates).await;
        Ok(())
    }

    pub async fn delete_files(&self, files: &[FilePath], changelist: i32) -> Result<()> {
        self.ensure_valid()?;
        let mut updates = Vec::new();
        for file in files {
            updates.extend(self.cache().delete_file(file, changelist).await);
        }
        self.submit(updates).await;
        Ok(())
    }

    /// Move each `(source, target)` pair.
    pub async fn move_files(&self, moves: &[(FilePath, FilePath)], changelist: i32) -> Result<()> {
        self.ensure_valid()?;
        let mut updates = Vec::new();
        for (source, target) in moves {
            updates.extend(self.cache().move_file(source, target, changelist).await);
        }
        self.submit(updates).await;
        Ok(())
    }

    /// Integrate each `(source, target)` pair.
    pub async fn integrate_files(&self, pairs: &[(FilePath, FilePath)], changelist: i32) -> Result<()> {
        self.ensure_valid()?;
        let mut updates = Vec::new();
        for (source, target) in pairs {
            updates.extend(self.cache().integrate_file(source, target, changelist).await);
        }
        self.submit(updates).await;
        Ok(())
    }

    pub async fn revert_files(&self, files: &[FilePath]) -> Result<()> {
        self.ensure_valid()?;
        let mut updates = Vec::new();
        for file in files {
            updates.extend(self.cache().revert_file(file).await);
        }
        self.submit(updates).await;
        Ok(())
    }

    pub async fn pending_updates(&self) -> Vec<PendingUpdateState> {
        self.cache().pending_updates().await
    }

    /// Push queued updates now and wait for the result.
    pub async fn synchronize(&self) -> Result<SyncReport> {
        self.ensure_valid()?;
        self.connection.flush_pending().await
    }

    /// Create a pending changelist. Online only.
    pub async fn create_changelist(&self, description: &str) -> Result<ChangeList> {
        self.ensure_valid()?;
        let scope = self.connection.scope().await?;
        let id = scope.create_changelist(description).await?;
        let changelist = ChangeList {
            id,
            description: description.to_string(),
        };
        scope.cache().add_changelist(changelist.clone()).await;
        Ok(changelist)
    }

    /// Submit a changelist. Online only. Queued updates are sent first so
    /// the submit sees them.
    pub async fn submit_changelist(&self, changelist: i32) -> Result<Vec<FileResult>> {
        self.ensure_valid()?;
        self.connection.flush_pending().await?;
        let results = {
            let scope = self.connection.scope().await?;
            let results = scope.submit_changelist(changelist).await?;
            scope.alerts().file_results("Submit", &results);
            if let Err(e) = load_file_actions(&scope).await {
                warn!(error = %e, "reload after submit failed");
            }
            results
        };
        if let Err(e) = self.connection.refresh(CacheKind::Changelists, true).await {
            warn!(error = %e, "changelist reload after submit failed");
        }
        Ok(results)
    }

    async fn submit(&self, updates: Vec<PendingUpdateState>) {
        if updates.is_empty() {
            return;
        }
        self.cache().queue(updates).await;
        if !self.connection.is_working_online() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let conn = Arc::clone(&self.connection);
        runtime.spawn(async move {
            if let Err(e) = conn.flush_pending().await {
                warn!(client = %conn.client(), error = %e, "background flush failed");
            }
        });
    }

    /// Files must be writable before the user edits them.
    fn make_writable(&self, file: &FilePath) {
        let metadata = match std::fs::metadata(file.as_path()) {
            Ok(metadata) => metadata,
            Err(_) => return,
        };
        let mut permissions = metadata.permissions();
        if !permissions.readonly() || metadata.is_dir() {
            return;
        }
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
        if let Err(e) = std::fs::set_permissions(file.as_path(), permissions) {
            self.connection.alerts().warning(
                "Make writable",
                format!("could not make {} writable: {}", file, e),
                vec![file.clone()],
            );
        }
    }
}

//! Per-workspace cache manager.
//!
//! Wraps one workspace's [`ClientLocalServerState`] behind an async lock and
//! exposes the reads and local intentions the rest of the crate needs. It
//! never talks to the server; the sync engine feeds server answers in.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::alerts::AlertManager;
use crate::config::{CacheSettings, IgnoreMatcher, ServerConfig};
use crate::state::{
    ActionGroup, ClientLocalServerState, ClientStateDocument, FileUpdateAction, FileUpdateStatus,
    P4FileAction, PendingUpdateState, UpdateAction,
};
use crate::types::{ChangeList, ClientServerId, ExtendedFileStatus, FilePath};

/// Caches refreshed on their own schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    FileActions,
    Changelists,
    JobStatuses,
}

/// Cache manager for one workspace.
#[derive(Debug)]
pub struct ClientCacheManager {
    client: ClientServerId,
    config: ServerConfig,
    settings: Arc<CacheSettings>,
    ignore: IgnoreMatcher,
    state: Arc<RwLock<ClientLocalServerState>>,
}

impl ClientCacheManager {
    pub(crate) fn new(
        config: ServerConfig,
        settings: Arc<CacheSettings>,
        state: Arc<RwLock<ClientLocalServerState>>,
        client: ClientServerId,
    ) -> Self {
        let ignore = config.ignore_matcher();
        Self {
            client,
            config,
            settings,
            ignore,
            state,
        }
    }

    pub fn client(&self) -> &ClientServerId {
        &self.client
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Open files, local intentions taking precedence.
    pub async fn open_files(&self) -> Vec<P4FileAction> {
        self.state.read().await.open_files()
    }

    pub async fn open_changelists(&self) -> Vec<ChangeList> {
        self.state.read().await.server().changelists.clone()
    }

    pub async fn job_statuses(&self) -> Vec<String> {
        self.state.read().await.server().job_statuses.clone()
    }

    pub async fn client_roots(&self) -> Vec<FilePath> {
        self.state.read().await.server().roots.clone()
    }

    pub async fn pending_updates(&self) -> Vec<PendingUpdateState> {
        self.state.read().await.pending().iter().cloned().collect()
    }

    pub async fn has_pending(&self) -> bool {
        !self.state.read().await.pending().is_empty()
    }

    /// When `kind` was last loaded from the server.
    pub async fn last_refreshed(&self, kind: CacheKind) -> DateTime<Utc> {
        let state = self.state.read().await;
        let server = state.server();
        match kind {
            CacheKind::FileActions => server.file_actions_refreshed,
            CacheKind::Changelists => server.changelists_updated,
            CacheKind::JobStatuses => server.job_statuses_updated,
        }
    }

    /// Whether `kind` is older than its configured refresh interval.
    pub async fn needs_refresh(&self, kind: CacheKind) -> bool {
        let interval = match kind {
            CacheKind::FileActions => self.settings.file_actions_refresh(),
            CacheKind::Changelists => self.settings.changelist_refresh(),
            CacheKind::JobStatuses => self.settings.job_status_refresh(),
        };
        let last = self.last_refreshed(kind).await;
        Utc::now().signed_duration_since(last) >= interval
    }

    /// Directories, files matching an ignore pattern, and files outside
    /// the known workspace roots are ignored.
    pub async fn is_ignored(&self, file: &FilePath) -> bool {
        if file.is_dir() {
            return true;
        }
        let roots = self.client_roots().await;
        let relative = roots.iter().find_map(|root| file.relative_to(root));
        if !roots.is_empty() && relative.is_none() {
            return true;
        }
        match file.file_name() {
            Some(name) => self.ignore.is_match(&name, relative.as_deref()),
            None => true,
        }
    }

    async fn record(&self, file: &FilePath, action: FileUpdateAction, changelist: i32) -> Option<PendingUpdateState> {
        let mut state = self.state.write().await;
        if !state.record_local(file, action, changelist) {
            return None;
        }
        debug!(client = %self.client, file = %file, ?action, changelist, "local update recorded");
        Some(PendingUpdateState::for_file(action.update_action(), file, changelist))
    }

    /// Open a file for add, or edit if the server knows it.
    pub async fn add_or_edit_file(&self, file: &FilePath, changelist: i32) -> Option<PendingUpdateState> {
        self.record(file, FileUpdateAction::AddEdit, changelist).await
    }

    /// Open a file for edit.
    pub async fn edit_file(&self, file: &FilePath, changelist: i32) -> Option<PendingUpdateState> {
        self.record(file, FileUpdateAction::Edit, changelist).await
    }

    pub async fn delete_file(&self, file: &FilePath, changelist: i32) -> Option<PendingUpdateState> {
        self.record(file, FileUpdateAction::Delete, changelist).await
    }

    /// Move `source` to `target`: the target is recorded as moved, the source as move-deleted.
    pub async fn move_file(
        &self,
        source: &FilePath,
        target: &FilePath,
        changelist: i32,
    ) -> Option<PendingUpdateState> {
        let mut state = self.state.write().await;
        let target_new = state.record_local(target, FileUpdateAction::Move, changelist);
        let source_new = state.record_local(source, FileUpdateAction::MoveDelete, changelist);
        if !target_new && !source_new {
            return None;
        }
        debug!(client = %self.client, source = %source, target = %target, changelist, "local move recorded");
        Some(PendingUpdateState::for_move(source, target, changelist))
    }

    pub async fn integrate_file(
        &self,
        source: &FilePath,
        target: &FilePath,
        changelist: i32,
    ) -> Option<PendingUpdateState> {
        let mut state = self.state.write().await;
        if !state.record_local(target, FileUpdateAction::Integrate, changelist) {
            return None;
        }
        Some(PendingUpdateState::for_integrate(source, target, changelist))
    }

    /// Drop the local intention for a file, returning a server revert if one is needed.
    pub async fn revert_file(&self, file: &FilePath) -> Option<PendingUpdateState> {
        self.state.write().await.revert_local(file)
    }

    /// Append updates to the queue.
    pub async fn queue(&self, updates: Vec<PendingUpdateState>) {
        let mut state = self.state.write().await;
        for update in updates {
            state.queue(update);
        }
    }

    pub(crate) async fn take_group(&self) -> Option<ActionGroup> {
        self.state.write().await.take_group()
    }

    pub(crate) async fn requeue_front(&self, group: ActionGroup) {
        self.state.write().await.requeue_front(group);
    }

    /// Drop every queued update.
    pub async fn clear_pending(&self) -> usize {
        self.state.write().await.clear_pending()
    }

    /// Settle pending local entries for `files` recorded up to `revision`.
    pub async fn mark_resolved(&self, files: &[FilePath], status: FileUpdateStatus, revision: u64) -> usize {
        if files.is_empty() {
            return 0;
        }
        self.state.write().await.mark_resolved(files, status, revision)
    }

    /// Install a fresh server listing of open files.
    #[instrument(skip(self, statuses, alerts), fields(client = %self.client, records = statuses.len()))]
    pub(crate) async fn apply_opened_files(&self, statuses: Vec<ExtendedFileStatus>, alerts: &AlertManager) {
        let invalid = self.state.write().await.replace_server_files(statuses);
        if !invalid.is_empty() {
            let message = invalid
                .iter()
                .map(|status| match (&status.depot_path, &status.open_action) {
                    (Some(depot), Some(action)) => format!("{}: unsupported action {}", depot, action),
                    _ => status.describe(),
                })
                .collect::<Vec<_>>()
                .join("\n");
            alerts.notice("Open files", message, Vec::new());
        }
    }

    pub(crate) async fn set_roots(&self, roots: Vec<FilePath>) {
        self.state.write().await.set_roots(roots);
    }

    pub(crate) async fn set_changelists(&self, changelists: Vec<ChangeList>) {
        self.state.write().await.set_changelists(changelists);
    }

    pub(crate) async fn set_job_statuses(&self, statuses: Vec<String>) {
        self.state.write().await.set_job_statuses(statuses);
    }

    pub(crate) async fn add_changelist(&self, changelist: ChangeList) {
        self.state.write().await.add_changelist(changelist);
    }

    /// Discard cached server state so the next read reloads it.
    pub async fn flush(&self, include_local: bool) {
        self.state.write().await.flush(include_local);
    }

    pub async fn to_document(&self) -> ClientStateDocument {
        self.state.read().await.to_document()
    }

    /// Queued action kinds, front first.
    pub async fn pending_actions(&self) -> Vec<UpdateAction> {
        self.state.read().await.pending().iter().map(|u| u.action).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileAction;
    use pretty_assertions::assert_eq;

    fn fp(path: &str) -> FilePath {
        FilePath::new(path)
    }

    fn manager(config: ServerConfig) -> ClientCacheManager {
        let client = ClientServerId::new(config.id(), Some("ws".into()));
        let state = ClientLocalServerState::new(client.clone(), false);
        ClientCacheManager::new(config, Arc::new(CacheSettings::default()), Arc::new(RwLock::new(state)), client)
    }

    #[tokio::test]
    async fn test_edit_twice_creates_one_update() {
        let mgr = manager(ServerConfig::new("p4:1666", "u"));
        let first = mgr.edit_file(&fp("/ws/a"), 0).await;
        assert_eq!(first.unwrap().action, UpdateAction::EditFile);
        assert!(mgr.edit_file(&fp("/ws/a"), 0).await.is_none());
        assert_eq!(mgr.open_files().await.len(), 1);
    }

    #[tokio::test]
    async fn test_move_records_both_sides() {
        let mgr = manager(ServerConfig::new("p4:1666", "u"));
        let update = mgr.move_file(&fp("/ws/old"), &fp("/ws/new"), 2).await.unwrap();
        assert_eq!(update.action, UpdateAction::MoveFile);

        let mut actions: Vec<_> = mgr
            .open_files()
            .await
            .into_iter()
            .map(|f| (f.local_path.unwrap(), f.action))
            .collect();
        actions.sort();
        assert_eq!(
            actions,
            vec![
                (fp("/ws/new"), FileUpdateAction::Move),
                (fp("/ws/old"), FileUpdateAction::MoveDelete),
            ]
        );
    }

    #[tokio::test]
    async fn test_ignore_rules() {
        let dir = tempfile::tempdir().unwrap();
        let root = FilePath::new(dir.path());
        let mgr = manager(ServerConfig::new("p4:1666", "u").with_ignore_pattern("*.log"));

        // No roots known yet: only patterns and directories apply.
        assert!(!mgr.is_ignored(&fp("/anywhere/a.txt")).await);
        assert!(mgr.is_ignored(&fp("/anywhere/a.log")).await);
        assert!(mgr.is_ignored(&root).await);

        mgr.set_roots(vec![root.clone()]).await;
        let inside = FilePath::new(dir.path().join("src").join("main.rs"));
        assert!(!mgr.is_ignored(&inside).await);
        assert!(mgr.is_ignored(&fp("/anywhere/a.txt")).await);
    }

    #[tokio::test]
    async fn test_refresh_schedule() {
        let mgr = manager(ServerConfig::new("p4:1666", "u"));
        assert!(mgr.needs_refresh(CacheKind::JobStatuses).await);
        mgr.set_job_statuses(vec!["open".into()]).await;
        assert!(!mgr.needs_refresh(CacheKind::JobStatuses).await);

        // Interval 0 refreshes on every read.
        mgr.apply_opened_files(Vec::new(), &AlertManager::new()).await;
        assert!(mgr.needs_refresh(CacheKind::FileActions).await);
    }

    #[tokio::test]
    async fn test_unsupported_server_actions_raise_notice() {
        let mgr = manager(ServerConfig::new("p4:1666", "u"));
        let alerts = AlertManager::new();
        let mut rx = alerts.subscribe();
        mgr.apply_opened_files(
            vec![ExtendedFileStatus::valid(
                "//depot/a",
                Some("/ws/a".into()),
                Some(FileAction::Other("archive".into())),
                None,
            )],
            &alerts,
        )
        .await;

        let alert = rx.try_recv().unwrap();
        assert!(alert.message.contains("unsupported action archive"));
        assert!(mgr.open_files().await.is_empty());
    }
}

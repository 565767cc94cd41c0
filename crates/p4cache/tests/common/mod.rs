//! In-memory server used by the integration tests.
//!
//! Keeps a tiny depot keyed by local path under a single workspace root and
//! records every command that reaches it, so tests can assert exactly what
//! was sent and how often.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use p4cache::{
    AlertManager, CacheSettings, CentralCacheManager, ChangeList, ClientServerId, ConnectorError,
    ConnectorFactory, ConnectorResult, ExtendedFileStatus, FileAction, FilePath, FileResult,
    MemoryStore, P4CacheContext, ServerConfig, ServerConnection, ServerConnector, ServerInfo,
    ServerStatus,
};

pub const ROOT: &str = "/ws";
pub const CLIENT: &str = "ws";

pub fn path(name: &str) -> FilePath {
    FilePath::new(format!("{}/{}", ROOT, name))
}

pub fn config() -> ServerConfig {
    ServerConfig::new("fake:1666", "alice")
}

#[derive(Debug, Default)]
pub struct FakeState {
    /// Files the depot knows, with how they are opened.
    pub files: BTreeMap<FilePath, Option<(FileAction, i32)>>,
    pub calls: Vec<String>,
    pub disconnected: bool,
    pub auth_fail: bool,
    pub hang: bool,
    /// One-shot failure for the next call of the named command.
    pub fail_next: Option<(String, ConnectorError)>,
    pub refused: HashSet<FilePath>,
    pub changelists: Vec<ChangeList>,
    pub next_changelist: i32,
    pub job_statuses: Vec<String>,
    pub case_sensitive: bool,
    pub drop_status_records: bool,
}

#[derive(Debug)]
pub struct FakeServer {
    root: FilePath,
    state: Mutex<FakeState>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            root: FilePath::new(ROOT),
            state: Mutex::new(FakeState {
                next_changelist: 1,
                case_sensitive: true,
                job_statuses: vec!["open".into(), "closed".into()],
                ..FakeState::default()
            }),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake server lock")
    }

    /// Add a submitted, unopened file to the depot.
    pub fn with_file(&self, name: &str) -> &Self {
        self.state().files.insert(path(name), None);
        self
    }

    /// Add a file already opened by the workspace.
    pub fn with_opened(&self, name: &str, action: FileAction, changelist: i32) -> &Self {
        self.state().files.insert(path(name), Some((action, changelist)));
        self
    }

    pub fn opened(&self, name: &str) -> Option<(FileAction, i32)> {
        self.state().files.get(&path(name)).cloned().flatten()
    }

    pub fn knows(&self, name: &str) -> bool {
        self.state().files.contains_key(&path(name))
    }

    pub fn set_disconnected(&self, disconnected: bool) {
        self.state().disconnected = disconnected;
    }

    pub fn fail_next(&self, op: &str, error: ConnectorError) {
        self.state().fail_next = Some((op.to_string(), error));
    }

    pub fn refuse(&self, name: &str) {
        self.state().refused.insert(path(name));
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Calls of one command, e.g. `"edit"`.
    pub fn calls_of(&self, op: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.split(' ').next() == Some(op))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    fn depot_path(&self, file: &FilePath) -> Option<String> {
        file.relative_to(&self.root)
            .map(|relative| format!("//depot/{}", relative))
    }

    async fn enter(&self, op: &str, files: &[&FilePath]) -> ConnectorResult<()> {
        let hang = {
            let mut state = self.state();
            if state.disconnected {
                return Err(ConnectorError::Disconnected("connection refused".into()));
            }
            if state.auth_fail {
                return Err(ConnectorError::Authentication("session has expired".into()));
            }
            if state.fail_next.as_ref().is_some_and(|(name, _)| name == op) {
                if let Some((_, error)) = state.fail_next.take() {
                    return Err(error);
                }
            }
            state.hang
        };
        if hang {
            std::future::pending::<()>().await;
        }
        let names: Vec<String> = files
            .iter()
            .map(|f| f.file_name().unwrap_or_default())
            .collect();
        let call = if names.is_empty() {
            op.to_string()
        } else {
            format!("{} {}", op, names.join(" "))
        };
        self.state().calls.push(call);
        Ok(())
    }

    fn status_of(&self, state: &FakeState, file: &FilePath) -> ExtendedFileStatus {
        let Some(depot) = self.depot_path(file) else {
            return ExtendedFileStatus::not_under_root(file, CLIENT);
        };
        match state.files.get(file) {
            Some(open) => ExtendedFileStatus::valid(
                depot,
                Some(file.to_string()),
                open.as_ref().map(|(action, _)| action.clone()),
                open.as_ref().map(|(_, cl)| *cl),
            ),
            None => ExtendedFileStatus::no_such_file(file),
        }
    }

    /// Apply `change` to each file not marked refused.
    fn each<F>(&self, files: &[FilePath], mut change: F) -> Vec<FileResult>
    where
        F: FnMut(&mut FakeState, &FilePath) -> Result<(), String>,
    {
        let mut state = self.state();
        files
            .iter()
            .map(|file| {
                if state.refused.contains(file) {
                    return FileResult::failed(file.clone(), "refused by trigger");
                }
                match change(&mut *state, file) {
                    Ok(()) => FileResult::ok(file.clone()),
                    Err(e) => FileResult::failed(file.clone(), e),
                }
            })
            .collect()
    }
}

fn refs(files: &[FilePath]) -> Vec<&FilePath> {
    files.iter().collect()
}

#[async_trait]
impl ServerConnector for FakeServer {
    async fn server_info(&self) -> ConnectorResult<ServerInfo> {
        self.enter("info", &[]).await?;
        Ok(ServerInfo {
            case_sensitive: self.state().case_sensitive,
            version: Some("fake/2024.1".into()),
        })
    }

    async fn client_roots(&self) -> ConnectorResult<Vec<FilePath>> {
        self.enter("client", &[]).await?;
        Ok(vec![self.root.clone()])
    }

    async fn file_status(&self, files: &[FilePath]) -> ConnectorResult<Vec<ExtendedFileStatus>> {
        self.enter("fstat", &refs(files)).await?;
        let state = self.state();
        let mut statuses: Vec<ExtendedFileStatus> =
            files.iter().map(|file| self.status_of(&state, file)).collect();
        if state.drop_status_records {
            statuses.pop();
        }
        Ok(statuses)
    }

    async fn opened_files(&self, _roots: &[FilePath]) -> ConnectorResult<Vec<ExtendedFileStatus>> {
        self.enter("opened", &[]).await?;
        let state = self.state();
        Ok(state
            .files
            .iter()
            .filter(|(_, open)| open.is_some())
            .map(|(file, _)| self.status_of(&state, file))
            .collect())
    }

    async fn add_files(&self, files: &[FilePath], changelist: i32) -> ConnectorResult<Vec<FileResult>> {
        self.enter("add", &refs(files)).await?;
        Ok(self.each(files, |state, file| {
            if state.files.contains_key(file) {
                return Err("can't add existing file".into());
            }
            state.files.insert(file.clone(), Some((FileAction::Add, changelist)));
            Ok(())
        }))
    }

    async fn edit_files(&self, files: &[FilePath], changelist: i32) -> ConnectorResult<Vec<FileResult>> {
        self.enter("edit", &refs(files)).await?;
        Ok(self.each(files, |state, file| match state.files.get_mut(file) {
            None => Err("file(s) not on client".into()),
            Some(Some(_)) => Ok(()),
            Some(open) => {
                *open = Some((FileAction::Edit, changelist));
                Ok(())
            }
        }))
    }

    async fn reopen_files(&self, files: &[FilePath], changelist: i32) -> ConnectorResult<Vec<FileResult>> {
        self.enter("reopen", &refs(files)).await?;
        Ok(self.each(files, |state, file| match state.files.get_mut(file) {
            Some(Some((_, cl))) => {
                *cl = changelist;
                Ok(())
            }
            _ => Err("file(s) not opened on this client".into()),
        }))
    }

    async fn delete_files(&self, files: &[FilePath], changelist: i32) -> ConnectorResult<Vec<FileResult>> {
        self.enter("delete", &refs(files)).await?;
        Ok(self.each(files, |state, file| match state.files.get_mut(file) {
            None => Err("file(s) not on client".into()),
            Some(Some((action, _))) => Err(format!("file(s) already opened for {}", action.as_str())),
            Some(open) => {
                *open = Some((FileAction::Delete, changelist));
                Ok(())
            }
        }))
    }

    async fn revert_files(&self, files: &[FilePath]) -> ConnectorResult<Vec<FileResult>> {
        self.enter("revert", &refs(files)).await?;
        Ok(self.each(files, |state, file| match state.files.get(file).cloned() {
            Some(Some((FileAction::Add | FileAction::MoveAdd, _))) => {
                state.files.remove(file);
                Ok(())
            }
            Some(Some(_)) => {
                state.files.insert(file.clone(), None);
                Ok(())
            }
            _ => Err("file(s) not opened on this client".into()),
        }))
    }

    async fn move_file(
        &self,
        source: &FilePath,
        target: &FilePath,
        changelist: i32,
    ) -> ConnectorResult<Vec<FileResult>> {
        self.enter("move", &[source, target]).await?;
        let mut state = self.state();
        let editable = matches!(
            state.files.get(source),
            Some(Some((FileAction::Edit | FileAction::Add, _)))
        );
        if !editable {
            return Ok(vec![FileResult::failed(target.clone(), "file not opened for edit")]);
        }
        state.files.insert(source.clone(), Some((FileAction::MoveDelete, changelist)));
        state.files.insert(target.clone(), Some((FileAction::MoveAdd, changelist)));
        Ok(vec![FileResult::ok(source.clone()), FileResult::ok(target.clone())])
    }

    async fn integrate_file(
        &self,
        source: &FilePath,
        target: &FilePath,
        changelist: i32,
    ) -> ConnectorResult<Vec<FileResult>> {
        self.enter("integrate", &[source, target]).await?;
        let mut state = self.state();
        if !state.files.contains_key(source) {
            return Ok(vec![FileResult::failed(target.clone(), "no such source file")]);
        }
        state.files.insert(target.clone(), Some((FileAction::Integrate, changelist)));
        Ok(vec![FileResult::ok(target.clone())])
    }

    async fn open_changelists(&self) -> ConnectorResult<Vec<ChangeList>> {
        self.enter("changes", &[]).await?;
        Ok(self.state().changelists.clone())
    }

    async fn create_changelist(&self, description: &str) -> ConnectorResult<i32> {
        self.enter("change", &[]).await?;
        let mut state = self.state();
        let id = state.next_changelist;
        state.next_changelist += 1;
        state.changelists.push(ChangeList {
            id,
            description: description.to_string(),
        });
        Ok(id)
    }

    async fn submit_changelist(&self, changelist: i32) -> ConnectorResult<Vec<FileResult>> {
        self.enter("submit", &[]).await?;
        let mut state = self.state();
        let submitted: Vec<(FilePath, FileAction)> = state
            .files
            .iter()
            .filter_map(|(file, open)| match open {
                Some((action, cl)) if *cl == changelist => Some((file.clone(), action.clone())),
                _ => None,
            })
            .collect();
        if submitted.is_empty() {
            return Err(ConnectorError::Command("no files to submit".into()));
        }
        for (file, action) in &submitted {
            match action {
                FileAction::Delete | FileAction::MoveDelete => {
                    state.files.remove(file);
                }
                _ => {
                    state.files.insert(file.clone(), None);
                }
            }
        }
        state.changelists.retain(|cl| cl.id != changelist);
        Ok(submitted.into_iter().map(|(file, _)| FileResult::ok(file)).collect())
    }

    async fn job_statuses(&self) -> ConnectorResult<Vec<String>> {
        self.enter("jobspec", &[]).await?;
        Ok(self.state().job_statuses.clone())
    }
}

/// Hands out the same fake for every workspace.
pub struct FakeFactory {
    server: Arc<FakeServer>,
}

impl FakeFactory {
    pub fn new(server: &Arc<FakeServer>) -> Arc<Self> {
        Arc::new(Self {
            server: Arc::clone(server),
        })
    }
}

impl ConnectorFactory for FakeFactory {
    fn connector_for(&self, _config: &ServerConfig, _client: &ClientServerId) -> Arc<dyn ServerConnector> {
        Arc::clone(&self.server) as Arc<dyn ServerConnector>
    }
}

/// Context over an in-memory store.
pub fn context(server: &Arc<FakeServer>) -> (P4CacheContext, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let context = P4CacheContext::new(
        CacheSettings::default(),
        Arc::clone(&store) as Arc<dyn p4cache::StateStore>,
        FakeFactory::new(server),
    );
    (context, store)
}

/// A connection with no replay task, so flushes only happen when a test
/// asks for them.
pub async fn connection(server: &Arc<FakeServer>) -> Arc<ServerConnection> {
    let settings = Arc::new(CacheSettings::default());
    let config = config();
    let id = ClientServerId::new(config.id(), Some(CLIENT.to_string()));
    let central = CentralCacheManager::new(Arc::new(MemoryStore::new()), Arc::clone(&settings));
    let cache = central
        .get_client_cache_manager(&id, &config, || async { Ok(false) })
        .await
        .expect("cache manager");
    Arc::new(ServerConnection::new(
        id,
        Arc::new(ServerStatus::new(config)),
        Arc::clone(server) as Arc<dyn ServerConnector>,
        cache,
        Arc::new(AlertManager::new()),
        settings,
    ))
}

/// Everything published on `rx` so far.
pub fn drain_alerts(rx: &mut tokio::sync::broadcast::Receiver<p4cache::Alert>) -> Vec<p4cache::Alert> {
    let mut alerts = Vec::new();
    while let Ok(alert) = rx.try_recv() {
        alerts.push(alert);
    }
    alerts
}

/// Wait for background work to send at least `count` calls of `op`.
pub async fn wait_for_calls(server: &FakeServer, op: &str, count: usize) -> Vec<String> {
    for _ in 0..200 {
        let calls = server.calls_of(op);
        if calls.len() >= count {
            return calls;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    server.calls_of(op)
}

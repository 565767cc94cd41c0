//! Cached workspace state.
//!
//! A workspace keeps two snapshots: `server`, the last state confirmed by
//! the server, and `local`, intentions recorded since then that the server
//! has not confirmed yet. Reads always prefer `local`. Alongside them sits
//! the queue of [`PendingUpdateState`]s waiting to be sent.

mod document;

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::mapping::{FileMappingRepo, MappingId};
use crate::types::{
    ChangeList, ClientServerId, DEFAULT_CHANGELIST, ExtendedFileStatus, FileAction, FilePath,
    OpStatus,
};

pub use document::{
    ClientStateDocument, DOCUMENT_VERSION, FileStateRecord, MappingRecord, SnapshotRecord,
};

/// Kind of change a file is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileUpdateAction {
    AddEdit,
    Edit,
    Delete,
    Move,
    MoveDelete,
    Integrate,
}

impl FileUpdateAction {
    /// Translate a server open action. Unknown actions have no translation.
    pub fn for_opened(action: &FileAction) -> Option<Self> {
        match action {
            FileAction::Add | FileAction::AddEdit | FileAction::Added => Some(Self::AddEdit),
            FileAction::Edit | FileAction::EditFrom => Some(Self::Edit),
            FileAction::MoveAdd => Some(Self::Move),
            FileAction::MoveDelete => Some(Self::MoveDelete),
            FileAction::Integrate | FileAction::Branch => Some(Self::Integrate),
            FileAction::Delete | FileAction::Deleted => Some(Self::Delete),
            FileAction::Other(_) => None,
        }
    }

    /// The queued request that produces this action.
    pub fn update_action(self) -> UpdateAction {
        match self {
            Self::AddEdit => UpdateAction::AddEditFile,
            Self::Edit => UpdateAction::EditFile,
            Self::Delete => UpdateAction::DeleteFile,
            Self::Move => UpdateAction::MoveFile,
            Self::MoveDelete => UpdateAction::MoveDeleteFile,
            Self::Integrate => UpdateAction::IntegrateFile,
        }
    }
}

/// Action carried by a pending update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateAction {
    AddEditFile,
    EditFile,
    DeleteFile,
    MoveFile,
    MoveDeleteFile,
    IntegrateFile,
    RevertFile,
}

impl fmt::Display for UpdateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AddEditFile => "add/edit",
            Self::EditFile => "edit",
            Self::DeleteFile => "delete",
            Self::MoveFile => "move",
            Self::MoveDeleteFile => "move/delete",
            Self::IntegrateFile => "integrate",
            Self::RevertFile => "revert",
        };
        f.write_str(name)
    }
}

/// How far the server has acknowledged a local update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileUpdateStatus {
    /// Recorded locally, not yet sent.
    #[default]
    Pending,
    /// The server accepted it; dropped on the next server refresh.
    Committed,
    /// The server refused it; dropped on the next server refresh.
    Rejected,
    /// Reported by the server itself.
    Confirmed,
}

/// Cached open state of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct P4FileUpdateState {
    pub mapping: MappingId,
    pub changelist: i32,
    pub action: FileUpdateAction,
    pub status: FileUpdateStatus,
    pub last_updated: DateTime<Utc>,
    /// Local recording order. Entries loaded from a document are 0.
    pub revision: u64,
}

impl P4FileUpdateState {
    pub fn new(mapping: MappingId, changelist: i32, action: FileUpdateAction) -> Self {
        Self {
            mapping,
            changelist,
            action,
            status: FileUpdateStatus::Pending,
            last_updated: Utc::now(),
            revision: 0,
        }
    }
}

/// Named parameters of a pending update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateParameter {
    File,
    FileSource,
    Changelist,
}

impl UpdateParameter {
    pub fn key(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::FileSource => "file_source",
            Self::Changelist => "changelist",
        }
    }
}

/// A request queued for the server.
///
/// `ids` holds the paths the request affects and is its identity: a newer
/// request with the same set replaces an older one in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpdateState {
    pub action: UpdateAction,
    pub ids: BTreeSet<String>,
    pub params: BTreeMap<String, String>,
}

impl PendingUpdateState {
    /// Request touching a single file.
    pub fn for_file(action: UpdateAction, file: &FilePath, changelist: i32) -> Self {
        let path = file.to_string();
        let mut params = BTreeMap::new();
        params.insert(UpdateParameter::File.key().to_string(), path.clone());
        params.insert(
            UpdateParameter::Changelist.key().to_string(),
            changelist.to_string(),
        );
        Self {
            action,
            ids: BTreeSet::from([path]),
            params,
        }
    }

    /// Move `source` to `target`. Both paths are affected.
    pub fn for_move(source: &FilePath, target: &FilePath, changelist: i32) -> Self {
        let mut update = Self::for_file(UpdateAction::MoveFile, target, changelist);
        update.ids.insert(source.to_string());
        update.params.insert(
            UpdateParameter::FileSource.key().to_string(),
            source.to_string(),
        );
        update
    }

    /// Integrate `source` into `target`. Only the target is affected.
    pub fn for_integrate(source: &FilePath, target: &FilePath, changelist: i32) -> Self {
        let mut update = Self::for_file(UpdateAction::IntegrateFile, target, changelist);
        update.params.insert(
            UpdateParameter::FileSource.key().to_string(),
            source.to_string(),
        );
        update
    }

    pub fn param(&self, param: UpdateParameter) -> Option<&str> {
        self.params.get(param.key()).map(String::as_str)
    }

    pub fn file(&self) -> Option<FilePath> {
        self.param(UpdateParameter::File).map(FilePath::new)
    }

    pub fn source(&self) -> Option<FilePath> {
        self.param(UpdateParameter::FileSource).map(FilePath::new)
    }

    /// Destination changelist; requests without one use the default.
    pub fn changelist(&self) -> i32 {
        self.param(UpdateParameter::Changelist)
            .and_then(|cl| cl.parse().ok())
            .unwrap_or(DEFAULT_CHANGELIST)
    }

    pub fn affected_files(&self) -> BTreeSet<FilePath> {
        self.ids.iter().map(FilePath::new).collect()
    }

    pub fn affects(&self, file: &FilePath) -> bool {
        self.ids.iter().any(|id| FilePath::new(id) == *file)
    }

    /// Whether both requests affect the same set of files.
    pub fn same_target(&self, other: &PendingUpdateState) -> bool {
        self.affected_files() == other.affected_files()
    }
}

/// One snapshot of a workspace: open files plus the smaller caches.
///
/// Watermarks start at the Unix epoch, which reads as "never loaded".
#[derive(Debug, Clone, Default)]
pub struct P4ClientState {
    pub files: BTreeMap<MappingId, P4FileUpdateState>,
    pub roots: Vec<FilePath>,
    pub roots_updated: DateTime<Utc>,
    pub job_statuses: Vec<String>,
    pub job_statuses_updated: DateTime<Utc>,
    pub changelists: Vec<ChangeList>,
    pub changelists_updated: DateTime<Utc>,
    pub file_actions_refreshed: DateTime<Utc>,
}

/// An opened file as presented to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct P4FileAction {
    pub depot_path: Option<String>,
    pub local_path: Option<FilePath>,
    pub action: FileUpdateAction,
    pub changelist: i32,
    pub status: FileUpdateStatus,
}

/// Group of consecutive queued updates sharing one action.
///
/// `revision` is the newest local recording the group can answer for;
/// intentions recorded after the group left the queue keep their status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionGroup {
    pub action: UpdateAction,
    pub updates: Vec<PendingUpdateState>,
    pub revision: u64,
}

impl ActionGroup {
    /// Every path the group's updates affect.
    pub fn affected_files(&self) -> Vec<FilePath> {
        let files: BTreeSet<FilePath> = self.updates.iter().flat_map(|u| u.affected_files()).collect();
        files.into_iter().collect()
    }
}

/// Everything cached for one workspace.
#[derive(Debug, Clone)]
pub struct ClientLocalServerState {
    client: ClientServerId,
    repo: FileMappingRepo,
    local: P4ClientState,
    server: P4ClientState,
    pending: VecDeque<PendingUpdateState>,
    revision: u64,
}

impl ClientLocalServerState {
    pub fn new(client: ClientServerId, case_insensitive: bool) -> Self {
        Self {
            client,
            repo: FileMappingRepo::new(case_insensitive),
            local: P4ClientState::default(),
            server: P4ClientState::default(),
            pending: VecDeque::new(),
            revision: 0,
        }
    }

    pub fn client(&self) -> &ClientServerId {
        &self.client
    }

    pub fn repo(&self) -> &FileMappingRepo {
        &self.repo
    }

    pub fn local(&self) -> &P4ClientState {
        &self.local
    }

    pub fn server(&self) -> &P4ClientState {
        &self.server
    }

    pub fn pending(&self) -> &VecDeque<PendingUpdateState> {
        &self.pending
    }

    /// Open files: the server snapshot overridden by local intentions.
    /// Rejected local entries are hidden.
    pub fn open_files(&self) -> Vec<P4FileAction> {
        let mut merged: BTreeMap<MappingId, &P4FileUpdateState> = BTreeMap::new();
        for (id, state) in &self.server.files {
            merged.insert(self.repo.resolve(*id), state);
        }
        for (id, state) in &self.local.files {
            let id = self.repo.resolve(*id);
            if state.status == FileUpdateStatus::Rejected {
                continue;
            }
            merged.insert(id, state);
        }
        merged
            .into_iter()
            .map(|(id, state)| {
                let mapping = self.repo.get(id);
                P4FileAction {
                    depot_path: mapping.and_then(|m| m.depot_path()).map(str::to_string),
                    local_path: mapping.and_then(|m| m.local_path()).cloned(),
                    action: state.action,
                    changelist: state.changelist,
                    status: state.status,
                }
            })
            .collect()
    }

    /// Cached state for a file, local first. Rejected local entries are
    /// skipped.
    pub fn cached_state(&self, file: &FilePath) -> Option<&P4FileUpdateState> {
        let id = self.repo.find_by_location(file)?;
        lookup(&self.local.files, &self.repo, id)
            .filter(|state| state.status != FileUpdateStatus::Rejected)
            .or_else(|| lookup(&self.server.files, &self.repo, id))
    }

    /// Record a local intention for `file`.
    ///
    /// Returns `false` without changing anything when the file is already
    /// cached with the same action in the same changelist.
    pub fn record_local(&mut self, file: &FilePath, action: FileUpdateAction, changelist: i32) -> bool {
        if self
            .cached_state(file)
            .is_some_and(|state| state.action == action && state.changelist == changelist)
        {
            trace!(file = %file, ?action, changelist, "file already cached with action");
            return false;
        }
        let id = self.repo.get_by_location(file);
        let repo = &self.repo;
        let resolved = repo.resolve(id);
        self.local.files.retain(|key, _| repo.resolve(*key) != resolved);
        self.revision += 1;
        let mut state = P4FileUpdateState::new(id, changelist, action);
        state.revision = self.revision;
        self.local.files.insert(id, state);
        true
    }

    /// Queue an update. An older queued update for the same files is
    /// replaced. Returns `true` if one was replaced.
    pub fn queue(&mut self, update: PendingUpdateState) -> bool {
        let before = self.pending.len();
        self.pending.retain(|queued| !queued.same_target(&update));
        let replaced = self.pending.len() != before;
        debug!(client = %self.client, action = %update.action, replaced, "update queued");
        self.pending.push_back(update);
        replaced
    }

    /// Pop the run of updates at the front of the queue that share an action.
    pub fn take_group(&mut self) -> Option<ActionGroup> {
        let first = self.pending.pop_front()?;
        let action = first.action;
        let mut updates = vec![first];
        while self.pending.front().is_some_and(|next| next.action == action) {
            if let Some(next) = self.pending.pop_front() {
                updates.push(next);
            }
        }
        Some(ActionGroup {
            action,
            updates,
            revision: self.revision,
        })
    }

    /// Put a group back at the front of the queue. Updates superseded while
    /// the group was out are dropped.
    pub fn requeue_front(&mut self, group: ActionGroup) {
        for update in group.updates.into_iter().rev() {
            if self.pending.iter().any(|queued| queued.same_target(&update)) {
                trace!(action = %update.action, "requeue skipped, superseded");
                continue;
            }
            self.pending.push_front(update);
        }
    }

    /// Drop all queued updates. Returns how many were dropped.
    pub fn clear_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Mark pending local entries for `files` with the server's verdict.
    ///
    /// Only entries recorded at or before `revision` change; a newer
    /// intention for the same file stays pending. Returns how many changed.
    pub fn mark_resolved(&mut self, files: &[FilePath], status: FileUpdateStatus, revision: u64) -> usize {
        let mut changed = 0;
        for file in files {
            let Some(id) = self.repo.find_by_location(file) else {
                continue;
            };
            let id = self.repo.resolve(id);
            for (key, state) in self.local.files.iter_mut() {
                if self.repo.resolve(*key) == id
                    && state.status == FileUpdateStatus::Pending
                    && state.revision <= revision
                {
                    state.status = status;
                    state.last_updated = Utc::now();
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Forget the local intention for `file`.
    ///
    /// Queued updates touching the file are cancelled. If the server still
    /// has the file open, a revert request is returned for queueing.
    pub fn revert_local(&mut self, file: &FilePath) -> Option<PendingUpdateState> {
        self.pending.retain(|queued| !queued.affects(file));
        let id = self.repo.find_by_location(file)?;
        let id = self.repo.resolve(id);
        let repo = &self.repo;
        self.local.files.retain(|key, _| repo.resolve(*key) != id);
        lookup(&self.server.files, &self.repo, id)
            .map(|_| PendingUpdateState::for_file(UpdateAction::RevertFile, file, DEFAULT_CHANGELIST))
    }

    /// Replace the server snapshot of open files.
    ///
    /// Local entries the server has already answered for are dropped.
    /// Returns the records that could not be turned into cache entries.
    pub fn replace_server_files(&mut self, statuses: Vec<ExtendedFileStatus>) -> Vec<ExtendedFileStatus> {
        let mut files = BTreeMap::new();
        let mut invalid = Vec::new();
        for status in statuses {
            let action = status.open_action.as_ref().and_then(FileUpdateAction::for_opened);
            let (Some(action), Some(depot), OpStatus::Valid) =
                (action, status.depot_path.as_deref(), status.op_status)
            else {
                invalid.push(status);
                continue;
            };
            let local = status.client_path.as_deref().map(FilePath::new);
            let id = self.repo.get_by_depot_location(depot, local.as_ref());
            let mut state =
                P4FileUpdateState::new(id, status.changelist.unwrap_or(DEFAULT_CHANGELIST), action);
            state.status = FileUpdateStatus::Confirmed;
            files.insert(id, state);
        }
        self.server.files = files;
        self.server.file_actions_refreshed = Utc::now();
        self.local
            .files
            .retain(|_, state| state.status == FileUpdateStatus::Pending);
        self.canonicalize();
        self.prune_mappings();
        invalid
    }

    pub fn set_roots(&mut self, roots: Vec<FilePath>) {
        self.server.roots = roots;
        self.server.roots_updated = Utc::now();
    }

    pub fn set_changelists(&mut self, changelists: Vec<ChangeList>) {
        self.server.changelists = changelists;
        self.server.changelists_updated = Utc::now();
    }

    pub fn set_job_statuses(&mut self, statuses: Vec<String>) {
        self.server.job_statuses = statuses;
        self.server.job_statuses_updated = Utc::now();
    }

    /// Add a changelist created on the server without waiting for a refresh.
    pub fn add_changelist(&mut self, changelist: ChangeList) {
        self.server.changelists.retain(|cl| cl.id != changelist.id);
        self.server.changelists.push(changelist);
    }

    /// Discard the server snapshot, and the local one too when asked, so
    /// the next read reloads from the server. Queued updates survive.
    pub fn flush(&mut self, include_local: bool) {
        self.server = P4ClientState::default();
        if include_local {
            self.local = P4ClientState::default();
        }
        self.prune_mappings();
    }

    /// Re-key snapshots after mapping merges so each file has one entry.
    fn canonicalize(&mut self) {
        for snapshot in [&mut self.local, &mut self.server] {
            if snapshot.files.keys().all(|id| self.repo.resolve(*id) == *id) {
                continue;
            }
            let mut rekeyed: BTreeMap<MappingId, P4FileUpdateState> = BTreeMap::new();
            for (id, mut state) in std::mem::take(&mut snapshot.files) {
                let id = self.repo.resolve(id);
                state.mapping = id;
                match rekeyed.get(&id) {
                    Some(existing) if existing.last_updated >= state.last_updated => {}
                    _ => {
                        rekeyed.insert(id, state);
                    }
                }
            }
            snapshot.files = rekeyed;
        }
    }

    fn prune_mappings(&mut self) {
        let mut live: HashSet<MappingId> = HashSet::new();
        live.extend(self.local.files.keys().copied());
        live.extend(self.server.files.keys().copied());
        // Paths named by queued updates keep their mappings too.
        for update in &self.pending {
            for file in update.affected_files() {
                if let Some(id) = self.repo.find_by_location(&file) {
                    live.insert(id);
                }
            }
        }
        self.repo.retain_referenced(&live);
    }

    /// Rebuild from already-validated parts. Used by document loading.
    pub(crate) fn from_parts(
        client: ClientServerId,
        repo: FileMappingRepo,
        local: P4ClientState,
        server: P4ClientState,
        pending: VecDeque<PendingUpdateState>,
    ) -> Self {
        let mut state = Self {
            client,
            repo,
            local,
            server,
            pending,
            revision: 0,
        };
        state.canonicalize();
        state
    }
}

fn lookup<'a>(
    files: &'a BTreeMap<MappingId, P4FileUpdateState>,
    repo: &FileMappingRepo,
    id: MappingId,
) -> Option<&'a P4FileUpdateState> {
    if let Some(state) = files.get(&id) {
        return Some(state);
    }
    files
        .iter()
        .find(|(key, _)| repo.resolve(**key) == id)
        .map(|(_, state)| state)
}

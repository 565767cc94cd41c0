//! Core value types shared across the cache.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Changelist id used when a request names none.
pub const DEFAULT_CHANGELIST: i32 = 0;

/// Whether the local filesystem compares file names case-insensitively.
pub const CASE_INSENSITIVE_FS: bool = cfg!(any(windows, target_os = "macos"));

/// Identity of one workspace: a server configuration plus a client name.
///
/// A missing client name is legal while configuration is incomplete, but no
/// cache can be created for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientServerId {
    server_config_id: String,
    client_name: Option<String>,
}

impl ClientServerId {
    pub fn new(server_config_id: impl Into<String>, client_name: Option<String>) -> Self {
        Self {
            server_config_id: server_config_id.into(),
            client_name,
        }
    }

    pub fn server_config_id(&self) -> &str {
        &self.server_config_id
    }

    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }
}

impl fmt::Display for ClientServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.client_name {
            Some(client) => write!(f, "{}/{}", self.server_config_id, client),
            None => write!(f, "{}/<no client>", self.server_config_id),
        }
    }
}

/// An absolute, lexically normalized local path.
///
/// Equality, hashing and ordering follow the local filesystem's notion of
/// identity, so on case-insensitive platforms `A.txt` and `a.txt` are the
/// same file.
#[derive(Clone)]
pub struct FilePath {
    path: PathBuf,
    key: String,
}

impl FilePath {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        };
        let path = normalize(&absolute);
        let key = identity_key(&path);
        Self { path, key }
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> Option<String> {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    /// Whether the path currently names a directory on disk.
    pub fn is_dir(&self) -> bool {
        self.path.is_dir()
    }

    /// Whether this path is `root` or lies beneath it.
    pub fn starts_with(&self, root: &FilePath) -> bool {
        self.relative_to(root).is_some()
    }

    /// Path below `root` with `/` separators, `""` for the root itself.
    pub fn relative_to(&self, root: &FilePath) -> Option<String> {
        let rest = self.key.strip_prefix(root.key.as_str())?;
        if rest.is_empty() {
            return Some(String::new());
        }
        let rest = if root.key.ends_with('/') {
            rest
        } else {
            rest.strip_prefix('/')?
        };
        // Slice the original spelling, not the folded key.
        let original = self.path_string();
        let start = original.len().saturating_sub(rest.len());
        Some(original.get(start..).unwrap_or(rest).to_string())
    }

    fn path_string(&self) -> String {
        self.path.to_string_lossy().replace('\\', "/")
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn identity_key(path: &Path) -> String {
    let key = path.to_string_lossy().replace('\\', "/");
    if CASE_INSENSITIVE_FS {
        key.to_lowercase()
    } else {
        key
    }
}

impl PartialEq for FilePath {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for FilePath {}

impl Hash for FilePath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialOrd for FilePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FilePath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl fmt::Debug for FilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FilePath({})", self.path.display())
    }
}

impl fmt::Display for FilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl From<&str> for FilePath {
    fn from(path: &str) -> Self {
        FilePath::new(path)
    }
}

impl Serialize for FilePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.path.to_string_lossy())
    }
}

impl<'de> Deserialize<'de> for FilePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(FilePath::new(raw))
    }
}

/// Open action reported by the server for a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FileAction {
    Add,
    AddEdit,
    Added,
    Edit,
    EditFrom,
    MoveAdd,
    Integrate,
    Branch,
    MoveDelete,
    Delete,
    Deleted,
    /// Any action the cache has no special handling for.
    Other(String),
}

impl FileAction {
    pub fn parse(name: &str) -> Self {
        match name {
            "add" => FileAction::Add,
            "add/edit" => FileAction::AddEdit,
            "added" => FileAction::Added,
            "edit" => FileAction::Edit,
            "edit_from" => FileAction::EditFrom,
            "move/add" => FileAction::MoveAdd,
            "integrate" => FileAction::Integrate,
            "branch" => FileAction::Branch,
            "move/delete" => FileAction::MoveDelete,
            "delete" => FileAction::Delete,
            "deleted" => FileAction::Deleted,
            other => FileAction::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FileAction::Add => "add",
            FileAction::AddEdit => "add/edit",
            FileAction::Added => "added",
            FileAction::Edit => "edit",
            FileAction::EditFrom => "edit_from",
            FileAction::MoveAdd => "move/add",
            FileAction::Integrate => "integrate",
            FileAction::Branch => "branch",
            FileAction::MoveDelete => "move/delete",
            FileAction::Delete => "delete",
            FileAction::Deleted => "deleted",
            FileAction::Other(name) => name,
        }
    }
}

impl From<String> for FileAction {
    fn from(name: String) -> Self {
        FileAction::parse(&name)
    }
}

impl From<FileAction> for String {
    fn from(action: FileAction) -> Self {
        action.as_str().to_string()
    }
}

impl fmt::Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a server status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Valid,
    Info,
    Error,
    ClientError,
    Unknown,
}

/// Generic code attached to an error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GenericCode {
    /// The command matched no files.
    Empty,
    Other(u32),
}

const NOT_UNDER_ROOT: &str = " is not under client's root ";
const NO_SUCH_FILE: &str = " - no such file(s).";

/// One status record returned by a server file query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedFileStatus {
    pub op_status: OpStatus,
    pub generic: Option<GenericCode>,
    pub message: Option<String>,
    pub depot_path: Option<String>,
    pub client_path: Option<String>,
    pub open_action: Option<FileAction>,
    pub changelist: Option<i32>,
}

impl ExtendedFileStatus {
    /// A valid record for a file known to the server.
    pub fn valid(
        depot_path: impl Into<String>,
        client_path: Option<String>,
        open_action: Option<FileAction>,
        changelist: Option<i32>,
    ) -> Self {
        Self {
            op_status: OpStatus::Valid,
            generic: None,
            message: None,
            depot_path: Some(depot_path.into()),
            client_path,
            open_action,
            changelist,
        }
    }

    /// A record carrying only a message.
    pub fn message(op_status: OpStatus, message: impl Into<String>) -> Self {
        Self {
            op_status,
            generic: None,
            message: Some(message.into()),
            depot_path: None,
            client_path: None,
            open_action: None,
            changelist: None,
        }
    }

    /// Error record the server emits for a file it has never seen.
    pub fn no_such_file(path: &FilePath) -> Self {
        let mut status = Self::message(OpStatus::Error, format!("{}{}", path, NO_SUCH_FILE));
        status.generic = Some(GenericCode::Empty);
        status
    }

    /// Error record the server emits for a file outside the client view.
    pub fn not_under_root(path: &FilePath, client: &str) -> Self {
        Self::message(
            OpStatus::Error,
            format!("Path '{}'{}'{}'.", path, NOT_UNDER_ROOT, client),
        )
    }

    /// Informational records do not describe a requested file.
    pub fn is_status_message(&self) -> bool {
        matches!(
            self.op_status,
            OpStatus::Info | OpStatus::ClientError | OpStatus::Unknown
        )
    }

    pub fn is_not_in_client_view(&self) -> bool {
        self.op_status == OpStatus::Error
            && self
                .message
                .as_deref()
                .is_some_and(|m| m.contains(NOT_UNDER_ROOT))
    }

    pub fn is_not_known_to_server(&self) -> bool {
        self.op_status == OpStatus::Error
            && (self.generic == Some(GenericCode::Empty)
                || self
                    .message
                    .as_deref()
                    .is_some_and(|m| m.contains(NO_SUCH_FILE)))
    }

    /// Text to show a user for a non-valid record.
    pub fn describe(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| format!("{:?} status without message", self.op_status))
    }
}

/// Per-file outcome of a bulk server call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileResult {
    pub file: FilePath,
    pub error: Option<String>,
}

impl FileResult {
    pub fn ok(file: FilePath) -> Self {
        Self { file, error: None }
    }

    pub fn failed(file: FilePath, error: impl Into<String>) -> Self {
        Self {
            file,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// A pending changelist owned by the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeList {
    pub id: i32,
    pub description: String,
}

/// Facts about the server that the cache needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub case_sensitive: bool,
    pub version: Option<String>,
}

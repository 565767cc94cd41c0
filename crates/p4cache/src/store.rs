//! Durable storage for workspace documents.

use std::io::Write;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::Result;
use crate::state::ClientStateDocument;
use crate::types::ClientServerId;

/// Load/save boundary for [`ClientStateDocument`]s.
pub trait StateStore: Send + Sync {
    /// Load the document for a workspace, if one was saved.
    fn load(&self, client: &ClientServerId) -> Result<Option<ClientStateDocument>>;

    /// Save a document, replacing any previous one for the same workspace.
    fn save(&self, doc: &ClientStateDocument) -> Result<()>;

    /// Remove a workspace's document. Removing a missing document is not an error.
    fn remove(&self, client: &ClientServerId) -> Result<()>;

    /// Workspaces with a saved document.
    fn list(&self) -> Result<Vec<ClientServerId>>;
}

/// One JSON file per workspace in a directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open a store, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding a workspace's document.
    pub fn path_for(&self, client: &ClientServerId) -> PathBuf {
        self.dir.join(file_name(client))
    }
}

fn file_name(client: &ClientServerId) -> String {
    let id = client.to_string();
    let readable: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .take(64)
        .collect();
    let hash = blake3::hash(id.as_bytes()).to_hex();
    format!("{}-{}.json", readable, &hash.as_str()[..16])
}

impl StateStore for JsonFileStore {
    fn load(&self, client: &ClientServerId) -> Result<Option<ClientStateDocument>> {
        let path = self.path_for(client);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let doc: ClientStateDocument = serde_json::from_str(&raw)?;
        debug!(client = %client, path = %path.display(), "state document loaded");
        Ok(Some(doc))
    }

    fn save(&self, doc: &ClientStateDocument) -> Result<()> {
        let path = self.path_for(&doc.client);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(&mut tmp, doc)?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        debug!(client = %doc.client, path = %path.display(), "state document saved");
        Ok(())
    }

    fn remove(&self, client: &ClientServerId) -> Result<()> {
        match std::fs::remove_file(self.path_for(client)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<ClientServerId>> {
        let mut clients = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .map_err(crate::error::CacheError::from)
                .and_then(|raw| Ok(serde_json::from_str::<ClientStateDocument>(&raw)?));
            match parsed {
                Ok(doc) => clients.push(doc.client),
                Err(e) => warn!(path = %path.display(), error = %e, "unreadable state document"),
            }
        }
        clients.sort();
        Ok(clients)
    }
}

/// In-memory store. Documents still pass through JSON so tests exercise
/// the same encoding as the file store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: DashMap<ClientServerId, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

impl StateStore for MemoryStore {
    fn load(&self, client: &ClientServerId) -> Result<Option<ClientStateDocument>> {
        match self.docs.get(client) {
            Some(raw) => Ok(Some(serde_json::from_str(raw.value())?)),
            None => Ok(None),
        }
    }

    fn save(&self, doc: &ClientStateDocument) -> Result<()> {
        let raw = serde_json::to_string(doc)?;
        self.docs.insert(doc.client.clone(), raw);
        Ok(())
    }

    fn remove(&self, client: &ClientServerId) -> Result<()> {
        self.docs.remove(client);
        Ok(())
    }

    fn list(&self) -> Result<Vec<ClientServerId>> {
        let mut clients: Vec<_> = self.docs.iter().map(|e| e.key().clone()).collect();
        clients.sort();
        Ok(clients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ClientLocalServerState, FileUpdateAction};
    use crate::types::FilePath;
    use pretty_assertions::assert_eq;

    fn doc(client: &str) -> ClientStateDocument {
        let mut state =
            ClientLocalServerState::new(ClientServerId::new("u@p4:1666", Some(client.into())), false);
        state.record_local(&FilePath::new("/ws/a"), FileUpdateAction::Edit, 0);
        state.to_document()
    }

    #[test]
    fn test_json_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("state")).unwrap();
        let saved = doc("ws1");

        store.save(&saved).unwrap();
        let loaded = store.load(&saved.client).unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(store.list().unwrap(), vec![saved.client.clone()]);

        store.remove(&saved.client).unwrap();
        assert!(store.load(&saved.client).unwrap().is_none());
        store.remove(&saved.client).unwrap();
    }

    #[test]
    fn test_json_file_store_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let mut saved = doc("ws1");
        store.save(&saved).unwrap();
        saved.pending.clear();
        saved.local.job_statuses = vec!["open".into()];
        store.save(&saved).unwrap();

        assert_eq!(store.load(&saved.client).unwrap().unwrap(), saved);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_json_file_store_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("junk.json"), "{not json").unwrap();
        store.save(&doc("ws2")).unwrap();

        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_file_names_are_distinct() {
        let a = ClientServerId::new("u@p4:1666", Some("a/b".into()));
        let b = ClientServerId::new("u@p4:1666", Some("a_b".into()));
        assert_ne!(file_name(&a), file_name(&b));
    }

    #[test]
    fn test_file_name_is_readable_and_stable() {
        let id = ClientServerId::new("u@p4:1666", Some("ws".into()));
        let name = file_name(&id);
        let expected = blake3::hash(id.to_string().as_bytes()).to_hex();
        assert!(name.ends_with(&format!("-{}.json", &expected.as_str()[..16])));
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'));
        assert_eq!(name, file_name(&id.clone()));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        let saved = doc("ws1");
        store.save(&saved).unwrap();
        assert_eq!(store.load(&saved.client).unwrap(), Some(saved.clone()));
        assert_eq!(store.len(), 1);
        store.remove(&saved.client).unwrap();
        assert!(store.is_empty());
    }
}

//! Durable form of a workspace's cached state.
//!
//! Update-state records point at mappings through a per-document reference
//! table, so a mapping shared by the local and server snapshots is written
//! once and comes back as one mapping.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{
    ClientLocalServerState, FileUpdateAction, FileUpdateStatus, P4ClientState, P4FileUpdateState,
    PendingUpdateState,
};
use crate::error::{CacheError, Result};
use crate::mapping::{FileMappingRepo, MappingId};
use crate::types::{ChangeList, ClientServerId, FilePath};

/// Current document format.
pub const DOCUMENT_VERSION: u32 = 1;

/// Persisted state of one workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientStateDocument {
    pub version: u32,
    pub client: ClientServerId,
    pub case_insensitive: bool,
    pub mappings: Vec<MappingRecord>,
    #[serde(default)]
    pub local: SnapshotRecord,
    #[serde(default)]
    pub server: SnapshotRecord,
    #[serde(default)]
    pub pending: Vec<PendingUpdateState>,
}

/// Entry of the mapping reference table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecord {
    #[serde(rename = "ref")]
    pub reference: u32,
    pub depot: Option<String>,
    pub local: Option<FilePath>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotRecord {
    pub files: Vec<FileStateRecord>,
    pub roots: Vec<FilePath>,
    pub roots_updated: DateTime<Utc>,
    pub job_statuses: Vec<String>,
    pub job_statuses_updated: DateTime<Utc>,
    pub changelists: Vec<ChangeList>,
    pub changelists_updated: DateTime<Utc>,
    pub file_actions_refreshed: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStateRecord {
    pub mapping: u32,
    pub changelist: i32,
    pub action: FileUpdateAction,
    pub status: FileUpdateStatus,
    pub last_updated: DateTime<Utc>,
}

#[derive(Default)]
struct EncodeReferences {
    refs: HashMap<MappingId, u32>,
    records: Vec<MappingRecord>,
}

impl EncodeReferences {
    fn reference(&mut self, repo: &FileMappingRepo, id: MappingId) -> Option<u32> {
        let id = repo.resolve(id);
        if let Some(&reference) = self.refs.get(&id) {
            return Some(reference);
        }
        let mapping = repo.get(id)?;
        let reference = u32::try_from(self.records.len()).ok()?;
        self.refs.insert(id, reference);
        self.records.push(MappingRecord {
            reference,
            depot: mapping.depot_path().map(str::to_string),
            local: mapping.local_path().cloned(),
        });
        Some(reference)
    }

    fn snapshot(&mut self, repo: &FileMappingRepo, state: &P4ClientState) -> SnapshotRecord {
        let files = state
            .files
            .values()
            .filter_map(|file| {
                let Some(mapping) = self.reference(repo, file.mapping) else {
                    warn!(mapping = ?file.mapping, "update state without mapping not persisted");
                    return None;
                };
                Some(FileStateRecord {
                    mapping,
                    changelist: file.changelist,
                    action: file.action,
                    status: file.status,
                    last_updated: file.last_updated,
                })
            })
            .collect();
        SnapshotRecord {
            files,
            roots: state.roots.clone(),
            roots_updated: state.roots_updated,
            job_statuses: state.job_statuses.clone(),
            job_statuses_updated: state.job_statuses_updated,
            changelists: state.changelists.clone(),
            changelists_updated: state.changelists_updated,
            file_actions_refreshed: state.file_actions_refreshed,
        }
    }
}

fn decode_snapshot(
    record: SnapshotRecord,
    refs: &HashMap<u32, MappingId>,
    client: &ClientServerId,
) -> P4ClientState {
    let mut files = BTreeMap::new();
    for file in record.files {
        let Some(&id) = refs.get(&file.mapping) else {
            warn!(client = %client, reference = file.mapping, "dangling mapping reference, record skipped");
            continue;
        };
        files.insert(
            id,
            P4FileUpdateState {
                mapping: id,
                changelist: file.changelist,
                action: file.action,
                status: file.status,
                last_updated: file.last_updated,
                revision: 0,
            },
        );
    }
    P4ClientState {
        files,
        roots: record.roots,
        roots_updated: record.roots_updated,
        job_statuses: record.job_statuses,
        job_statuses_updated: record.job_statuses_updated,
        changelists: record.changelists,
        changelists_updated: record.changelists_updated,
        file_actions_refreshed: record.file_actions_refreshed,
    }
}

impl ClientLocalServerState {
    /// Serialize into a document.
    pub fn to_document(&self) -> ClientStateDocument {
        let mut refs = EncodeReferences::default();
        let local = refs.snapshot(self.repo(), self.local());
        let server = refs.snapshot(self.repo(), self.server());
        ClientStateDocument {
            version: DOCUMENT_VERSION,
            client: self.client().clone(),
            case_insensitive: self.repo().is_case_insensitive(),
            mappings: refs.records,
            local,
            server,
            pending: self.pending().iter().cloned().collect(),
        }
    }

    /// Rebuild from a document. Records that point at unknown mappings are
    /// skipped with a warning.
    pub fn from_document(doc: ClientStateDocument) -> Result<Self> {
        if doc.version != DOCUMENT_VERSION {
            return Err(CacheError::Document(format!(
                "unsupported version {} for {} (expected {})",
                doc.version, doc.client, DOCUMENT_VERSION
            )));
        }
        let mut repo = FileMappingRepo::new(doc.case_insensitive);
        let mut refs = HashMap::new();
        for record in &doc.mappings {
            match repo.restore(record.depot.as_deref(), record.local.as_ref()) {
                Some(id) => {
                    if refs.insert(record.reference, id).is_some() {
                        warn!(client = %doc.client, reference = record.reference, "duplicate mapping reference");
                    }
                }
                None => {
                    warn!(client = %doc.client, reference = record.reference, "mapping without paths skipped")
                }
            }
        }
        let local = decode_snapshot(doc.local, &refs, &doc.client);
        let server = decode_snapshot(doc.server, &refs, &doc.client);
        Ok(ClientLocalServerState::from_parts(
            doc.client,
            repo,
            local,
            server,
            VecDeque::from(doc.pending),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::UpdateAction;
    use crate::types::{ExtendedFileStatus, FileAction};
    use pretty_assertions::assert_eq;

    fn fp(path: &str) -> FilePath {
        FilePath::new(path)
    }

    fn populated() -> ClientLocalServerState {
        let mut state =
            ClientLocalServerState::new(ClientServerId::new("u@p4:1666", Some("ws".into())), true);
        state.replace_server_files(vec![ExtendedFileStatus::valid(
            "//depot/a",
            Some("/ws/a".into()),
            Some(FileAction::Edit),
            Some(7),
        )]);
        state.record_local(&fp("/ws/a"), FileUpdateAction::Delete, 7);
        state.record_local(&fp("/ws/new"), FileUpdateAction::AddEdit, 0);
        state.queue(PendingUpdateState::for_file(UpdateAction::DeleteFile, &fp("/ws/a"), 7));
        state.set_job_statuses(vec!["open".into(), "closed".into()]);
        state
    }

    #[test]
    fn test_shared_mapping_written_once() {
        let doc = populated().to_document();
        assert_eq!(doc.mappings.len(), 2);
        assert_eq!(doc.local.files.len(), 2);
        assert_eq!(doc.server.files.len(), 1);

        let a_ref = doc
            .mappings
            .iter()
            .find(|m| m.depot.as_deref() == Some("//depot/a"))
            .unwrap()
            .reference;
        assert!(doc.local.files.iter().any(|f| f.mapping == a_ref));
        assert_eq!(doc.server.files[0].mapping, a_ref);
    }

    #[test]
    fn test_load_restores_shared_identity() {
        let original = populated();
        let json = serde_json::to_string(&original.to_document()).unwrap();
        let doc: ClientStateDocument = serde_json::from_str(&json).unwrap();
        let loaded = ClientLocalServerState::from_document(doc).unwrap();

        let id = loaded.repo().find_by_depot("//depot/a").unwrap();
        assert!(loaded.local().files.contains_key(&id));
        assert!(loaded.server().files.contains_key(&id));
        assert_eq!(loaded.open_files(), original.open_files());
        assert_eq!(loaded.pending(), original.pending());
        assert_eq!(loaded.server().job_statuses, vec!["open", "closed"]);
        assert!(loaded.repo().is_case_insensitive());
    }

    #[test]
    fn test_dangling_reference_is_skipped() {
        let mut doc = populated().to_document();
        doc.local.files[0].mapping = 99;

        let loaded = ClientLocalServerState::from_document(doc).unwrap();
        assert_eq!(loaded.local().files.len(), 1);
        assert_eq!(loaded.server().files.len(), 1);
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let mut doc = populated().to_document();
        doc.version = DOCUMENT_VERSION + 1;
        let err = ClientLocalServerState::from_document(doc).unwrap_err();
        assert!(matches!(err, CacheError::Document(_)));
    }
}

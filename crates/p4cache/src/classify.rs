//! Classification of server status records into action buckets.
//!
//! Before a queued request is sent, each affected file's current server
//! status decides which server command actually applies: a file the server
//! has never seen must be added rather than edited, a file opened for
//! delete must be reverted before it can be edited, and so on.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{error, trace};

use crate::alerts::AlertManager;
use crate::error::{CacheError, Result};
use crate::state::{PendingUpdateState, UpdateAction};
use crate::types::{ExtendedFileStatus, FileAction, FilePath, OpStatus};

/// Where a file lands depending on its current server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActionBucket {
    /// Unknown to the server.
    NotInDepot,
    /// Known and not opened.
    NotOpened,
    /// Opened for add or edit.
    Edited,
    Integrated,
    MoveDeleted,
    Deleted,
}

/// Verdict for one status record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Informational record; does not correspond to a requested file.
    Skip,
    Bucket(ActionBucket),
    /// Dropped on purpose (edit-only request for an unknown file).
    Ignored,
    Notice(String),
    Warning(String),
}

/// Bucket for a server open action. `None` means not opened.
pub fn bucket_for_open_action(action: Option<&FileAction>) -> Option<ActionBucket> {
    let Some(action) = action else {
        return Some(ActionBucket::NotOpened);
    };
    match action {
        FileAction::Add
        | FileAction::AddEdit
        | FileAction::Added
        | FileAction::Edit
        | FileAction::EditFrom
        | FileAction::MoveAdd => Some(ActionBucket::Edited),
        FileAction::Integrate | FileAction::Branch => Some(ActionBucket::Integrated),
        FileAction::MoveDelete => Some(ActionBucket::MoveDeleted),
        FileAction::Delete | FileAction::Deleted => Some(ActionBucket::Deleted),
        FileAction::Other(_) => None,
    }
}

/// Classify one status record for a request of kind `requested`.
pub fn classify(
    status: &ExtendedFileStatus,
    requested: UpdateAction,
    ignore_adds_if_edit_only: bool,
) -> Classification {
    if status.is_status_message() {
        return Classification::Skip;
    }
    if status.is_not_in_client_view() {
        return Classification::Notice(status.describe());
    }
    if status.is_not_known_to_server() {
        if requested == UpdateAction::EditFile && ignore_adds_if_edit_only {
            return Classification::Ignored;
        }
        return Classification::Bucket(ActionBucket::NotInDepot);
    }
    if status.op_status != OpStatus::Valid {
        return Classification::Warning(status.describe());
    }
    match bucket_for_open_action(status.open_action.as_ref()) {
        Some(bucket) => Classification::Bucket(bucket),
        None => Classification::Warning(format!(
            "unsupported open action {}",
            status.open_action.as_ref().map(FileAction::as_str).unwrap_or("?")
        )),
    }
}

/// A file to classify, in request order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitRequest {
    pub file: FilePath,
    pub changelist: i32,
    pub action: UpdateAction,
}

impl SplitRequest {
    pub fn new(file: FilePath, changelist: i32, action: UpdateAction) -> Self {
        Self {
            file,
            changelist,
            action,
        }
    }

    /// Request for the primary file of a pending update.
    pub fn from_pending(update: &PendingUpdateState) -> Option<Self> {
        Some(Self::new(update.file()?, update.changelist(), update.action))
    }
}

/// Requested files partitioned by bucket and destination changelist.
#[derive(Debug, Clone, Default)]
pub struct ActionSplit {
    buckets: BTreeMap<ActionBucket, BTreeMap<i32, BTreeSet<FilePath>>>,
    ignored: Vec<FilePath>,
    notices: Vec<(FilePath, String)>,
    warnings: Vec<(FilePath, String)>,
}

impl ActionSplit {
    /// Pair `statuses` with `requests` in order and classify them.
    ///
    /// Informational records do not consume a request. Any other mismatch
    /// between the two counts is an internal error and nothing is returned.
    pub fn build(
        requests: &[SplitRequest],
        statuses: &[ExtendedFileStatus],
        ignore_adds_if_edit_only: bool,
    ) -> Result<Self> {
        let mut split = ActionSplit::default();
        let mut pending = requests.iter();
        for status in statuses {
            if status.is_status_message() {
                trace!(message = ?status.message, "status message skipped");
                continue;
            }
            let Some(request) = pending.next() else {
                error!(requests = requests.len(), statuses = statuses.len(), "more status records than requested files");
                return Err(CacheError::Internal(format!(
                    "server returned more status records than the {} requested files",
                    requests.len()
                )));
            };
            let verdict = classify(status, request.action, ignore_adds_if_edit_only);
            split.record(request, verdict);
        }
        if pending.next().is_some() {
            error!(requests = requests.len(), statuses = statuses.len(), "fewer status records than requested files");
            return Err(CacheError::Internal(format!(
                "server returned status for fewer than the {} requested files",
                requests.len()
            )));
        }
        Ok(split)
    }

    fn record(&mut self, request: &SplitRequest, verdict: Classification) {
        match verdict {
            Classification::Bucket(bucket) => {
                self.buckets
                    .entry(bucket)
                    .or_default()
                    .entry(request.changelist)
                    .or_default()
                    .insert(request.file.clone());
            }
            Classification::Ignored => self.ignored.push(request.file.clone()),
            Classification::Notice(message) => self.notices.push((request.file.clone(), message)),
            Classification::Warning(message) => self.warnings.push((request.file.clone(), message)),
            Classification::Skip => {}
        }
    }

    /// Files of one bucket, by changelist.
    pub fn bucket(&self, bucket: ActionBucket) -> BTreeMap<i32, BTreeSet<FilePath>> {
        self.buckets.get(&bucket).cloned().unwrap_or_default()
    }

    /// Files of one bucket across all changelists.
    pub fn files(&self, bucket: ActionBucket) -> BTreeSet<FilePath> {
        self.buckets
            .get(&bucket)
            .map(|by_cl| by_cl.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Several buckets merged, by changelist.
    pub fn joined(&self, buckets: &[ActionBucket]) -> BTreeMap<i32, BTreeSet<FilePath>> {
        let mut joined: BTreeMap<i32, BTreeSet<FilePath>> = BTreeMap::new();
        for bucket in buckets {
            if let Some(by_cl) = self.buckets.get(bucket) {
                for (cl, files) in by_cl {
                    joined.entry(*cl).or_default().extend(files.iter().cloned());
                }
            }
        }
        joined
    }

    pub fn is_empty(&self, bucket: ActionBucket) -> bool {
        self.buckets.get(&bucket).is_none_or(|by_cl| by_cl.is_empty())
    }

    /// Number of files placed in any bucket.
    pub fn bucketed_len(&self) -> usize {
        self.buckets.values().flat_map(|by_cl| by_cl.values()).map(BTreeSet::len).sum()
    }

    pub fn ignored(&self) -> &[FilePath] {
        &self.ignored
    }

    pub fn notices(&self) -> &[(FilePath, String)] {
        &self.notices
    }

    pub fn warnings(&self) -> &[(FilePath, String)] {
        &self.warnings
    }

    /// One alert per notice or warning record.
    pub fn publish_alerts(&self, alerts: &AlertManager, title: &str) {
        for (file, message) in &self.notices {
            alerts.notice(title, message.clone(), vec![file.clone()]);
        }
        for (file, message) in &self.warnings {
            alerts.warning(title, message.clone(), vec![file.clone()]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GenericCode;
    use proptest::prelude::*;
    use test_case::test_case;

    fn fp(path: &str) -> FilePath {
        FilePath::new(path)
    }

    fn edit(path: &str, cl: i32) -> SplitRequest {
        SplitRequest::new(fp(path), cl, UpdateAction::EditFile)
    }

    fn opened(action: Option<FileAction>) -> ExtendedFileStatus {
        ExtendedFileStatus::valid("//depot/x", None, action, None)
    }

    #[test_case(None => Some(ActionBucket::NotOpened); "not opened")]
    #[test_case(Some(FileAction::Add) => Some(ActionBucket::Edited); "add")]
    #[test_case(Some(FileAction::AddEdit) => Some(ActionBucket::Edited); "add edit")]
    #[test_case(Some(FileAction::Added) => Some(ActionBucket::Edited); "added")]
    #[test_case(Some(FileAction::Edit) => Some(ActionBucket::Edited); "edit")]
    #[test_case(Some(FileAction::EditFrom) => Some(ActionBucket::Edited); "edit from")]
    #[test_case(Some(FileAction::MoveAdd) => Some(ActionBucket::Edited); "move add")]
    #[test_case(Some(FileAction::Integrate) => Some(ActionBucket::Integrated); "integrate")]
    #[test_case(Some(FileAction::Branch) => Some(ActionBucket::Integrated); "branch")]
    #[test_case(Some(FileAction::MoveDelete) => Some(ActionBucket::MoveDeleted); "move delete")]
    #[test_case(Some(FileAction::Delete) => Some(ActionBucket::Deleted); "delete")]
    #[test_case(Some(FileAction::Deleted) => Some(ActionBucket::Deleted); "deleted")]
    #[test_case(Some(FileAction::Other("purge".into())) => None; "unknown")]
    fn test_open_action_buckets(action: Option<FileAction>) -> Option<ActionBucket> {
        bucket_for_open_action(action.as_ref())
    }

    #[test]
    fn test_opened_for_edit_lands_in_request_changelist() {
        let mut status = opened(Some(FileAction::Edit));
        status.changelist = Some(3);
        let split = ActionSplit::build(&[edit("/ws/a", 3)], &[status], true).unwrap();

        assert_eq!(split.bucket(ActionBucket::Edited), BTreeMap::from([(3, BTreeSet::from([fp("/ws/a")]))]));
        assert_eq!(split.bucketed_len(), 1);
    }

    #[test]
    fn test_unknown_file_for_edit_only_is_ignored() {
        let status = ExtendedFileStatus::no_such_file(&fp("/ws/new"));
        let split = ActionSplit::build(&[edit("/ws/new", 0)], &[status.clone()], true).unwrap();
        assert_eq!(split.ignored(), &[fp("/ws/new")]);
        assert_eq!(split.bucketed_len(), 0);

        let split = ActionSplit::build(&[edit("/ws/new", 0)], &[status.clone()], false).unwrap();
        assert_eq!(split.files(ActionBucket::NotInDepot), BTreeSet::from([fp("/ws/new")]));

        let add = SplitRequest::new(fp("/ws/new"), 0, UpdateAction::AddEditFile);
        let split = ActionSplit::build(&[add], &[status], true).unwrap();
        assert_eq!(split.files(ActionBucket::NotInDepot), BTreeSet::from([fp("/ws/new")]));
    }

    #[test]
    fn test_empty_generic_code_means_unknown_file() {
        let mut status = ExtendedFileStatus::message(OpStatus::Error, "file(s) not on client");
        status.generic = Some(GenericCode::Empty);
        let add = SplitRequest::new(fp("/ws/n"), 0, UpdateAction::AddEditFile);
        let split = ActionSplit::build(&[add], &[status], true).unwrap();
        assert!(!split.is_empty(ActionBucket::NotInDepot));
    }

    #[test]
    fn test_status_messages_do_not_consume_requests() {
        let statuses = vec![
            ExtendedFileStatus::message(OpStatus::Info, "checking"),
            opened(None),
            ExtendedFileStatus::message(OpStatus::ClientError, "noise"),
            opened(Some(FileAction::Delete)),
        ];
        let split = ActionSplit::build(&[edit("/ws/a", 0), edit("/ws/b", 1)], &statuses, true).unwrap();
        assert_eq!(split.files(ActionBucket::NotOpened), BTreeSet::from([fp("/ws/a")]));
        assert_eq!(split.bucket(ActionBucket::Deleted), BTreeMap::from([(1, BTreeSet::from([fp("/ws/b")]))]));
    }

    #[test]
    fn test_not_in_client_view_is_a_notice() {
        let status = ExtendedFileStatus::not_under_root(&fp("/other/a"), "ws");
        let split = ActionSplit::build(&[edit("/other/a", 0)], &[status], true).unwrap();
        assert_eq!(split.notices().len(), 1);
        assert_eq!(split.bucketed_len(), 0);

        let alerts = AlertManager::new();
        let mut rx = alerts.subscribe();
        split.publish_alerts(&alerts, "edit");
        assert_eq!(rx.try_recv().unwrap().level, crate::alerts::AlertLevel::Notice);
    }

    #[test]
    fn test_other_errors_are_warnings() {
        let statuses = vec![
            ExtendedFileStatus::message(OpStatus::Error, "locked by another user"),
            opened(Some(FileAction::Other("import".into()))),
        ];
        let split = ActionSplit::build(&[edit("/ws/a", 0), edit("/ws/b", 0)], &statuses, true).unwrap();
        assert_eq!(split.warnings().len(), 2);
        assert_eq!(split.bucketed_len(), 0);
    }

    #[test]
    fn test_joined_merges_changelists() {
        let statuses = vec![opened(None), opened(Some(FileAction::Integrate)), opened(Some(FileAction::Delete))];
        let split = ActionSplit::build(
            &[edit("/ws/a", 1), edit("/ws/b", 1), edit("/ws/c", 2)],
            &statuses,
            true,
        )
        .unwrap();
        let joined = split.joined(&[ActionBucket::NotOpened, ActionBucket::Integrated, ActionBucket::Deleted]);
        assert_eq!(joined.len(), 2);
        assert_eq!(joined[&1], BTreeSet::from([fp("/ws/a"), fp("/ws/b")]));
        assert_eq!(joined[&2], BTreeSet::from([fp("/ws/c")]));
    }

    #[test]
    fn test_count_mismatch_fails_closed() {
        let err = ActionSplit::build(&[edit("/ws/a", 0)], &[], true).unwrap_err();
        assert!(matches!(err, CacheError::Internal(_)));

        let err = ActionSplit::build(&[edit("/ws/a", 0)], &[opened(None), opened(None)], true).unwrap_err();
        assert!(matches!(err, CacheError::Internal(_)));

        // Trailing informational records are fine.
        let statuses = vec![opened(None), ExtendedFileStatus::message(OpStatus::Info, "done")];
        assert!(ActionSplit::build(&[edit("/ws/a", 0)], &statuses, true).is_ok());
    }

    fn arb_action() -> impl Strategy<Value = Option<FileAction>> {
        prop_oneof![
            Just(None),
            Just(Some(FileAction::Add)),
            Just(Some(FileAction::Edit)),
            Just(Some(FileAction::MoveAdd)),
            Just(Some(FileAction::Branch)),
            Just(Some(FileAction::MoveDelete)),
            Just(Some(FileAction::Deleted)),
            "[a-z]{3,6}".prop_map(|name| Some(FileAction::parse(&name))),
        ]
    }

    fn arb_status() -> impl Strategy<Value = ExtendedFileStatus> {
        prop_oneof![
            arb_action().prop_map(opened),
            Just(ExtendedFileStatus::no_such_file(&FilePath::new("/ws/x"))),
            Just(ExtendedFileStatus::not_under_root(&FilePath::new("/ws/x"), "ws")),
            Just(ExtendedFileStatus::message(OpStatus::Error, "locked")),
        ]
    }

    fn arb_request_action() -> impl Strategy<Value = UpdateAction> {
        prop_oneof![
            Just(UpdateAction::AddEditFile),
            Just(UpdateAction::EditFile),
            Just(UpdateAction::DeleteFile),
        ]
    }

    proptest! {
        #[test]
        fn prop_every_file_gets_exactly_one_outcome(
            cases in prop::collection::vec((arb_status(), arb_request_action(), 0i32..3), 0..20),
            ignore in any::<bool>(),
        ) {
            let requests: Vec<SplitRequest> = cases
                .iter()
                .enumerate()
                .map(|(i, (_, action, cl))| SplitRequest::new(FilePath::new(format!("/ws/f{}", i)), *cl, *action))
                .collect();
            let statuses: Vec<ExtendedFileStatus> = cases.iter().map(|(s, _, _)| s.clone()).collect();

            let split = ActionSplit::build(&requests, &statuses, ignore).unwrap();
            let outcomes = split.bucketed_len()
                + split.ignored().len()
                + split.notices().len()
                + split.warnings().len();
            prop_assert_eq!(outcomes, requests.len());
        }
    }
}

//! Executors for queued update groups.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, error};

use crate::classify::{ActionBucket, ActionSplit, SplitRequest};
use crate::connection::ConnectionScope;
use crate::error::{CacheError, Result};
use crate::state::{ActionGroup, FileUpdateStatus, PendingUpdateState, UpdateAction};
use crate::types::{FilePath, FileResult};

/// Outcome of running one action group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Every server call succeeded.
    Succeeded,
    /// Connectivity failed; the group goes back on the queue.
    Retry,
    /// Nothing succeeded.
    Failed,
    /// Nothing needed doing.
    NoOp,
    /// Some files succeeded and the rest were refused or never sent.
    ReloadCache,
}

pub(crate) struct ActionOutcome {
    pub status: ExecutionStatus,
    pub files: Vec<FileResult>,
}

impl ActionOutcome {
    fn stopped(status: ExecutionStatus, files: Vec<FileResult>) -> Self {
        Self { status, files }
    }
}

/// Accumulates bulk-call results for a group.
struct Progress<'s, 'a> {
    scope: &'s ConnectionScope<'a>,
    title: &'static str,
    revision: u64,
    attempted: bool,
    succeeded: bool,
    failed: bool,
    files: Vec<FileResult>,
}

impl<'s, 'a> Progress<'s, 'a> {
    fn new(scope: &'s ConnectionScope<'a>, title: &'static str, group: &ActionGroup) -> Self {
        Self {
            scope,
            title,
            revision: group.revision,
            attempted: false,
            succeeded: false,
            failed: false,
            files: Vec::new(),
        }
    }

    /// Record a bulk call over `files`. `Some` means stop the group with
    /// that status.
    async fn record(&mut self, files: &[FilePath], result: Result<Vec<FileResult>>) -> Option<ExecutionStatus> {
        self.attempted = true;
        let cache = self.scope.cache();
        let alerts = self.scope.alerts();
        match result {
            Ok(results) => {
                let (ok, refused): (Vec<&FileResult>, Vec<&FileResult>) =
                    results.iter().partition(|r| r.is_ok());
                let ok: Vec<FilePath> = ok.into_iter().map(|r| r.file.clone()).collect();
                let refused: Vec<FilePath> = refused.into_iter().map(|r| r.file.clone()).collect();
                cache.mark_resolved(&ok, FileUpdateStatus::Committed, self.revision).await;
                cache.mark_resolved(&refused, FileUpdateStatus::Rejected, self.revision).await;
                alerts.file_results(self.title, &results);
                self.succeeded |= !ok.is_empty();
                self.failed |= !refused.is_empty();
                self.files.extend(results);
                None
            }
            Err(e) if stops_for_retry(&e) => Some(ExecutionStatus::Retry),
            Err(CacheError::Validation(msg)) => {
                alerts.warning(self.title, msg.clone(), files.to_vec());
                self.reject(files, &msg).await;
                None
            }
            Err(e) => {
                error!(title = self.title, error = %e, "action group aborted");
                alerts.warning(self.title, e.to_string(), files.to_vec());
                Some(ExecutionStatus::Failed)
            }
        }
    }

    /// Files the server will never accept for this request.
    async fn reject(&mut self, files: &[FilePath], reason: &str) {
        if files.is_empty() {
            return;
        }
        self.attempted = true;
        self.scope
            .cache()
            .mark_resolved(files, FileUpdateStatus::Rejected, self.revision)
            .await;
        self.failed = true;
        self.files
            .extend(files.iter().map(|f| FileResult::failed(f.clone(), reason)));
    }

    /// Files that need no server call: the server already matches.
    async fn settle(&mut self, files: &[FilePath]) {
        if files.is_empty() {
            return;
        }
        self.scope
            .cache()
            .mark_resolved(files, FileUpdateStatus::Committed, self.revision)
            .await;
        self.attempted = true;
        self.succeeded = true;
        self.files.extend(files.iter().cloned().map(FileResult::ok));
    }

    /// Stop early. A failure after earlier calls went through still
    /// changed the server, so the cache must reload.
    fn stop(self, status: ExecutionStatus) -> ActionOutcome {
        let status = match status {
            ExecutionStatus::Failed if self.succeeded => ExecutionStatus::ReloadCache,
            status => status,
        };
        ActionOutcome::stopped(status, self.files)
    }

    fn finish(self) -> ActionOutcome {
        let status = match (self.attempted, self.succeeded, self.failed) {
            (false, _, _) => ExecutionStatus::NoOp,
            (true, false, true) => ExecutionStatus::Failed,
            (true, true, true) => ExecutionStatus::ReloadCache,
            (true, _, false) => ExecutionStatus::Succeeded,
        };
        ActionOutcome::stopped(status, self.files)
    }
}

fn stops_for_retry(err: &CacheError) -> bool {
    err.is_retryable() || matches!(err, CacheError::Authentication(_))
}

fn to_vec(files: &BTreeSet<FilePath>) -> Vec<FilePath> {
    files.iter().cloned().collect()
}

/// Run a group with the executor for its action.
pub(crate) async fn execute(scope: &ConnectionScope<'_>, group: &ActionGroup) -> ActionOutcome {
    match group.action {
        UpdateAction::AddEditFile | UpdateAction::EditFile => add_edit(scope, group).await,
        UpdateAction::DeleteFile | UpdateAction::MoveDeleteFile => delete(scope, group).await,
        UpdateAction::MoveFile => move_files(scope, group).await,
        UpdateAction::IntegrateFile => integrate(scope, group).await,
        UpdateAction::RevertFile => revert(scope, group).await,
    }
}

fn split_requests(updates: &[PendingUpdateState]) -> Vec<SplitRequest> {
    updates
        .iter()
        .filter_map(|update| {
            let request = SplitRequest::from_pending(update);
            if request.is_none() {
                error!(action = %update.action, "queued update without a file, dropped");
            }
            request
        })
        .collect()
}

/// Fetch statuses for `requests` and classify them. `Err` carries the
/// status to stop with.
async fn classify(
    scope: &ConnectionScope<'_>,
    title: &str,
    requests: &[SplitRequest],
) -> std::result::Result<ActionSplit, ExecutionStatus> {
    let files: Vec<FilePath> = requests.iter().map(|r| r.file.clone()).collect();
    let statuses = match scope.file_status(&files).await {
        Ok(statuses) => statuses,
        Err(e) if stops_for_retry(&e) => return Err(ExecutionStatus::Retry),
        Err(e) => {
            scope.alerts().warning(title, e.to_string(), files);
            return Err(ExecutionStatus::Failed);
        }
    };
    let split = ActionSplit::build(requests, &statuses, scope.settings().ignore_adds_if_edit_only)
        .map_err(|e| {
            scope.alerts().warning(title, e.to_string(), files.clone());
            ExecutionStatus::Failed
        })?;
    split.publish_alerts(scope.alerts(), title);
    Ok(split)
}

/// Files from the split that produced an alert; the server will not take them.
fn unusable(split: &ActionSplit) -> Vec<FilePath> {
    split
        .notices()
        .iter()
        .chain(split.warnings())
        .map(|(file, _)| file.clone())
        .collect()
}

async fn add_edit(scope: &ConnectionScope<'_>, group: &ActionGroup) -> ActionOutcome {
    const TITLE: &str = "Add/Edit";
    let requests = split_requests(&group.updates);
    if requests.is_empty() {
        return ActionOutcome::stopped(ExecutionStatus::NoOp, Vec::new());
    }
    let split = match classify(scope, TITLE, &requests).await {
        Ok(split) => split,
        Err(status) => return ActionOutcome::stopped(status, Vec::new()),
    };
    let mut progress = Progress::new(scope, TITLE, group);
    progress.reject(&unusable(&split), "not accepted by server").await;
    // Edit-only requests for files the server never saw are simply dropped.
    scope
        .cache()
        .mark_resolved(split.ignored(), FileUpdateStatus::Rejected, group.revision)
        .await;

    // Files opened for delete must be reverted before they can be edited.
    let deleted = to_vec(&split.files(ActionBucket::Deleted));
    if !deleted.is_empty() {
        match scope.revert_files(&deleted).await {
            Ok(results) => {
                scope.alerts().file_results(TITLE, &results);
            }
            Err(e) if stops_for_retry(&e) => return progress.stop(ExecutionStatus::Retry),
            Err(e) => {
                scope.alerts().warning(TITLE, e.to_string(), deleted.clone());
                let all: Vec<FilePath> = requests.iter().map(|r| r.file.clone()).collect();
                progress.reject(&all, &e.to_string()).await;
                return progress.stop(ExecutionStatus::Failed);
            }
        }
    }

    for (cl, files) in split.bucket(ActionBucket::NotInDepot) {
        let files = to_vec(&files);
        let result = scope.add_files(&files, cl).await;
        if let Some(stop) = progress.record(&files, result).await {
            return progress.stop(stop);
        }
    }
    for (cl, files) in split.bucket(ActionBucket::Edited) {
        let files = to_vec(&files);
        let result = scope.reopen_files(&files, cl).await;
        if let Some(stop) = progress.record(&files, result).await {
            return progress.stop(stop);
        }
    }
    let to_edit = split.joined(&[
        ActionBucket::NotOpened,
        ActionBucket::Integrated,
        ActionBucket::MoveDeleted,
        ActionBucket::Deleted,
    ]);
    for (cl, files) in to_edit {
        let files = to_vec(&files);
        let result = scope.edit_files(&files, cl).await;
        if let Some(stop) = progress.record(&files, result).await {
            return progress.stop(stop);
        }
    }
    progress.finish()
}

async fn delete(scope: &ConnectionScope<'_>, group: &ActionGroup) -> ActionOutcome {
    const TITLE: &str = "Delete";
    let requests = split_requests(&group.updates);
    if requests.is_empty() {
        return ActionOutcome::stopped(ExecutionStatus::NoOp, Vec::new());
    }
    let split = match classify(scope, TITLE, &requests).await {
        Ok(split) => split,
        Err(status) => return ActionOutcome::stopped(status, Vec::new()),
    };
    let mut progress = Progress::new(scope, TITLE, group);
    progress.reject(&unusable(&split), "not accepted by server").await;

    // Never submitted: deleting locally is all there is to do.
    progress.settle(&to_vec(&split.files(ActionBucket::NotInDepot))).await;
    let already_gone: BTreeSet<FilePath> = split
        .files(ActionBucket::MoveDeleted)
        .union(&split.files(ActionBucket::Deleted))
        .cloned()
        .collect();
    progress.settle(&to_vec(&already_gone)).await;

    let mut reverted: BTreeSet<FilePath> = split.files(ActionBucket::Edited);
    reverted.extend(split.files(ActionBucket::Integrated));
    if !reverted.is_empty() {
        let files = to_vec(&reverted);
        match scope.revert_files(&files).await {
            Ok(results) => {
                // Files that would not revert cannot be deleted either.
                let stuck: Vec<FilePath> = results
                    .iter()
                    .filter(|r| !r.is_ok())
                    .map(|r| r.file.clone())
                    .collect();
                scope.alerts().file_results(TITLE, &results);
                progress.reject(&stuck, "revert before delete failed").await;
                reverted.retain(|f| !stuck.contains(f));
            }
            Err(e) if stops_for_retry(&e) => return progress.stop(ExecutionStatus::Retry),
            Err(e) => {
                scope.alerts().warning(TITLE, e.to_string(), files.clone());
                progress.reject(&files, &e.to_string()).await;
                reverted.clear();
            }
        }
    }

    let mut to_delete: BTreeMap<i32, BTreeSet<FilePath>> = split.bucket(ActionBucket::NotOpened);
    for (cl, files) in split.joined(&[ActionBucket::Edited, ActionBucket::Integrated]) {
        let still = files.into_iter().filter(|f| reverted.contains(f));
        to_delete.entry(cl).or_default().extend(still);
    }
    for (cl, files) in to_delete {
        if files.is_empty() {
            continue;
        }
        let files = to_vec(&files);
        let result = scope.delete_files(&files, cl).await;
        if let Some(stop) = progress.record(&files, result).await {
            return progress.stop(stop);
        }
    }
    progress.finish()
}

async fn move_files(scope: &ConnectionScope<'_>, group: &ActionGroup) -> ActionOutcome {
    const TITLE: &str = "Move";
    let moves: Vec<(FilePath, FilePath, i32)> = group
        .updates
        .iter()
        .filter_map(|u| match (u.source(), u.file()) {
            (Some(source), Some(target)) => Some((source, target, u.changelist())),
            _ => {
                error!("queued move without source or target, dropped");
                None
            }
        })
        .collect();
    if moves.is_empty() {
        return ActionOutcome::stopped(ExecutionStatus::NoOp, Vec::new());
    }
    let requests: Vec<SplitRequest> = moves
        .iter()
        .map(|(source, _, cl)| SplitRequest::new(source.clone(), *cl, UpdateAction::MoveFile))
        .collect();
    let split = match classify(scope, TITLE, &requests).await {
        Ok(split) => split,
        Err(status) => return ActionOutcome::stopped(status, Vec::new()),
    };
    let mut progress = Progress::new(scope, TITLE, group);

    for (source, target, cl) in moves {
        let bucket = [
            ActionBucket::NotInDepot,
            ActionBucket::NotOpened,
            ActionBucket::Edited,
            ActionBucket::Integrated,
            ActionBucket::MoveDeleted,
            ActionBucket::Deleted,
        ]
        .into_iter()
        .find(|b| split.files(*b).contains(&source));
        let pair = [source.clone(), target.clone()];
        let Some(bucket) = bucket else {
            progress.reject(&pair, "source not accepted by server").await;
            continue;
        };
        debug!(source = %source, target = %target, ?bucket, "moving file");

        let result = match bucket {
            // Nothing on the server to move from.
            ActionBucket::NotInDepot => {
                let added = scope.add_files(std::slice::from_ref(&target), cl).await;
                if added.is_ok() {
                    progress.settle(std::slice::from_ref(&source)).await;
                }
                added
            }
            ActionBucket::Edited | ActionBucket::Integrated => scope.move_file(&source, &target, cl).await,
            ActionBucket::NotOpened => match scope.edit_files(std::slice::from_ref(&source), cl).await {
                Ok(_) => scope.move_file(&source, &target, cl).await,
                Err(e) => Err(e),
            },
            ActionBucket::MoveDeleted | ActionBucket::Deleted => {
                match scope.revert_files(std::slice::from_ref(&source)).await {
                    Ok(_) => match scope.edit_files(std::slice::from_ref(&source), cl).await {
                        Ok(_) => scope.move_file(&source, &target, cl).await,
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                }
            }
        };
        if let Some(stop) = progress.record(&pair, result).await {
            return progress.stop(stop);
        }
    }
    progress.finish()
}

async fn integrate(scope: &ConnectionScope<'_>, group: &ActionGroup) -> ActionOutcome {
    const TITLE: &str = "Integrate";
    let mut progress = Progress::new(scope, TITLE, group);
    for update in &group.updates {
        let (Some(source), Some(target)) = (update.source(), update.file()) else {
            error!("queued integrate without source or target, dropped");
            continue;
        };
        let result = scope.integrate_file(&source, &target, update.changelist()).await;
        if let Some(stop) = progress.record(std::slice::from_ref(&target), result).await {
            return progress.stop(stop);
        }
    }
    progress.finish()
}

async fn revert(scope: &ConnectionScope<'_>, group: &ActionGroup) -> ActionOutcome {
    const TITLE: &str = "Revert";
    let files: Vec<FilePath> = group.updates.iter().filter_map(PendingUpdateState::file).collect();
    if files.is_empty() {
        return ActionOutcome::stopped(ExecutionStatus::NoOp, Vec::new());
    }
    let mut progress = Progress::new(scope, TITLE, group);
    let result = scope.revert_files(&files).await;
    if let Some(stop) = progress.record(&files, result).await {
        return progress.stop(stop);
    }
    progress.finish()
}

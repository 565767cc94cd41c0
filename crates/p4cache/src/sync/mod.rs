//! Cache synchronization engine.
//!
//! Two directions: [`refresh`] pulls server state into the cache on each
//! cache's own schedule, and [`flush_pending`] pushes queued updates to the
//! server one action group at a time.

mod actions;
mod refresh;

use serde::Serialize;
use tracing::{info, instrument, warn};

pub use actions::ExecutionStatus;
pub(crate) use refresh::{load_file_actions, refresh};

use crate::connection::ServerConnection;
use crate::error::{CacheError, Result};
use crate::state::{FileUpdateStatus, UpdateAction};
use crate::types::FileResult;

/// Result of executing one action group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupOutcome {
    pub action: UpdateAction,
    pub updates: usize,
    pub status: ExecutionStatus,
    pub files: Vec<FileResult>,
}

/// Summary of one flush of the pending queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub groups: Vec<GroupOutcome>,
    /// Whether the server file listing was reloaded afterwards.
    pub reloaded: bool,
    /// Updates still queued when the flush ended.
    pub remaining: usize,
}

impl SyncReport {
    /// Per-file outcomes across all groups.
    pub fn files(&self) -> impl Iterator<Item = &FileResult> {
        self.groups.iter().flat_map(|g| g.files.iter())
    }
}

/// Send queued updates to the server in queue order.
///
/// A group that hits a connectivity problem goes back to the front of the
/// queue and the flush stops; everything behind it waits for the next
/// reconnect. Any other group leaves the queue for good, and local entries
/// it did not settle are rejected. Working offline is not an error:
/// nothing is sent.
#[instrument(skip(conn), fields(client = %conn.client()))]
pub(crate) async fn flush_pending(conn: &ServerConnection) -> Result<SyncReport> {
    let cache = conn.cache();
    let mut report = SyncReport::default();
    if !cache.has_pending().await {
        return Ok(report);
    }
    let scope = match conn.scope().await {
        Ok(scope) => scope,
        Err(CacheError::Offline(_)) => {
            report.remaining = cache.pending_updates().await.len();
            return Ok(report);
        }
        Err(e) => return Err(e),
    };

    let mut needs_reload = false;
    while let Some(group) = cache.take_group().await {
        let outcome = actions::execute(&scope, &group).await;
        info!(
            action = %group.action,
            updates = group.updates.len(),
            status = ?outcome.status,
            "action group executed"
        );
        let status = outcome.status;
        report.groups.push(GroupOutcome {
            action: group.action,
            updates: group.updates.len(),
            status,
            files: outcome.files,
        });
        if status == ExecutionStatus::Retry {
            cache.requeue_front(group).await;
            break;
        }
        // The group is gone from the queue: whatever it did not settle
        // will never reach the server.
        let unsettled = cache
            .mark_resolved(&group.affected_files(), FileUpdateStatus::Rejected, group.revision)
            .await;
        if unsettled > 0 {
            warn!(action = %group.action, unsettled, ?status, "local entries rejected with their group");
        }
        if matches!(status, ExecutionStatus::Succeeded | ExecutionStatus::ReloadCache) {
            needs_reload = true;
        }
    }

    if needs_reload && scope.is_online() {
        match load_file_actions(&scope).await {
            Ok(()) => report.reloaded = true,
            Err(e) => warn!(error = %e, "file actions reload after flush failed"),
        }
    }
    report.remaining = cache.pending_updates().await.len();
    Ok(report)
}

//! Pulling server state into the cache.

use tracing::{debug, instrument};

use crate::client::CacheKind;
use crate::connection::{ConnectionScope, ServerConnection};
use crate::error::Result;

/// Reload `kind` if it is stale (or `force`), while online.
#[instrument(skip(conn), fields(client = %conn.client()))]
pub(crate) async fn refresh(conn: &ServerConnection, kind: CacheKind, force: bool) -> Result<bool> {
    if conn.is_working_offline() {
        return Ok(false);
    }
    if !force && !conn.cache().needs_refresh(kind).await {
        return Ok(false);
    }
    let scope = conn.scope().await?;
    match kind {
        CacheKind::FileActions => load_file_actions(&scope).await?,
        CacheKind::Changelists => load_changelists(&scope).await?,
        CacheKind::JobStatuses => load_job_statuses(&scope).await?,
    }
    Ok(true)
}

/// Reload workspace roots and the files opened under them.
pub(crate) async fn load_file_actions(scope: &ConnectionScope<'_>) -> Result<()> {
    let roots = scope.client_roots().await?;
    scope.cache().set_roots(roots.clone()).await;
    let opened = scope.opened_files(&roots).await?;
    debug!(roots = roots.len(), opened = opened.len(), "file actions loaded");
    scope.cache().apply_opened_files(opened, scope.alerts()).await;
    Ok(())
}

async fn load_changelists(scope: &ConnectionScope<'_>) -> Result<()> {
    let changelists = scope.open_changelists().await?;
    debug!(count = changelists.len(), "changelists loaded");
    scope.cache().set_changelists(changelists).await;
    Ok(())
}

async fn load_job_statuses(scope: &ConnectionScope<'_>) -> Result<()> {
    let statuses = scope.job_statuses().await?;
    debug!(count = statuses.len(), "job statuses loaded");
    scope.cache().set_job_statuses(statuses).await;
    Ok(())
}

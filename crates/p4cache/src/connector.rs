//! Boundary to the remote version-control server.
//!
//! The cache never speaks the server protocol itself. Everything it needs
//! from a server goes through [`ServerConnector`]; bulk calls report a
//! [`FileResult`] per file so partial success can be tracked.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ServerConfig;
use crate::error::ConnectorError;
use crate::types::{ChangeList, ClientServerId, ExtendedFileStatus, FilePath, FileResult, ServerInfo};

/// Result type for connector calls.
pub type ConnectorResult<T> = std::result::Result<T, ConnectorError>;

/// Operations the cache issues against a server for one workspace.
#[async_trait]
pub trait ServerConnector: Send + Sync {
    async fn server_info(&self) -> ConnectorResult<ServerInfo>;

    /// Local roots of the workspace.
    async fn client_roots(&self) -> ConnectorResult<Vec<FilePath>>;

    /// One status record per requested file, possibly interleaved with
    /// informational records.
    async fn file_status(&self, files: &[FilePath]) -> ConnectorResult<Vec<ExtendedFileStatus>>;

    /// Files currently opened by the workspace under `roots`.
    async fn opened_files(&self, roots: &[FilePath]) -> ConnectorResult<Vec<ExtendedFileStatus>>;

    async fn add_files(&self, files: &[FilePath], changelist: i32) -> ConnectorResult<Vec<FileResult>>;

    async fn edit_files(&self, files: &[FilePath], changelist: i32) -> ConnectorResult<Vec<FileResult>>;

    /// Move already-opened files to another changelist.
    async fn reopen_files(&self, files: &[FilePath], changelist: i32) -> ConnectorResult<Vec<FileResult>>;

    async fn delete_files(&self, files: &[FilePath], changelist: i32) -> ConnectorResult<Vec<FileResult>>;

    async fn revert_files(&self, files: &[FilePath]) -> ConnectorResult<Vec<FileResult>>;

    async fn move_file(
        &self,
        source: &FilePath,
        target: &FilePath,
        changelist: i32,
    ) -> ConnectorResult<Vec<FileResult>>;

    async fn integrate_file(
        &self,
        source: &FilePath,
        target: &FilePath,
        changelist: i32,
    ) -> ConnectorResult<Vec<FileResult>>;

    /// Pending changelists owned by the workspace.
    async fn open_changelists(&self) -> ConnectorResult<Vec<ChangeList>>;

    /// Create a pending changelist, returning its id.
    async fn create_changelist(&self, description: &str) -> ConnectorResult<i32>;

    async fn submit_changelist(&self, changelist: i32) -> ConnectorResult<Vec<FileResult>>;

    /// Job status values defined on the server.
    async fn job_statuses(&self) -> ConnectorResult<Vec<String>>;
}

/// Creates connectors for workspaces.
pub trait ConnectorFactory: Send + Sync {
    fn connector_for(&self, config: &ServerConfig, client: &ClientServerId) -> Arc<dyn ServerConnector>;
}

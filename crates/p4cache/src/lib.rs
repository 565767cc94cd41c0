//! Offline-capable cache for a Perforce workspace.
//!
//! The cache answers "which files are opened, and how" without a round trip,
//! keeps working while the server is unreachable, and replays the changes
//! made offline once it comes back.
//!
//! - [`mapping`] gives each file a single identity linking depot and local paths.
//! - [`state`] holds the server snapshot, local changes and the pending queue.
//! - [`classify`] decides which server command a queued change really needs.
//! - [`sync`] pulls server state in and pushes queued changes out.
//! - [`connection`] tracks online/offline state and scopes server access.
//! - [`central`] and [`context`] own the per-workspace caches.
//! - [`server`] is the facade commands and views use.

pub mod alerts;
pub mod central;
pub mod classify;
pub mod client;
pub mod config;
pub mod connection;
pub mod connector;
pub mod context;
pub mod error;
pub mod mapping;
pub mod server;
pub mod state;
pub mod store;
pub mod sync;
pub mod types;

pub use alerts::{Alert, AlertLevel, AlertManager};
pub use central::CentralCacheManager;
pub use classify::{ActionBucket, ActionSplit, Classification, SplitRequest, classify};
pub use client::{CacheKind, ClientCacheManager};
pub use config::{AuthKind, CacheSettings, IgnoreMatcher, ServerConfig};
pub use connection::{
    ConnectionScope, ConnectionState, ServerConnection, ServerConnectionManager, ServerStatus,
};
pub use connector::{ConnectorFactory, ConnectorResult, ServerConnector};
pub use context::P4CacheContext;
pub use error::{CacheError, ConnectorError, Result};
pub use mapping::{FileMappingRepo, MappingId, P4ClientFileMapping};
pub use server::P4Server;
pub use state::{
    ActionGroup, ClientLocalServerState, ClientStateDocument, FileUpdateAction, FileUpdateStatus,
    P4ClientState, P4FileAction, P4FileUpdateState, PendingUpdateState, UpdateAction,
    UpdateParameter,
};
pub use store::{JsonFileStore, MemoryStore, StateStore};
pub use sync::{ExecutionStatus, GroupOutcome, SyncReport};
pub use types::{
    CASE_INSENSITIVE_FS, ChangeList, ClientServerId, DEFAULT_CHANGELIST, ExtendedFileStatus,
    FileAction, FilePath, FileResult, GenericCode, OpStatus, ServerInfo,
};

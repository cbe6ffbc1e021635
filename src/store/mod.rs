//! Coordination Store Module
//!
//! Abstracts the external hierarchical coordination service (a
//! ZooKeeper-style system) behind a trait: node CRUD, ephemeral/sequential
//! creation, one-shot change watches, and session liveness. The election
//! protocol is written purely against this trait; `memory` provides an
//! in-process backend with full session semantics.

mod memory;

pub use memory::{MemorySession, MemoryStore};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::Result;

/// Identifier of a coordination session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub uuid::Uuid);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Creation mode for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session
    Persistent,
    /// Removed when the creating session ends
    Ephemeral,
    /// Persistent, name suffixed with a store-assigned sequence number
    PersistentSequential,
    /// Ephemeral, name suffixed with a store-assigned sequence number
    EphemeralSequential,
}

impl CreateMode {
    /// Whether nodes created in this mode die with their session
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    /// Whether the store appends a sequence number to the node name
    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Metadata of a stored node
#[derive(Debug, Clone)]
pub struct NodeStat {
    /// Write version, incremented on every data change
    pub version: i64,
    /// Creation timestamp
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Owning session for ephemeral nodes
    pub owner: Option<SessionId>,
    /// Whether the node is ephemeral
    pub ephemeral: bool,
}

/// Change notification delivered by a one-shot watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    /// The watched node was deleted (explicitly or by session expiry of its owner)
    Deleted,
    /// The watching session itself ended; the watch will never fire again
    SessionExpired,
}

/// One-shot watch delivery channel.
///
/// A watch fires exactly once and must be re-armed by registering a new one.
pub type WatchReceiver = oneshot::Receiver<WatchEvent>;

/// A connected session to the coordination store.
///
/// Implementations own a single liveness-tracked session; when it expires the
/// store removes every ephemeral node it created and fails all further
/// operations with [`crate::Error::SessionExpired`].
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Session identifier of this connection
    fn session_id(&self) -> SessionId;

    /// Create a node, returning the actual path (sequence suffix applied for
    /// sequential modes). The parent node must already exist.
    async fn create(&self, path: &str, value: &[u8], mode: CreateMode) -> Result<String>;

    /// Read a node's value, or `None` if it does not exist
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Overwrite a node's value. `expected_version` of `None` writes
    /// unconditionally; `Some(v)` fails with a version mismatch unless the
    /// node is currently at version `v`.
    async fn write(&self, path: &str, value: &[u8], expected_version: Option<i64>)
        -> Result<NodeStat>;

    /// Check whether a node exists
    async fn exists(&self, path: &str) -> Result<Option<NodeStat>>;

    /// Delete a node
    async fn delete(&self, path: &str) -> Result<()>;

    /// List the names (not full paths) of a node's children
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Register a one-shot watch that fires when `path` is deleted.
    ///
    /// Returns `Ok(None)` when the node is already gone; the existence check
    /// and the registration are atomic, so a caller seeing `Some` is
    /// guaranteed a notification for the eventual deletion.
    async fn watch_delete(&self, path: &str) -> Result<Option<WatchReceiver>>;

    /// Register a one-shot watch that fires when this session ends
    async fn watch_session(&self) -> Result<WatchReceiver>;

    /// Close the session, removing its ephemeral nodes
    async fn close(&self) -> Result<()>;
}

/// Parent path of a node path, if any
pub(crate) fn parent_of(path: &str) -> Option<&str> {
    let idx = path.rfind('/')?;
    if idx == 0 {
        Some("/")
    } else {
        Some(&path[..idx])
    }
}

/// Validate a node path: absolute, no empty interior segments
pub(crate) fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || path.len() < 2 || path.contains("//") || path.ends_with('/') {
        return Err(crate::Error::BadPath(path.to_string()));
    }
    Ok(())
}

//! In-Process Coordination Store
//!
//! A [`CoordinationStore`] backend backed by process memory. It implements
//! the full session model (ephemeral ownership, sequence assignment,
//! one-shot watches, forced expiry) so the election protocol can be
//! exercised end to end without an external ensemble. [`MemoryStore`] plays
//! the role of the ensemble; each [`MemorySession`] is one connected client.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use super::{parent_of, validate_path};
use super::{CoordinationStore, CreateMode, NodeStat, SessionId, WatchEvent, WatchReceiver};
use crate::error::{Error, Result};

/// Shared store state, usable from any number of sessions
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: std::sync::Arc<Mutex<StoreState>>,
}

/// A connected session against a [`MemoryStore`]
pub struct MemorySession {
    store: MemoryStore,
    id: SessionId,
}

#[derive(Default)]
struct StoreState {
    nodes: BTreeMap<String, Node>,
    /// Next sequence number per parent directory
    counters: HashMap<String, u64>,
    /// Registered delete watches per path
    delete_watches: HashMap<String, Vec<DeleteWatcher>>,
    sessions: HashMap<SessionId, Session>,
}

struct Node {
    value: Vec<u8>,
    version: i64,
    created_at: chrono::DateTime<chrono::Utc>,
    owner: Option<SessionId>,
    ephemeral: bool,
}

impl Node {
    fn stat(&self) -> NodeStat {
        NodeStat {
            version: self.version,
            created_at: self.created_at,
            owner: self.owner,
            ephemeral: self.ephemeral,
        }
    }
}

struct DeleteWatcher {
    session: SessionId,
    tx: oneshot::Sender<WatchEvent>,
}

#[derive(Default)]
struct Session {
    status: SessionStatus,
    /// One-shot session-end watchers registered by this session
    watchers: Vec<oneshot::Sender<WatchEvent>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SessionStatus {
    #[default]
    Alive,
    Expired,
    Closed,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session. Mirrors the blocking connect of a real client;
    /// for the in-process backend the session is live immediately.
    pub async fn connect(&self) -> Result<MemorySession> {
        let id = SessionId(Uuid::new_v4());
        let mut state = self.state.lock().await;
        state.sessions.insert(id, Session::default());
        tracing::debug!("Opened coordination session {}", id);
        Ok(MemorySession {
            store: self.clone(),
            id,
        })
    }

    /// Forcibly expire a session, as a real ensemble would after missed
    /// heartbeats: its ephemeral nodes are removed (firing delete watches)
    /// and every watch it registered fires with `SessionExpired`.
    pub async fn expire(&self, session: SessionId) {
        let mut state = self.state.lock().await;
        tracing::debug!("Expiring coordination session {}", session);
        end_session(&mut state, session, SessionStatus::Expired);
    }

    /// Number of nodes currently stored
    pub async fn node_count(&self) -> usize {
        self.state.lock().await.nodes.len()
    }
}

/// Terminate a session: notify its watchers, then drop its ephemerals.
///
/// The session's own watchers are drained first so they observe
/// `SessionExpired` rather than a deletion caused by their own demise.
fn end_session(state: &mut StoreState, session: SessionId, status: SessionStatus) {
    match state.sessions.get_mut(&session) {
        Some(s) if s.status == SessionStatus::Alive => {
            s.status = status;
            for tx in s.watchers.drain(..) {
                let _ = tx.send(WatchEvent::SessionExpired);
            }
        }
        _ => return,
    }

    for watchers in state.delete_watches.values_mut() {
        let mut i = 0;
        while i < watchers.len() {
            if watchers[i].session == session {
                let watcher = watchers.swap_remove(i);
                let _ = watcher.tx.send(WatchEvent::SessionExpired);
            } else {
                i += 1;
            }
        }
    }

    let owned: Vec<String> = state
        .nodes
        .iter()
        .filter(|(_, node)| node.ephemeral && node.owner == Some(session))
        .map(|(path, _)| path.clone())
        .collect();
    for path in owned {
        state.nodes.remove(&path);
        notify_deleted(state, &path);
    }
}

/// Fire all delete watches registered on `path`
fn notify_deleted(state: &mut StoreState, path: &str) {
    if let Some(watchers) = state.delete_watches.remove(path) {
        for watcher in watchers {
            let _ = watcher.tx.send(WatchEvent::Deleted);
        }
    }
}

impl MemorySession {
    /// Fail unless this session is still alive
    fn ensure_alive(state: &StoreState, id: SessionId) -> Result<()> {
        match state.sessions.get(&id).map(|s| s.status) {
            Some(SessionStatus::Alive) => Ok(()),
            Some(SessionStatus::Closed) => Err(Error::SessionClosed),
            _ => Err(Error::SessionExpired),
        }
    }
}

#[async_trait]
impl CoordinationStore for MemorySession {
    fn session_id(&self) -> SessionId {
        self.id
    }

    async fn create(&self, path: &str, value: &[u8], mode: CreateMode) -> Result<String> {
        validate_path(path)?;
        let mut state = self.store.state.lock().await;
        Self::ensure_alive(&state, self.id)?;

        let final_path = if mode.is_sequential() {
            let parent = parent_of(path)
                .ok_or_else(|| Error::BadPath(path.to_string()))?
                .to_string();
            let counter = state.counters.entry(parent).or_insert(0);
            let sequence = *counter;
            *counter += 1;
            format!("{}{:010}", path, sequence)
        } else {
            path.to_string()
        };

        let parent = parent_of(&final_path).ok_or_else(|| Error::BadPath(final_path.clone()))?;
        if parent != "/" && !state.nodes.contains_key(parent) {
            return Err(Error::NoParent(final_path));
        }
        if state.nodes.contains_key(&final_path) {
            return Err(Error::NodeExists(final_path));
        }

        state.nodes.insert(
            final_path.clone(),
            Node {
                value: value.to_vec(),
                version: 0,
                created_at: chrono::Utc::now(),
                owner: mode.is_ephemeral().then_some(self.id),
                ephemeral: mode.is_ephemeral(),
            },
        );
        Ok(final_path)
    }

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        validate_path(path)?;
        let state = self.store.state.lock().await;
        Self::ensure_alive(&state, self.id)?;
        Ok(state.nodes.get(path).map(|node| node.value.clone()))
    }

    async fn write(
        &self,
        path: &str,
        value: &[u8],
        expected_version: Option<i64>,
    ) -> Result<NodeStat> {
        validate_path(path)?;
        let mut state = self.store.state.lock().await;
        Self::ensure_alive(&state, self.id)?;

        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| Error::NodeNotFound(path.to_string()))?;
        if let Some(expected) = expected_version {
            if node.version != expected {
                return Err(Error::VersionMismatch {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
        }
        node.value = value.to_vec();
        node.version += 1;
        Ok(node.stat())
    }

    async fn exists(&self, path: &str) -> Result<Option<NodeStat>> {
        validate_path(path)?;
        let state = self.store.state.lock().await;
        Self::ensure_alive(&state, self.id)?;
        Ok(state.nodes.get(path).map(|node| node.stat()))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        let mut state = self.store.state.lock().await;
        Self::ensure_alive(&state, self.id)?;

        if state.nodes.remove(path).is_none() {
            return Err(Error::NodeNotFound(path.to_string()));
        }
        notify_deleted(&mut state, path);
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        validate_path(path)?;
        let state = self.store.state.lock().await;
        Self::ensure_alive(&state, self.id)?;

        if !state.nodes.contains_key(path) {
            return Err(Error::NodeNotFound(path.to_string()));
        }
        let prefix = format!("{}/", path);
        let names = state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| !key[prefix.len()..].contains('/'))
            .map(|(key, _)| key[prefix.len()..].to_string())
            .collect();
        Ok(names)
    }

    async fn watch_delete(&self, path: &str) -> Result<Option<WatchReceiver>> {
        validate_path(path)?;
        let mut state = self.store.state.lock().await;
        Self::ensure_alive(&state, self.id)?;

        if !state.nodes.contains_key(path) {
            return Ok(None);
        }
        let (tx, rx) = oneshot::channel();
        state
            .delete_watches
            .entry(path.to_string())
            .or_default()
            .push(DeleteWatcher {
                session: self.id,
                tx,
            });
        Ok(Some(rx))
    }

    async fn watch_session(&self) -> Result<WatchReceiver> {
        let mut state = self.store.state.lock().await;
        Self::ensure_alive(&state, self.id)?;
        let (tx, rx) = oneshot::channel();
        state
            .sessions
            .get_mut(&self.id)
            .ok_or(Error::SessionExpired)?
            .watchers
            .push(tx);
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.store.state.lock().await;
        tracing::debug!("Closing coordination session {}", self.id);
        end_session(&mut state, self.id, SessionStatus::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_dir(dir: &str) -> (MemoryStore, MemorySession) {
        let store = MemoryStore::new();
        let session = store.connect().await.unwrap();
        let mut built = String::new();
        for segment in dir.split('/').filter(|s| !s.is_empty()) {
            built.push('/');
            built.push_str(segment);
            session
                .create(&built, b"", CreateMode::Persistent)
                .await
                .unwrap();
        }
        (store, session)
    }

    #[tokio::test]
    async fn test_sequential_numbering_is_monotonic_across_sessions() {
        let (store, a) = store_with_dir("/locks/web").await;
        let b = store.connect().await.unwrap();

        let first = a
            .create("/locks/web/lock-", b"a", CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let second = b
            .create("/locks/web/lock-", b"b", CreateMode::EphemeralSequential)
            .await
            .unwrap();

        assert_eq!(first, "/locks/web/lock-0000000000");
        assert_eq!(second, "/locks/web/lock-0000000001");
    }

    #[tokio::test]
    async fn test_ephemerals_die_with_their_session() {
        let (store, a) = store_with_dir("/locks/web").await;
        let b = store.connect().await.unwrap();

        let path = a
            .create("/locks/web/lock-", b"", CreateMode::EphemeralSequential)
            .await
            .unwrap();
        a.create("/marker", b"stays", CreateMode::Persistent)
            .await
            .unwrap();

        a.close().await.unwrap();

        assert!(b.exists(&path).await.unwrap().is_none());
        assert!(b.exists("/marker").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_watch_fires_once_on_delete() {
        let (store, a) = store_with_dir("/locks/web").await;
        let b = store.connect().await.unwrap();

        let path = a
            .create("/locks/web/lock-", b"", CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let rx = b.watch_delete(&path).await.unwrap().unwrap();

        a.delete(&path).await.unwrap();
        assert_eq!(rx.await.unwrap(), WatchEvent::Deleted);
    }

    #[tokio::test]
    async fn test_watch_on_missing_node_is_none() {
        let (_store, a) = store_with_dir("/locks/web").await;
        assert!(a
            .watch_delete("/locks/web/lock-0000000099")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_expiry_removes_ephemerals_and_notifies() {
        let (store, a) = store_with_dir("/locks/web").await;
        let b = store.connect().await.unwrap();

        let path = a
            .create("/locks/web/lock-", b"", CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let other_watch = b.watch_delete(&path).await.unwrap().unwrap();
        let own_session_watch = a.watch_session().await.unwrap();

        store.expire(a.session_id()).await;

        // The surviving session sees the deletion; the dead one sees expiry
        assert_eq!(other_watch.await.unwrap(), WatchEvent::Deleted);
        assert_eq!(own_session_watch.await.unwrap(), WatchEvent::SessionExpired);

        // The expired session can no longer operate
        assert!(matches!(
            a.read("/locks/web").await,
            Err(Error::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn test_versioned_write() {
        let (_store, a) = store_with_dir("/masters").await;
        a.create("/masters/web", b"host-a", CreateMode::Persistent)
            .await
            .unwrap();

        let stat = a.write("/masters/web", b"host-b", Some(0)).await.unwrap();
        assert_eq!(stat.version, 1);

        assert!(matches!(
            a.write("/masters/web", b"host-c", Some(0)).await,
            Err(Error::VersionMismatch { .. })
        ));
        // Unconditional write always lands
        a.write("/masters/web", b"host-c", None).await.unwrap();
        assert_eq!(a.read("/masters/web").await.unwrap().unwrap(), b"host-c");
    }

    #[tokio::test]
    async fn test_children_lists_names_only() {
        let (_store, a) = store_with_dir("/locks/web").await;
        a.create("/locks/web/lock-", b"", CreateMode::EphemeralSequential)
            .await
            .unwrap();
        a.create("/locks/web/lock-", b"", CreateMode::EphemeralSequential)
            .await
            .unwrap();

        let names = a.children("/locks/web").await.unwrap();
        assert_eq!(
            names,
            vec!["lock-0000000000".to_string(), "lock-0000000001".to_string()]
        );

        // /locks has one child, the group directory
        assert_eq!(a.children("/locks").await.unwrap(), vec!["web".to_string()]);
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let store = MemoryStore::new();
        let a = store.connect().await.unwrap();
        assert!(matches!(
            a.create("/locks/web/lock-", b"", CreateMode::EphemeralSequential)
                .await,
            Err(Error::NoParent(_))
        ));
    }
}

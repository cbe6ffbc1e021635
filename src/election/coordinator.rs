//! Coordinator
//!
//! Process lifecycle around the election: ensures base paths exist, runs the
//! lock, publishes the winner's identity, and guarantees that the lock is
//! released and the session closed on every exit path, including
//! signal-driven shutdown.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::election::{ElectionLock, LeadershipPublisher, LockEvent};
use crate::error::{Error, Result};
use crate::retry::{with_retries, RetryPolicy};
use crate::store::{CoordinationStore, CreateMode};

/// Base path for group lock directories
pub const LOCK_BASE_PATH: &str = "/locks";
/// Base path for leadership records
pub const MASTER_BASE_PATH: &str = "/masters";

/// Lock directory of a group, e.g. `/locks/web`
pub fn lock_dir(group: &str) -> String {
    format!("{}/{}", LOCK_BASE_PATH, group)
}

/// Leadership record path of a group, e.g. `/masters/web`
pub fn master_path(group: &str) -> String {
    format!("{}/{}", MASTER_BASE_PATH, group)
}

/// Lifecycle state of a [`Coordinator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Not started
    Idle,
    /// Registering as a candidate
    Joining,
    /// Holding group leadership
    Leading,
    /// Registered candidate, waiting for promotion
    Following,
    /// Shut down; lock released and session closed
    Stopped,
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorState::Idle => write!(f, "IDLE"),
            CoordinatorState::Joining => write!(f, "JOINING"),
            CoordinatorState::Leading => write!(f, "LEADING"),
            CoordinatorState::Following => write!(f, "FOLLOWING"),
            CoordinatorState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Runs one process's participation in a group's leader election
pub struct Coordinator {
    store: Arc<dyn CoordinationStore>,
    group: String,
    /// Identity published when this process leads; injected, never resolved
    /// from global state here
    identity: String,
    retry: RetryPolicy,
    state: RwLock<CoordinatorState>,
}

impl Coordinator {
    /// Create a coordinator for `group`, publishing `identity` on leadership
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        group: String,
        identity: String,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            group,
            identity,
            retry,
            state: RwLock::new(CoordinatorState::Idle),
        }
    }

    /// Current lifecycle state
    pub async fn state(&self) -> CoordinatorState {
        *self.state.read().await
    }

    /// Identity this coordinator publishes when leading
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Join the group and participate in leader election until `shutdown`
    /// fires or the candidacy fails.
    ///
    /// Blocks for the lifetime of the candidacy. Every exit, whether clean
    /// shutdown, publish failure, or session loss, runs the release path:
    /// the lock is unlocked (firing `Released` if leading) and the store
    /// session closed.
    pub async fn join(&self, shutdown: CancellationToken) -> Result<()> {
        *self.state.write().await = CoordinatorState::Joining;
        tracing::info!("Joining group {} as {}", self.group, self.identity);

        let result = self.run(&shutdown).await;

        *self.state.write().await = CoordinatorState::Stopped;
        if let Err(e) = &result {
            tracing::error!("Left group {}: {}", self.group, e);
        } else {
            tracing::info!("Left group {}", self.group);
        }
        result
    }

    async fn run(&self, shutdown: &CancellationToken) -> Result<()> {
        self.ensure_path(MASTER_BASE_PATH, b"master_location").await?;
        self.ensure_path(LOCK_BASE_PATH, b"lock_management").await?;
        let dir = lock_dir(&self.group);
        self.ensure_path(&dir, b"").await?;

        let (events_tx, events_rx) = mpsc::channel(8);
        let lock = ElectionLock::new(
            Arc::clone(&self.store),
            dir,
            self.identity.clone(),
            events_tx,
            self.retry.clone(),
        );
        let publisher = LeadershipPublisher::new(Arc::clone(&self.store), &self.group);

        tracing::info!("Trying to obtain the group leadership lock");
        let result = self.drive(&lock, &publisher, events_rx, shutdown).await;

        // Guaranteed-release path, on every exit from the candidacy scope
        if let Err(e) = lock.unlock().await {
            tracing::warn!("Failed to release lock during shutdown: {}", e);
        }
        tracing::info!("Closing coordination store session");
        if let Err(e) = self.store.close().await {
            tracing::warn!("Failed to close store session: {}", e);
        }
        result
    }

    async fn drive(
        &self,
        lock: &ElectionLock,
        publisher: &LeadershipPublisher,
        mut events: mpsc::Receiver<LockEvent>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        // The Acquired for an immediate win still arrives on the channel, so
        // both outcomes converge on the event loop below.
        if !lock.lock().await? {
            *self.state.write().await = CoordinatorState::Following;
            tracing::info!("Leadership held elsewhere; registered as candidate");
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Stopping");
                    return Ok(());
                }
                event = events.recv() => match event {
                    Some(LockEvent::Acquired) => {
                        if let Err(e) = publisher.publish(&self.identity).await {
                            // Surfacing without releasing would leave a
                            // leader that never published; the release path
                            // in `run` undoes the lock before we return.
                            tracing::error!("Failed to publish leadership record: {}", e);
                            return Err(e);
                        }
                        *self.state.write().await = CoordinatorState::Leading;
                        tracing::info!("We are now the leader of group {}", self.group);
                    }
                    Some(LockEvent::Released) => {
                        tracing::info!("Leadership period ended");
                    }
                    Some(LockEvent::Lost) => {
                        let was_leading =
                            *self.state.read().await == CoordinatorState::Leading;
                        return Err(if was_leading {
                            Error::LeadershipLost
                        } else {
                            Error::SessionExpired
                        });
                    }
                    None => {
                        return Err(Error::Internal("lock event channel closed".into()));
                    }
                }
            }
        }
    }

    /// Idempotent create-if-absent for a persistent base path
    async fn ensure_path(&self, path: &str, value: &[u8]) -> Result<()> {
        with_retries(&self.retry, "base path creation", || {
            self.ensure_path_once(path, value)
        })
        .await
    }

    async fn ensure_path_once(&self, path: &str, value: &[u8]) -> Result<()> {
        if self.store.exists(path).await?.is_some() {
            return Ok(());
        }
        tracing::info!("Creating base path {}", path);
        match self
            .store
            .create(path, value, CreateMode::Persistent)
            .await
        {
            Ok(_) => Ok(()),
            // Another candidate created it between our check and create
            Err(Error::NodeExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Check whether this host is the group leader, by comparing the
    /// published leadership record to our identity (case-sensitive exact
    /// match). Runs independently of the election state machine.
    pub async fn is_leader(&self) -> Result<bool> {
        match self.current_leader().await? {
            Some(leader) => Ok(leader == self.identity),
            None => Ok(false),
        }
    }

    /// Last published leader of the group, or `None` if nobody ever led.
    ///
    /// Best-effort read: answers "who most recently became leader".
    pub async fn current_leader(&self) -> Result<Option<String>> {
        let publisher = LeadershipPublisher::new(Arc::clone(&self.store), &self.group);
        let leader = publisher.query().await?;
        match &leader {
            Some(identity) => tracing::info!("Current leader of {}: {}", self.group, identity),
            None => tracing::info!("Group {} has no published leader", self.group),
        }
        Ok(leader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SessionId};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn coordinator(
        store: &MemoryStore,
        identity: &str,
    ) -> (Arc<Coordinator>, SessionId) {
        let session = store.connect().await.unwrap();
        let session_id = session.session_id();
        let coordinator = Arc::new(Coordinator::new(
            Arc::new(session),
            "web".to_string(),
            identity.to_string(),
            RetryPolicy::default(),
        ));
        (coordinator, session_id)
    }

    async fn wait_for_state(coordinator: &Arc<Coordinator>, expected: CoordinatorState) {
        timeout(Duration::from_secs(2), async {
            loop {
                if coordinator.state().await == expected {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("coordinator never reached {}", expected));
    }

    #[tokio::test]
    async fn test_first_joiner_leads_and_publishes() {
        let store = MemoryStore::new();
        let (a, _) = coordinator(&store, "host-a").await;
        let shutdown = CancellationToken::new();

        let handle = {
            let a = Arc::clone(&a);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { a.join(shutdown).await })
        };

        wait_for_state(&a, CoordinatorState::Leading).await;

        // The record is visible to an independent reader session
        let (reader, _) = coordinator(&store, "host-a").await;
        assert!(reader.is_leader().await.unwrap());
        let (other, _) = coordinator(&store, "host-b").await;
        assert!(!other.is_leader().await.unwrap());

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(a.state().await, CoordinatorState::Stopped);

        // The lock node is gone; the persistent record remains
        let session = store.connect().await.unwrap();
        assert!(session.children("/locks/web").await.unwrap().is_empty());
        assert_eq!(
            session.read("/masters/web").await.unwrap().unwrap(),
            b"host-a"
        );
    }

    #[tokio::test]
    async fn test_follower_promotes_after_leader_leaves() {
        let store = MemoryStore::new();
        let (a, _) = coordinator(&store, "host-a").await;
        let (b, _) = coordinator(&store, "host-b").await;
        let a_shutdown = CancellationToken::new();
        let b_shutdown = CancellationToken::new();

        let a_handle = {
            let a = Arc::clone(&a);
            let shutdown = a_shutdown.clone();
            tokio::spawn(async move { a.join(shutdown).await })
        };
        wait_for_state(&a, CoordinatorState::Leading).await;

        let b_handle = {
            let b = Arc::clone(&b);
            let shutdown = b_shutdown.clone();
            tokio::spawn(async move { b.join(shutdown).await })
        };
        wait_for_state(&b, CoordinatorState::Following).await;

        a_shutdown.cancel();
        a_handle.await.unwrap().unwrap();

        wait_for_state(&b, CoordinatorState::Leading).await;
        let (reader, _) = coordinator(&store, "host-b").await;
        assert_eq!(
            reader.current_leader().await.unwrap().as_deref(),
            Some("host-b")
        );

        b_shutdown.cancel();
        b_handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_query_before_any_candidate_is_no_leader() {
        let store = MemoryStore::new();
        let (reader, _) = coordinator(&store, "host-a").await;
        assert_eq!(reader.current_leader().await.unwrap(), None);
        assert!(!reader.is_leader().await.unwrap());
    }

    #[tokio::test]
    async fn test_leader_expiry_surfaces_leadership_lost() {
        let store = MemoryStore::new();
        let (a, a_session) = coordinator(&store, "host-a").await;
        let shutdown = CancellationToken::new();

        let handle = {
            let a = Arc::clone(&a);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { a.join(shutdown).await })
        };
        wait_for_state(&a, CoordinatorState::Leading).await;

        store.expire(a_session).await;

        let result = handle.await.unwrap();
        match result {
            Err(e) => assert_eq!(e.exit_code(), 4),
            Ok(()) => panic!("join should fail after leader session expiry"),
        }
        assert_eq!(a.state().await, CoordinatorState::Stopped);
    }

    #[tokio::test]
    async fn test_follower_expiry_surfaces_election_failure() {
        let store = MemoryStore::new();
        let (a, _) = coordinator(&store, "host-a").await;
        let (b, b_session) = coordinator(&store, "host-b").await;
        let a_shutdown = CancellationToken::new();

        let a_handle = {
            let a = Arc::clone(&a);
            let shutdown = a_shutdown.clone();
            tokio::spawn(async move { a.join(shutdown).await })
        };
        wait_for_state(&a, CoordinatorState::Leading).await;

        let b_handle = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.join(CancellationToken::new()).await })
        };
        wait_for_state(&b, CoordinatorState::Following).await;

        store.expire(b_session).await;

        let result = b_handle.await.unwrap();
        assert!(matches!(result, Err(Error::SessionExpired)));

        a_shutdown.cancel();
        a_handle.await.unwrap().unwrap();
    }
}

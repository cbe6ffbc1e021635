//! Election Lock
//!
//! Sequential-ephemeral mutual exclusion over the coordination store. Each
//! candidate creates one ephemeral sequential node under the group's lock
//! directory; the smallest live sequence number holds leadership. Everyone
//! else watches only its immediate predecessor, so a deletion wakes at most
//! one waiting process instead of the whole herd.
//!
//! Watch notifications arrive on an arbitrary store thread; they are pushed
//! through a single watcher task per lock instance, which serializes all
//! promotion decisions against concurrent `unlock()` calls via the shared
//! state mutex.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::retry::{with_retries, RetryPolicy};
use crate::store::{CoordinationStore, CreateMode, WatchEvent, WatchReceiver};

/// Prefix of lock node names under the group lock directory
pub const LOCK_NODE_PREFIX: &str = "lock-";

/// Leadership transitions emitted by an [`ElectionLock`].
///
/// `Acquired` and `Released` fire exactly once per leadership period, in
/// order, including periods ended by session loss. `Lost` is terminal: the
/// candidacy is gone and a fresh lock with a new session is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    /// This process became the group leader
    Acquired,
    /// This process's leadership period ended
    Released,
    /// Candidacy ended; the old sequence number cannot be resumed
    Lost,
}

/// Sequential-ephemeral election lock for one group
#[derive(Clone)]
pub struct ElectionLock {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn CoordinationStore>,
    /// Group lock directory, e.g. `/locks/web`
    dir: String,
    /// Value stored in our lock node, for operator inspection
    identity: String,
    events: mpsc::Sender<LockEvent>,
    retry: RetryPolicy,
    state: Mutex<LockState>,
}

#[derive(Default)]
struct LockState {
    /// Full path of our lock node while registered as a candidate
    node: Option<String>,
    /// Store-assigned sequence number of our node
    sequence: Option<u64>,
    /// Predecessor path currently watched
    watching: Option<String>,
    /// Whether an `Acquired` has fired without a matching `Released`
    held: bool,
    /// Cancels the watcher task of the current candidacy
    cancel: Option<CancellationToken>,
}

/// Where this candidate stands after evaluating the candidate set
enum Position {
    Leader,
    Waiting {
        predecessor: String,
        watch: WatchReceiver,
    },
}

/// Parse the sequence number out of a lock node name
fn parse_sequence(name: &str) -> Option<u64> {
    name.strip_prefix(LOCK_NODE_PREFIX)?.parse().ok()
}

impl ElectionLock {
    /// Create a lock for the given group lock directory.
    ///
    /// Events are delivered on `events`; the receiver should be drained by a
    /// single consumer (the coordinator loop).
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        dir: String,
        identity: String,
        events: mpsc::Sender<LockEvent>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                dir,
                identity,
                events,
                retry,
                state: Mutex::new(LockState::default()),
            }),
        }
    }

    /// Attempt to acquire group leadership.
    ///
    /// Registers this process as a candidate and returns as soon as its
    /// position in the ordering is known: `true` if leadership was acquired
    /// immediately, `false` if another process leads, in which case this
    /// process stays registered and is promoted later through the event
    /// channel. Calling `lock()` while already a candidate is a no-op that
    /// reports the current held status.
    ///
    /// On failure no candidacy remains: a node created before the error is
    /// removed again, so a failed call never leaves a ghost candidate that
    /// other processes would wait on.
    pub async fn lock(&self) -> Result<bool> {
        {
            let state = self.inner.state.lock().await;
            if state.node.is_some() {
                return Ok(state.held);
            }
        }

        let prefix = format!("{}/{}", self.inner.dir, LOCK_NODE_PREFIX);
        let store = &self.inner.store;
        let value = self.inner.identity.as_bytes();
        let path = with_retries(&self.inner.retry, "lock node creation", || {
            store.create(&prefix, value, CreateMode::EphemeralSequential)
        })
        .await?;

        let name = path.rsplit('/').next().unwrap_or(&path);
        let sequence = parse_sequence(name)
            .ok_or_else(|| Error::Internal(format!("store returned unparsable node {}", path)))?;
        tracing::info!("Registered candidate {} (sequence {})", path, sequence);

        let cancel = CancellationToken::new();
        {
            let mut state = self.inner.state.lock().await;
            state.node = Some(path);
            state.sequence = Some(sequence);
            state.watching = None;
            state.held = false;
            state.cancel = Some(cancel.clone());
        }

        // Armed before the ordering check so an expiry between the two cannot
        // go unnoticed while we believe we are a candidate.
        let session_watch = with_retries(&self.inner.retry, "session watch", || {
            self.inner.store.watch_session()
        })
        .await;
        let session_watch = match session_watch {
            Ok(watch) => watch,
            Err(e) => return Err(self.withdraw(e).await),
        };

        let position = match self.inner.establish_position().await {
            Ok(position) => position,
            Err(e) => return Err(self.withdraw(e).await),
        };
        match position {
            Some(Position::Leader) => {
                let promoted = self.inner.promote().await;
                self.spawn_watcher(None, session_watch, cancel);
                Ok(promoted)
            }
            Some(Position::Waiting { predecessor, watch }) => {
                tracing::info!(
                    "Leadership held elsewhere; watching predecessor {}",
                    predecessor
                );
                self.spawn_watcher(Some(watch), session_watch, cancel);
                Ok(false)
            }
            // Candidacy withdrawn by a concurrent unlock
            None => Ok(false),
        }
    }

    /// Roll back a candidacy whose registration failed partway, returning
    /// the original failure for the caller to surface. Leadership was never
    /// held at this point, so no event is emitted.
    async fn withdraw(&self, cause: Error) -> Error {
        tracing::warn!("Withdrawing candidacy after registration failure: {}", cause);
        if let Err(e) = self.unlock().await {
            tracing::warn!("Could not remove lock node while withdrawing: {}", e);
        }
        cause
    }

    /// Release this process's candidacy and, if held, its leadership.
    ///
    /// Idempotent: removes the lock node if present, emits `Released` exactly
    /// once iff leadership was held, and is safe to call while an election
    /// watch is in flight or after the node is already gone.
    pub async fn unlock(&self) -> Result<()> {
        let node = {
            let mut state = self.inner.state.lock().await;
            let node = state.node.take();
            state.sequence = None;
            state.watching = None;
            let was_held = state.held;
            state.held = false;
            if let Some(cancel) = state.cancel.take() {
                cancel.cancel();
            }
            // Emitted under the state lock so a concurrent promotion cannot
            // enqueue its `Acquired` after this `Released`; emitted before
            // the node removal so a fired `Acquired` always gets its pair
            // even when the removal fails.
            if was_held {
                tracing::info!("Released group leadership");
                let _ = self.inner.events.send(LockEvent::Released).await;
            }
            node
        };

        let Some(path) = node else {
            return Ok(());
        };

        let store = &self.inner.store;
        let delete = with_retries(&self.inner.retry, "lock node removal", || {
            store.delete(&path)
        })
        .await;
        match delete {
            Ok(()) => tracing::info!("Removed lock node {}", path),
            Err(Error::NodeNotFound(_)) => {}
            Err(e) if e.is_session_loss() => {
                // The store already reclaimed the ephemeral node
                tracing::debug!("Lock node {} reclaimed by the store: {}", path, e);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Whether this process currently holds leadership
    pub async fn is_held(&self) -> bool {
        self.inner.state.lock().await.held
    }

    /// Path of the predecessor node currently watched, if waiting
    pub async fn watched_predecessor(&self) -> Option<String> {
        self.inner.state.lock().await.watching.clone()
    }

    fn spawn_watcher(
        &self,
        predecessor: Option<WatchReceiver>,
        session: WatchReceiver,
        cancel: CancellationToken,
    ) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(run_watcher(inner, predecessor, session, cancel));
    }
}

impl Inner {
    /// Evaluate the candidate set once: leader if our sequence is the
    /// smallest, otherwise arm a one-shot watch on the immediate predecessor.
    /// Loops when the predecessor vanishes between listing and registration.
    /// Returns `None` when the candidacy was withdrawn concurrently.
    async fn establish_position(&self) -> Result<Option<Position>> {
        loop {
            let sequence = {
                let state = self.state.lock().await;
                match state.sequence {
                    Some(s) if state.node.is_some() => s,
                    _ => return Ok(None),
                }
            };

            let names = with_retries(&self.retry, "candidate listing", || {
                self.store.children(&self.dir)
            })
            .await?;
            let candidates: Vec<u64> = names.iter().filter_map(|n| parse_sequence(n)).collect();

            if !candidates.contains(&sequence) {
                // Our ephemeral node vanished without an unlock: the session
                // is gone as far as the store is concerned.
                return Err(Error::SessionExpired);
            }
            if candidates.iter().all(|&s| s >= sequence) {
                return Ok(Some(Position::Leader));
            }

            // Largest sequence strictly below ours. Ties are impossible:
            // the store assigns sequence numbers uniquely.
            let predecessor_seq = candidates
                .iter()
                .filter(|&&s| s < sequence)
                .max()
                .copied()
                .unwrap();
            let predecessor = format!("{}/{}{:010}", self.dir, LOCK_NODE_PREFIX, predecessor_seq);

            let watch = with_retries(&self.retry, "predecessor watch", || {
                self.store.watch_delete(&predecessor)
            })
            .await?;
            match watch {
                Some(watch) => {
                    let mut state = self.state.lock().await;
                    if state.node.is_none() {
                        return Ok(None);
                    }
                    state.watching = Some(predecessor.clone());
                    return Ok(Some(Position::Waiting { predecessor, watch }));
                }
                // Predecessor disappeared before the watch was armed;
                // re-evaluate against the current candidate set.
                None => continue,
            }
        }
    }

    /// Transition to leader and emit `Acquired`, unless the candidacy was
    /// withdrawn or leadership is already held.
    async fn promote(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.node.is_none() || state.held {
            return state.held;
        }
        state.held = true;
        state.watching = None;
        tracing::info!("Acquired group leadership");
        // Emitted under the state lock so a concurrent `unlock()` cannot
        // slip its `Released` ahead of this `Acquired`.
        let _ = self.events.send(LockEvent::Acquired).await;
        true
    }

    /// Tear down the candidacy after session loss or an unrecoverable watch
    /// failure. Emits `Released` (iff held) followed by `Lost`, exactly once.
    async fn abandon(&self) {
        let node = {
            let mut state = self.state.lock().await;
            if state.node.is_none() && !state.held {
                return;
            }
            let node = state.node.take();
            state.sequence = None;
            state.watching = None;
            let was_held = state.held;
            state.held = false;
            if let Some(cancel) = state.cancel.take() {
                cancel.cancel();
            }
            // Same ordering rule as `unlock()`: events go out under the
            // state lock, in transition order.
            if was_held {
                tracing::warn!("Leadership period ended by session loss");
                let _ = self.events.send(LockEvent::Released).await;
            } else {
                tracing::warn!("Candidacy ended by session loss");
            }
            let _ = self.events.send(LockEvent::Lost).await;
            node
        };

        // Best effort: with an expired session the store has already
        // reclaimed the node.
        if let Some(path) = node {
            match self.store.delete(&path).await {
                Ok(()) | Err(Error::NodeNotFound(_)) => {}
                Err(e) if e.is_session_loss() => {}
                Err(e) => tracing::warn!("Failed to remove lock node {}: {}", path, e),
            }
        }
    }
}

/// Single consumer of watch notifications for one candidacy.
///
/// Runs until the candidacy ends: cancellation (unlock), session end, or an
/// unrecoverable failure while re-evaluating the ordering.
async fn run_watcher(
    inner: Arc<Inner>,
    mut predecessor: Option<WatchReceiver>,
    mut session: WatchReceiver,
    cancel: CancellationToken,
) {
    loop {
        if let Some(mut watch) = predecessor.take() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = &mut session => {
                    inner.abandon().await;
                    return;
                }
                event = &mut watch => {
                    match event {
                        Ok(WatchEvent::Deleted) => {
                            match inner.establish_position().await {
                                Ok(Some(Position::Leader)) => {
                                    inner.promote().await;
                                    // Keep running: only session loss or
                                    // unlock ends a leadership period.
                                }
                                Ok(Some(Position::Waiting { predecessor: next, watch })) => {
                                    tracing::debug!("Now watching predecessor {}", next);
                                    predecessor = Some(watch);
                                }
                                Ok(None) => return,
                                Err(e) => {
                                    tracing::error!("Failed to re-evaluate candidate ordering: {}", e);
                                    inner.abandon().await;
                                    return;
                                }
                            }
                        }
                        Ok(WatchEvent::SessionExpired) | Err(_) => {
                            inner.abandon().await;
                            return;
                        }
                    }
                }
            }
        } else {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = &mut session => {
                    inner.abandon().await;
                    return;
                }
            }
        }
    }
}

//! Leadership Publisher
//!
//! Maintains the persistent "current master" record for a group. Only the
//! process that just confirmed leadership writes it; any process may read it
//! as a best-effort answer to "who most recently became leader".

use std::sync::Arc;

use crate::election::coordinator::master_path;
use crate::error::{Error, Result};
use crate::store::{CoordinationStore, CreateMode};

/// Publishes and queries the group's leadership record
pub struct LeadershipPublisher {
    store: Arc<dyn CoordinationStore>,
    /// Record path, e.g. `/masters/web`
    path: String,
}

impl LeadershipPublisher {
    /// Create a publisher for the given group
    pub fn new(store: Arc<dyn CoordinationStore>, group: &str) -> Self {
        Self {
            store,
            path: master_path(group),
        }
    }

    /// Publish `identity` as the current leader.
    ///
    /// Called only by the process that just acquired the lock. The write is
    /// unconditional: mutual exclusion on the lock already guarantees a
    /// single writer, so no compare-and-swap is performed.
    pub async fn publish(&self, identity: &str) -> Result<()> {
        let value = identity.as_bytes();
        if self.store.exists(&self.path).await?.is_some() {
            tracing::info!("Updating leadership record {} to {}", self.path, identity);
            self.store.write(&self.path, value, None).await?;
            return Ok(());
        }

        tracing::info!("Creating leadership record {} as {}", self.path, identity);
        match self
            .store
            .create(&self.path, value, CreateMode::Persistent)
            .await
        {
            Ok(_) => Ok(()),
            // First-ever publish racing a concurrent creator: fall back to
            // the overwrite path.
            Err(Error::NodeExists(_)) => {
                self.store.write(&self.path, value, None).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Read the last published leader identity.
    ///
    /// Returns `Ok(None)` when no leader has ever been published. The value
    /// is "last known leader": it can lag actual lock ownership for the
    /// duration of an election-plus-publish round trip after a failure.
    pub async fn query(&self) -> Result<Option<String>> {
        match self.store.read(&self.path).await? {
            None => Ok(None),
            Some(bytes) => {
                let identity =
                    String::from_utf8(bytes).map_err(|_| Error::CorruptLeadershipRecord)?;
                Ok(Some(identity))
            }
        }
    }
}

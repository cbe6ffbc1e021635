//! Herdlock - Group Leader Election
//!
//! Lets any number of independent host processes belonging to a named service
//! group agree on exactly one leader at a time, survive leader crashes, and
//! cheaply query who the current leader is. Consensus is delegated entirely
//! to an external hierarchical coordination store (ephemeral/sequential
//! nodes, one-shot watches, session-based liveness), consumed through the
//! [`store::CoordinationStore`] trait.
//!
//! # Protocol
//!
//! Each candidate creates an ephemeral sequential node under
//! `/locks/<group>/`; the smallest sequence number leads and publishes its
//! host identity to `/masters/<group>`. Every other candidate watches only
//! its immediate predecessor, so a crash or release wakes exactly one
//! process. Session expiry ends a candidacy permanently; rejoining requires
//! a fresh session and a fresh node.
//!
//! # Features
//!
//! - Strict mutual exclusion under concurrent joins, backed by the store's
//!   atomic sequence assignment
//! - O(1) notification fan-out per deletion (no thundering herd)
//! - Exactly-once acquired/released transitions, including on session loss
//! - Best-effort "who is the leader" queries that never block an election
//! - Guaranteed lock release on shutdown, signal-driven exits included

pub mod config;
pub mod election;
pub mod error;
pub mod retry;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::election::{Coordinator, CoordinatorState, ElectionLock, LockEvent};
    pub use crate::error::{Error, Result};
    pub use crate::retry::RetryPolicy;
    pub use crate::store::{CoordinationStore, CreateMode, MemoryStore};
}

//! Election Module
//!
//! Leader election for service groups: the sequential-ephemeral lock, the
//! leadership-record publisher, and the process-lifecycle coordinator.

pub mod coordinator;
mod lock;
mod publisher;

pub use coordinator::{
    lock_dir, master_path, Coordinator, CoordinatorState, LOCK_BASE_PATH, MASTER_BASE_PATH,
};
pub use lock::{ElectionLock, LockEvent, LOCK_NODE_PREFIX};
pub use publisher::LeadershipPublisher;

//! Persistence adapters.
//!
//! Each document is attached to a local adapter, which loads it from and
//! streams its updates into the durable local store, and optionally to a
//! remote adapter, which exchanges updates with the relay.

pub mod local;
pub mod remote;
pub mod store;

pub use local::LocalPersistence;
pub use remote::{Relay, RelayLink, RelayMessage, RemotePersistence};
pub use store::{LocalStore, MemoryStore, MetaStore};

use crate::error::PersistenceError;

/// Progress of an adapter's initial synchronization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncState {
    Pending,
    Synced,
    Failed(PersistenceError),
}

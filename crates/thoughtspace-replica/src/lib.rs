//! # thoughtspace-replica
//!
//! Offline-first replication of a thoughtspace: an outline of Thoughts and
//! the Lexemes that index them by normalized value.
//!
//! Every entity lives in its own replicated document, stored in a local
//! append-only store and optionally exchanged with a relay. A shared
//! doclog records which entities changed; each replica replays it to find
//! out what other replicas wrote.
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use thoughtspace_replica::{
//!     MemoryStore, MemoryView, ReplicaConfig, Stores, Thought, Thoughtspace, UpdateBatch, ROOT,
//! };
//!
//! #[tokio::main]
//! async fn main() -> thoughtspace_replica::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let view = Arc::new(MemoryView::new());
//!     let thoughtspace = Thoughtspace::open(ReplicaConfig::default(), Stores::memory(store), view);
//!
//!     let thought = Thought::new("t1", "Work", 0.0, ROOT);
//!     thoughtspace
//!         .update_thoughts(UpdateBatch::new().put_thought(thought.clone()))
//!         .await?;
//!
//!     assert_eq!(thoughtspace.get_thought_by_id(&thought.id).await, Some(thought));
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - [`thoughtspace`] - the engine facade
//! - [`registry`] - live entity documents and their adapters
//! - [`persistence`] - local store and relay adapters
//! - [`replication`] - doclog replay with persisted cursors
//! - `repair` - structural fixes once remote data arrives
//! - [`task_queue`] / [`throttle`] - bounded concurrency and notification merging
//! - [`relay`] - an in-memory relay and its doclog sweeper

pub mod batch;
pub mod config;
pub mod doclog;
pub mod document;
pub mod entity;
pub mod error;
pub mod name;
pub mod persistence;
pub mod registry;
pub mod relay;
mod repair;
pub mod replication;
pub mod shared;
pub mod status;
pub mod task_queue;
pub mod thoughtspace;
pub mod throttle;
pub mod view;

// Re-exports for convenience
pub use batch::UpdateBatch;
pub use config::{ReplicaConfig, ReplicaConfigBuilder};
pub use doclog::{Doclog, DoclogAction, DoclogEntry};
pub use document::EntityDocument;
pub use entity::{
    child_key, normalize, Entity, EntityKind, Lexeme, Thought, ThoughtId, ABSOLUTE, EM, ROOT,
    ROOT_PARENT_ID,
};
pub use error::{PersistenceError, RelayError, ReplicaError, Result};
pub use name::{DocumentKind, DocumentName};
pub use persistence::{LocalStore, MemoryStore, MetaStore, Relay, RelayMessage};
pub use registry::{LoadMode, Registry};
pub use relay::{DoclogSweeper, MemoryRelay};
pub use replication::{Cursors, DoclogHandler, ReplicationController};
pub use status::{ConnectionStatus, SyncStatus};
pub use task_queue::{Progress, TaskQueue, TaskQueueBuilder};
pub use thoughtspace::{ReplicateTree, Stores, Thoughtspace};
pub use throttle::BatchThrottle;
pub use view::{MemoryView, StoreView};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::batch::UpdateBatch;
    pub use crate::config::ReplicaConfig;
    pub use crate::entity::{Lexeme, Thought, ThoughtId};
    pub use crate::error::ReplicaError;
    pub use crate::thoughtspace::{Stores, Thoughtspace};
    pub use crate::view::{MemoryView, StoreView};
}

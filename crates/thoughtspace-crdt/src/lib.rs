//! # thoughtspace-crdt
//!
//! Mergeable document primitives driven by the thoughtspace replication
//! engine:
//!
//! - [`Lattice`] - the join-semilattice contract every mergeable type obeys
//! - [`Register`] / [`LwwMap`] - last-writer-wins values keyed by string
//! - [`Doc`] - a transactional document of JSON fields and nested maps
//! - [`Sequence`] - a replicated growable array used for append-only logs
//!
//! ## Example
//!
//! ```rust
//! use serde_json::json;
//! use thoughtspace_crdt::{Doc, ReplicaId};
//!
//! let mut alice = Doc::new("ts/thought/t1", ReplicaId::new("alice"));
//! let mut bob = Doc::new("ts/thought/t1", ReplicaId::new("bob"));
//!
//! let (_, a) = alice.transact(|txn| txn.map_set("childrenMap", "a", json!("a")));
//! let (_, b) = bob.transact(|txn| txn.map_set("childrenMap", "b", json!("b")));
//!
//! alice.apply(&b);
//! bob.apply(&a);
//! assert_eq!(alice.to_json(), bob.to_json());
//! ```

pub mod doc;
pub mod error;
pub mod lattice;
pub mod map;
pub mod register;
pub mod replicated;
pub mod sequence;
pub mod stamp;

pub use doc::{Doc, DocState, Transaction, Value};
pub use error::{CrdtError, Result};
pub use lattice::Lattice;
pub use map::LwwMap;
pub use register::Register;
pub use replicated::Replicated;
pub use sequence::{Sequence, SequenceNode, SequenceUpdate};
pub use stamp::{LamportClock, ReplicaId, Stamp};

//! Error types for the replication engine.

use crate::entity::EntityKind;
use thiserror::Error;
use thoughtspace_crdt::CrdtError;

/// Failures of the local durable store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// The operation was interrupted, e.g. the store was torn down while
    /// the process was shutting down. Retried after a fixed delay.
    #[error("Operation aborted: {0}")]
    Aborted(String),

    /// The entry does not exist. Deleting it is treated as success.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl PersistenceError {
    pub fn is_abort(&self) -> bool {
        matches!(self, PersistenceError::Aborted(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PersistenceError::NotFound(_))
    }
}

/// Failures talking to the relay.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Relay is offline")]
    Offline,

    #[error("Not authorized to access {0}")]
    Unauthorized(String),

    #[error("Relay I/O error: {0}")]
    Io(String),
}

#[derive(Error, Debug, Clone)]
pub enum ReplicaError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Document(#[from] CrdtError),

    #[error("Unknown doclog action {action} for {kind} {id}")]
    UnknownDoclogAction {
        kind: EntityKind,
        id: String,
        action: u8,
    },

    #[error("Invalid document name: {0}")]
    InvalidDocumentName(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for ReplicaError {
    fn from(err: serde_json::Error) -> Self {
        ReplicaError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReplicaError>;

//! Byte-level contract between a replicated structure and the persistence
//! layers that store or ship it.
//!
//! Stores and relays never interpret updates; they only keep and forward
//! the bytes produced here.

use crate::doc::{Doc, DocState};
use crate::error::Result;

pub trait Replicated: Send + 'static {
    /// Globally unique document name.
    fn guid(&self) -> &str;

    /// True if nothing has been written yet.
    fn is_empty(&self) -> bool;

    /// Encode the whole state as a single update.
    fn encode_state(&self) -> Result<Vec<u8>>;

    /// Decode and join an update. Returns true if anything changed.
    fn apply_encoded(&mut self, update: &[u8]) -> Result<bool>;
}

impl Replicated for Doc {
    fn guid(&self) -> &str {
        Doc::guid(self)
    }

    fn is_empty(&self) -> bool {
        self.state().is_empty()
    }

    fn encode_state(&self) -> Result<Vec<u8>> {
        self.state().encode()
    }

    fn apply_encoded(&mut self, update: &[u8]) -> Result<bool> {
        let update = DocState::decode(update)?;
        Ok(self.apply(&update))
    }
}

//! The doclog: a replicated, append-only record of which entities changed.
//!
//! It has one column per entity kind. Every replica appends an entry for
//! each entity it writes or deletes, and every replica walks the log to
//! find out what to pull.

use crate::entity::EntityKind;
use crate::error::{ReplicaError, Result};
use serde::{Deserialize, Serialize};
use thoughtspace_crdt::{CrdtError, LamportClock, ReplicaId, Replicated, Sequence, SequenceUpdate};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DoclogAction {
    Update,
    Delete,
}

impl DoclogAction {
    pub fn code(self) -> u8 {
        match self {
            DoclogAction::Update => 1,
            DoclogAction::Delete => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(DoclogAction::Update),
            2 => Some(DoclogAction::Delete),
            _ => None,
        }
    }
}

/// A single doclog entry. The action is kept as its raw code so entries
/// written by newer replicas still replicate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoclogEntry {
    pub id: String,
    pub action: u8,
}

impl DoclogEntry {
    pub fn new(id: impl Into<String>, action: DoclogAction) -> Self {
        Self {
            id: id.into(),
            action: action.code(),
        }
    }

    pub fn action(&self, kind: EntityKind) -> Result<DoclogAction> {
        DoclogAction::from_code(self.action).ok_or_else(|| ReplicaError::UnknownDoclogAction {
            kind,
            id: self.id.clone(),
            action: self.action,
        })
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DoclogUpdate {
    #[serde(default)]
    pub thoughts: SequenceUpdate<DoclogEntry>,
    #[serde(default)]
    pub lexemes: SequenceUpdate<DoclogEntry>,
}

impl DoclogUpdate {
    pub fn is_empty(&self) -> bool {
        self.thoughts.is_empty() && self.lexemes.is_empty()
    }

    fn max_counter(&self) -> u64 {
        self.thoughts.max_counter().max(self.lexemes.max_counter())
    }
}

pub struct Doclog {
    guid: String,
    clock: LamportClock,
    thoughts: Sequence<DoclogEntry>,
    lexemes: Sequence<DoclogEntry>,
}

impl Doclog {
    pub fn new(guid: impl Into<String>, replica: ReplicaId) -> Self {
        Self {
            guid: guid.into(),
            clock: LamportClock::new(replica),
            thoughts: Sequence::new(),
            lexemes: Sequence::new(),
        }
    }

    pub fn column(&self, kind: EntityKind) -> &Sequence<DoclogEntry> {
        match kind {
            EntityKind::Thought => &self.thoughts,
            EntityKind::Lexeme => &self.lexemes,
        }
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.column(kind).len()
    }

    /// Entries at and after `cursor`.
    pub fn entries_from(&self, kind: EntityKind, cursor: usize) -> Vec<DoclogEntry> {
        self.column(kind).iter().skip(cursor).cloned().collect()
    }

    /// Append entries to both columns.
    ///
    /// If a column's last entry equals the first new entry, the old one is
    /// removed before appending, so repeated edits of the same entity do
    /// not pile up. A replica whose cursor already passed the removed
    /// entry may skip one entry as a result.
    pub fn log(&mut self, thoughts: &[DoclogEntry], lexemes: &[DoclogEntry]) -> DoclogUpdate {
        DoclogUpdate {
            thoughts: append(&mut self.thoughts, &mut self.clock, thoughts),
            lexemes: append(&mut self.lexemes, &mut self.clock, lexemes),
        }
    }

    pub fn apply(&mut self, update: &DoclogUpdate) -> bool {
        self.clock.observe(update.max_counter());
        let thoughts = self.thoughts.apply(&update.thoughts);
        let lexemes = self.lexemes.apply(&update.lexemes);
        thoughts || lexemes
    }

    pub fn state(&self) -> DoclogUpdate {
        DoclogUpdate {
            thoughts: self.thoughts.state(),
            lexemes: self.lexemes.state(),
        }
    }
}

fn append(
    column: &mut Sequence<DoclogEntry>,
    clock: &mut LamportClock,
    entries: &[DoclogEntry],
) -> SequenceUpdate<DoclogEntry> {
    let mut update = SequenceUpdate::new();
    if let (Some(first), Some(last)) = (entries.first(), column.last()) {
        if first == last {
            let index = column.len() - 1;
            if let Some(deleted) = column.delete(index) {
                update.deletes.extend(deleted.deletes);
            }
        }
    }
    for entry in entries {
        let inserted = column.push(clock, entry.clone());
        update.inserts.extend(inserted.inserts);
    }
    update
}

impl Replicated for Doclog {
    fn guid(&self) -> &str {
        &self.guid
    }

    fn is_empty(&self) -> bool {
        self.thoughts.state().inserts.is_empty() && self.lexemes.state().inserts.is_empty()
    }

    fn encode_state(&self) -> thoughtspace_crdt::Result<Vec<u8>> {
        serde_json::to_vec(&self.state()).map_err(|e| CrdtError::Encode(e.to_string()))
    }

    fn apply_encoded(&mut self, update: &[u8]) -> thoughtspace_crdt::Result<bool> {
        let update: DoclogUpdate = serde_json::from_slice(update)?;
        Ok(self.apply(&update))
    }
}

/// Encode a doclog delta for broadcasting and storage.
pub fn encode_update(update: &DoclogUpdate) -> Result<Vec<u8>> {
    serde_json::to_vec(update).map_err(|e| ReplicaError::Document(CrdtError::Encode(e.to_string())))
}

//! Batches of entity changes.
//!
//! The same shape is used for writes into the engine and for change
//! notifications flowing out of it. `None` marks a deletion. Entries keep
//! the order in which they were first added, which is the order their
//! doclog entries are appended in.

use crate::entity::{initial_thoughts, Lexeme, Thought, ThoughtId};
use indexmap::IndexMap;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateBatch {
    pub thoughts: IndexMap<ThoughtId, Option<Thought>>,
    pub lexemes: IndexMap<String, Option<Lexeme>>,
    /// Last known value of each written Lexeme, used to diff contexts.
    /// Missing means the previous value is unknown.
    pub lexemes_old: IndexMap<String, Option<Lexeme>>,
}

impl UpdateBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// The well-known Thoughts of a fresh thoughtspace.
    pub fn initial() -> Self {
        initial_thoughts()
            .into_iter()
            .fold(Self::new(), |batch, thought| batch.put_thought(thought))
    }

    pub fn put_thought(mut self, thought: Thought) -> Self {
        self.thoughts.insert(thought.id.clone(), Some(thought));
        self
    }

    pub fn delete_thought(mut self, id: impl Into<ThoughtId>) -> Self {
        self.thoughts.insert(id.into(), None);
        self
    }

    pub fn put_lexeme(mut self, lexeme: Lexeme) -> Self {
        self.lexemes.insert(lexeme.key.clone(), Some(lexeme));
        self
    }

    /// Write `lexeme`, diffing its contexts against `old`.
    pub fn replace_lexeme(mut self, lexeme: Lexeme, old: Option<Lexeme>) -> Self {
        self.lexemes_old.insert(lexeme.key.clone(), old);
        self.put_lexeme(lexeme)
    }

    pub fn delete_lexeme(mut self, key: impl Into<String>) -> Self {
        self.lexemes.insert(key.into(), None);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.thoughts.is_empty() && self.lexemes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.thoughts.len() + self.lexemes.len()
    }

    /// Merge a later batch into this one. Later entries replace earlier
    /// entries for the same id, deletions included. The earliest known old
    /// value of a Lexeme is kept.
    pub fn merge(&mut self, later: UpdateBatch) {
        self.thoughts.extend(later.thoughts);
        self.lexemes.extend(later.lexemes);
        for (key, old) in later.lexemes_old {
            self.lexemes_old.entry(key).or_insert(old);
        }
    }
}

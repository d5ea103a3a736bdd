//! The engine's view of the application store.
//!
//! Background replication only keeps entities the store is showing, and
//! repair only looks at the Lexeme of the active context view.

use crate::batch::UpdateBatch;
use crate::entity::{Lexeme, Thought, ThoughtId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub trait StoreView: Send + Sync + 'static {
    fn thought(&self, id: &ThoughtId) -> Option<Thought>;

    fn lexeme(&self, key: &str) -> Option<Lexeme>;

    /// The Lexeme shown by the active context view, if any.
    fn context_view_lexeme(&self) -> Option<Lexeme>;

    /// A Thought is relevant if it or its parent is in the store.
    fn is_thought_loaded(&self, thought: &Thought) -> bool {
        self.thought(&thought.id).is_some() || self.thought(&thought.parent_id).is_some()
    }

    /// A Lexeme is relevant if it or any of its contexts is in the store.
    fn is_lexeme_loaded(&self, key: &str, lexeme: &Lexeme) -> bool {
        self.lexeme(key).is_some() || lexeme.contexts.iter().any(|cx| self.thought(cx).is_some())
    }
}

/// In-memory store that absorbs merged update batches.
#[derive(Default)]
pub struct MemoryView {
    thoughts: RwLock<HashMap<ThoughtId, Thought>>,
    lexemes: RwLock<HashMap<String, Lexeme>>,
    context_view: RwLock<Option<String>>,
}

impl MemoryView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, batch: &UpdateBatch) {
        {
            let mut thoughts = self.thoughts.write();
            for (id, thought) in &batch.thoughts {
                match thought {
                    Some(thought) => thoughts.insert(id.clone(), thought.clone()),
                    None => thoughts.remove(id),
                };
            }
        }
        let mut lexemes = self.lexemes.write();
        for (key, lexeme) in &batch.lexemes {
            match lexeme {
                Some(lexeme) => lexemes.insert(key.clone(), lexeme.clone()),
                None => lexemes.remove(key),
            };
        }
    }

    /// Apply every batch from `updates` until the channel closes.
    pub fn follow(
        self: &Arc<Self>,
        mut updates: mpsc::UnboundedReceiver<UpdateBatch>,
    ) -> JoinHandle<()> {
        let view = self.clone();
        tokio::spawn(async move {
            while let Some(batch) = updates.recv().await {
                view.apply(&batch);
            }
        })
    }

    /// Show the context view of the Lexeme with `key`.
    pub fn set_context_view(&self, key: Option<String>) {
        *self.context_view.write() = key;
    }

    pub fn thought_count(&self) -> usize {
        self.thoughts.read().len()
    }

    pub fn thought_ids(&self) -> Vec<ThoughtId> {
        let mut ids: Vec<_> = self.thoughts.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl StoreView for MemoryView {
    fn thought(&self, id: &ThoughtId) -> Option<Thought> {
        self.thoughts.read().get(id).cloned()
    }

    fn lexeme(&self, key: &str) -> Option<Lexeme> {
        self.lexemes.read().get(key).cloned()
    }

    fn context_view_lexeme(&self) -> Option<Lexeme> {
        let key = self.context_view.read().clone()?;
        self.lexeme(&key)
    }
}

//! Mapping between entities and their replicated documents.
//!
//! A Thought is stored as top-level fields plus a nested `childrenMap` so
//! that concurrent child additions from different replicas merge key by
//! key. A Lexeme stores its `contexts` as a nested map of id -> true for
//! the same reason.

use crate::batch::UpdateBatch;
use crate::entity::{EntityKind, Lexeme, Thought, ThoughtId, ROOT};
use crate::name::DocumentName;
use crate::view::StoreView;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::hash::Hash;
use thoughtspace_crdt::{Doc, Transaction};
use tracing::warn;

const CHILDREN_MAP: &str = "childrenMap";
const CONTEXTS: &str = "contexts";
const KEY: &str = "key";

/// An entity type that lives in one replicated document per id.
pub trait EntityDocument: Clone + Send + Sync + 'static {
    type Id: Clone + Eq + Hash + fmt::Display + fmt::Debug + Send + Sync + 'static;

    const KIND: EntityKind;

    fn document_name(tsid: &str, id: &Self::Id) -> DocumentName;

    /// Decode the live document. An empty document is an absent entity.
    fn read(id: &Self::Id, doc: &Doc) -> Option<Self>;

    /// Write this value into a transaction. `previous` is the last value
    /// the writer knew about, if any.
    fn write(&self, txn: &mut Transaction<'_>, previous: Option<&Self>);

    /// Whether the entity is relevant to what the store currently shows.
    fn is_loaded(&self, id: &Self::Id, view: &dyn StoreView) -> bool;

    /// Change notification for the downstream store.
    fn notification(id: &Self::Id, value: Option<Self>) -> UpdateBatch;

    /// Thought to check for structural consistency once remote data has
    /// arrived.
    fn repair_target(_id: &Self::Id) -> Option<ThoughtId> {
        None
    }

    /// The outline root with children already present.
    fn is_populated_root(&self) -> bool {
        false
    }
}

impl EntityDocument for Thought {
    type Id = ThoughtId;

    const KIND: EntityKind = EntityKind::Thought;

    fn document_name(tsid: &str, id: &ThoughtId) -> DocumentName {
        DocumentName::thought(tsid, id)
    }

    fn read(_id: &ThoughtId, doc: &Doc) -> Option<Self> {
        if doc.is_empty() {
            return None;
        }
        let mut object = doc.to_json();
        object
            .entry(CHILDREN_MAP)
            .or_insert_with(|| Value::Object(Map::new()));
        decode(doc, object)
    }

    fn write(&self, txn: &mut Transaction<'_>, _previous: Option<&Self>) {
        for (key, value) in encode(self) {
            if key != CHILDREN_MAP {
                txn.set(&key, value);
            }
        }

        for key in txn.map_keys(CHILDREN_MAP) {
            if !self.children_map.contains_key(&key) {
                txn.map_remove(CHILDREN_MAP, &key);
            }
        }
        for (key, child) in &self.children_map {
            txn.map_set(CHILDREN_MAP, key, Value::String(child.to_string()));
        }
    }

    fn is_loaded(&self, _id: &ThoughtId, view: &dyn StoreView) -> bool {
        view.is_thought_loaded(self)
    }

    fn notification(id: &ThoughtId, value: Option<Self>) -> UpdateBatch {
        let mut batch = UpdateBatch::new();
        batch.thoughts.insert(id.clone(), value);
        batch
    }

    fn repair_target(id: &ThoughtId) -> Option<ThoughtId> {
        Some(id.clone())
    }

    fn is_populated_root(&self) -> bool {
        self.id.as_str() == ROOT && !self.children_map.is_empty()
    }
}

impl EntityDocument for Lexeme {
    type Id = String;

    const KIND: EntityKind = EntityKind::Lexeme;

    fn document_name(tsid: &str, key: &String) -> DocumentName {
        DocumentName::lexeme(tsid, key.as_str())
    }

    fn read(key: &String, doc: &Doc) -> Option<Self> {
        if doc.is_empty() {
            return None;
        }
        let mut object = doc.to_json();
        let contexts = match object.remove(CONTEXTS) {
            Some(Value::Object(contexts)) => contexts
                .into_iter()
                .map(|(id, _)| Value::String(id))
                .collect(),
            _ => Vec::new(),
        };
        object.insert(CONTEXTS.to_string(), Value::Array(contexts));
        object.insert(KEY.to_string(), Value::String(key.clone()));
        decode(doc, object)
    }

    /// Contexts are diffed against `previous`: ids missing from the new
    /// value are removed only if the writer knew about them.
    fn write(&self, txn: &mut Transaction<'_>, previous: Option<&Self>) {
        for (key, value) in encode(self) {
            if key != CONTEXTS && key != KEY {
                txn.set(&key, value);
            }
        }

        if let Some(previous) = previous {
            for id in &previous.contexts {
                if !self.contexts.contains(id) {
                    txn.map_remove(CONTEXTS, id.as_str());
                }
            }
        }
        for id in &self.contexts {
            txn.map_set(CONTEXTS, id.as_str(), Value::Bool(true));
        }
    }

    fn is_loaded(&self, key: &String, view: &dyn StoreView) -> bool {
        view.is_lexeme_loaded(key, self)
    }

    fn notification(key: &String, value: Option<Self>) -> UpdateBatch {
        let mut batch = UpdateBatch::new();
        batch.lexemes.insert(key.clone(), value);
        batch
    }
}

fn encode<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(object)) => object,
        _ => Map::new(),
    }
}

fn decode<T: serde::de::DeserializeOwned>(doc: &Doc, object: Map<String, Value>) -> Option<T> {
    match serde_json::from_value(Value::Object(object)) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(document = %doc.guid(), error = %e, "Malformed entity document");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thoughtspace_crdt::ReplicaId;

    fn thought_doc(replica: &str) -> Doc {
        Doc::new("ts/thought/p", ReplicaId::new(replica))
    }

    #[test]
    fn test_thought_roundtrip() {
        let child = Thought::new("c1", "child", 0.0, "p");
        let thought = Thought::new("p", "Parent", 1.5, ROOT).with_child(&child);

        let mut doc = thought_doc("r1");
        doc.transact(|txn| thought.write(txn, None));

        let id = ThoughtId::new("p");
        assert_eq!(Thought::read(&id, &doc), Some(thought));
    }

    #[test]
    fn test_empty_document_is_absent() {
        let doc = thought_doc("r1");
        assert_eq!(Thought::read(&ThoughtId::new("p"), &doc), None);

        let lexeme_doc = Doc::new("ts/lexeme/x", ReplicaId::new("r1"));
        assert_eq!(Lexeme::read(&"x".to_string(), &lexeme_doc), None);
    }

    #[test]
    fn test_concurrent_children_merge() {
        let base = Thought::new("p", "Parent", 0.0, ROOT);
        let mut a = thought_doc("a");
        let (_, initial) = a.transact(|txn| base.write(txn, None));
        let mut b = thought_doc("b");
        b.apply(&initial);

        let with_x = base.clone().with_child(&Thought::new("x", "x", 0.0, "p"));
        let with_y = base.clone().with_child(&Thought::new("y", "y", 0.0, "p"));
        let (_, dx) = a.transact(|txn| with_x.write(txn, None));
        let (_, dy) = b.transact(|txn| with_y.write(txn, None));
        a.apply(&dy);
        b.apply(&dx);

        let id = ThoughtId::new("p");
        let merged = Thought::read(&id, &a).unwrap();
        assert_eq!(Some(merged.clone()), Thought::read(&id, &b));
        assert!(merged.children_map.contains_key("x"));
        assert!(merged.children_map.contains_key("y"));
    }

    #[test]
    fn test_removed_child_is_dropped() {
        let child = Thought::new("c1", "child", 0.0, "p");
        let with_child = Thought::new("p", "Parent", 0.0, ROOT).with_child(&child);
        let mut doc = thought_doc("r1");
        doc.transact(|txn| with_child.write(txn, None));

        let mut without = with_child.clone();
        without.children_map.clear();
        doc.transact(|txn| without.write(txn, Some(&with_child)));

        let read = Thought::read(&ThoughtId::new("p"), &doc).unwrap();
        assert!(read.children_map.is_empty());
    }

    #[test]
    fn test_lexeme_contexts_union() {
        let key = "work".to_string();
        let base = Lexeme::new("Work", vec![]);
        let mut a = Doc::new("ts/lexeme/work", ReplicaId::new("a"));
        let mut b = Doc::new("ts/lexeme/work", ReplicaId::new("b"));
        let (_, initial) = a.transact(|txn| base.write(txn, None));
        b.apply(&initial);

        let with_t1 = base.clone().with_context("t1".into());
        let with_t2 = base.clone().with_context("t2".into());
        let (_, d1) = a.transact(|txn| with_t1.write(txn, Some(&base)));
        let (_, d2) = b.transact(|txn| with_t2.write(txn, Some(&base)));
        a.apply(&d2);
        b.apply(&d1);

        let merged = Lexeme::read(&key, &a).unwrap();
        assert_eq!(merged.key, "work");
        assert!(merged.has_context(&"t1".into()));
        assert!(merged.has_context(&"t2".into()));
        assert_eq!(Some(merged), Lexeme::read(&key, &b));
    }

    #[test]
    fn test_lexeme_without_previous_keeps_unknown_contexts() {
        let key = "work".to_string();
        let mut doc = Doc::new("ts/lexeme/work", ReplicaId::new("a"));
        let existing = Lexeme::new("Work", vec!["t1".into()]);
        doc.transact(|txn| existing.write(txn, None));

        let other = Lexeme::new("Work", vec!["t2".into()]);
        doc.transact(|txn| other.write(txn, None));
        assert_eq!(Lexeme::read(&key, &doc).unwrap().contexts.len(), 2);

        // with the previous value known, t1 is removed
        let only_t2 = Lexeme::read(&key, &doc).unwrap().without_context(&"t1".into());
        let previous = Lexeme::read(&key, &doc).unwrap();
        doc.transact(|txn| only_t2.write(txn, Some(&previous)));
        assert_eq!(
            Lexeme::read(&key, &doc).unwrap().contexts,
            vec![ThoughtId::new("t2")]
        );
    }

    #[test]
    fn test_populated_root() {
        let child = Thought::new("c", "c", 0.0, ROOT);
        assert!(!Thought::new(ROOT, ROOT, 0.0, "x").is_populated_root());
        assert!(Thought::new(ROOT, ROOT, 0.0, "x")
            .with_child(&child)
            .is_populated_root());
    }
}

//! Transactional document: a top-level LWW map of JSON values plus named
//! nested LWW maps.
//!
//! A document is the unit of replication. Local changes are made inside a
//! [`Transaction`]; the transaction returns the delta it produced, which is
//! itself a [`DocState`] and can be shipped to other replicas and joined in.

use crate::error::{CrdtError, Result};
use crate::lattice::Lattice;
use crate::map::LwwMap;
use crate::stamp::{LamportClock, ReplicaId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Values stored in document fields.
pub type Value = serde_json::Value;

/// Full or partial document state. Updates exchanged between replicas use
/// the same representation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DocState {
    #[serde(default)]
    fields: LwwMap<Value>,
    #[serde(default)]
    maps: BTreeMap<String, LwwMap<Value>>,
}

impl DocState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &LwwMap<Value> {
        &self.fields
    }

    pub fn map(&self, name: &str) -> Option<&LwwMap<Value>> {
        self.maps.get(name)
    }

    /// True if nothing has ever been written (not even a tombstone).
    pub fn is_empty(&self) -> bool {
        self.fields.raw_len() == 0 && self.maps.values().all(|map| map.raw_len() == 0)
    }

    pub fn max_counter(&self) -> u64 {
        self.maps
            .values()
            .map(LwwMap::max_counter)
            .chain(std::iter::once(self.fields.max_counter()))
            .max()
            .unwrap_or(0)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CrdtError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl Lattice for DocState {
    fn bottom() -> Self {
        Self::default()
    }

    fn join_assign(&mut self, other: &Self) -> bool {
        let mut changed = self.fields.join_assign(&other.fields);
        for (name, map) in &other.maps {
            changed |= self.maps.entry(name.clone()).or_default().join_assign(map);
        }
        changed
    }
}

/// A replicated document identified by a globally unique name.
#[derive(Clone, Debug)]
pub struct Doc {
    guid: String,
    clock: LamportClock,
    state: DocState,
}

impl Doc {
    pub fn new(guid: impl Into<String>, replica: ReplicaId) -> Self {
        Self {
            guid: guid.into(),
            clock: LamportClock::new(replica),
            state: DocState::new(),
        }
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn replica(&self) -> &ReplicaId {
        self.clock.replica()
    }

    pub fn state(&self) -> &DocState {
        &self.state
    }

    /// Run `f` as one transaction and return its result together with the
    /// delta it produced. The delta is empty if nothing changed.
    pub fn transact<R>(&mut self, f: impl FnOnce(&mut Transaction<'_>) -> R) -> (R, DocState) {
        let mut txn = Transaction {
            clock: &mut self.clock,
            state: &mut self.state,
            delta: DocState::new(),
        };
        let result = f(&mut txn);
        (result, txn.delta)
    }

    /// Join a remote or persisted update. Returns true if anything changed.
    pub fn apply(&mut self, update: &DocState) -> bool {
        self.clock.observe(update.max_counter());
        self.state.join_assign(update)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.fields.get(key)
    }

    pub fn map(&self, name: &str) -> Option<&LwwMap<Value>> {
        self.state.map(name)
    }

    /// A document with no live top-level fields is treated as absent.
    pub fn is_empty(&self) -> bool {
        self.state.fields.is_empty()
    }

    /// Live contents as a JSON object. Nested maps appear as objects under
    /// their name.
    pub fn to_json(&self) -> serde_json::Map<String, Value> {
        let mut object: serde_json::Map<String, Value> = self
            .state
            .fields
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        for (name, map) in &self.state.maps {
            let nested = map
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            object.insert(name.clone(), Value::Object(nested));
        }
        object
    }
}

/// A single document transaction. Every write gets a fresh stamp from the
/// document's clock and is mirrored into the transaction's delta.
pub struct Transaction<'a> {
    clock: &'a mut LamportClock,
    state: &'a mut DocState,
    delta: DocState,
}

impl Transaction<'_> {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.fields.get(key)
    }

    /// Set a top-level field. Writing the value already present is a no-op.
    pub fn set(&mut self, key: &str, value: Value) {
        if self.state.fields.get(key) == Some(&value) {
            return;
        }
        let stamp = self.clock.tick();
        self.state.fields.insert(key, value, stamp);
        if let Some(register) = self.state.fields.register(key) {
            self.delta.fields.merge_register(key, register);
        }
    }

    pub fn remove(&mut self, key: &str) {
        let stamp = self.clock.tick();
        if self.state.fields.remove(key, stamp) {
            if let Some(register) = self.state.fields.register(key) {
                self.delta.fields.merge_register(key, register);
            }
        }
    }

    /// Live keys of a nested map.
    pub fn map_keys(&self, name: &str) -> Vec<String> {
        self.state
            .map(name)
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn map_contains(&self, name: &str, key: &str) -> bool {
        self.state
            .map(name)
            .is_some_and(|map| map.contains_key(key))
    }

    pub fn map_set(&mut self, name: &str, key: &str, value: Value) {
        let map = self.state.maps.entry(name.to_string()).or_default();
        if map.get(key) == Some(&value) {
            return;
        }
        let stamp = self.clock.tick();
        map.insert(key, value, stamp);
        if let Some(register) = map.register(key) {
            self.delta
                .maps
                .entry(name.to_string())
                .or_default()
                .merge_register(key, register);
        }
    }

    pub fn map_remove(&mut self, name: &str, key: &str) {
        let Some(map) = self.state.maps.get_mut(name) else {
            return;
        };
        let stamp = self.clock.tick();
        if map.remove(key, stamp) {
            if let Some(register) = map.register(key) {
                self.delta
                    .maps
                    .entry(name.to_string())
                    .or_default()
                    .merge_register(key, register);
            }
        }
    }
}

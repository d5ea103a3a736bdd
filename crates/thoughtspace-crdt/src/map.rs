//! Map CRDT - string keys mapped to last-write-wins registers.
//!
//! Each key merges independently, so two replicas that concurrently add
//! different keys both keep their addition after a join. Removed keys stay
//! behind as tombstones so a late, older set cannot resurrect them.

use crate::lattice::Lattice;
use crate::register::Register;
use crate::stamp::Stamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LwwMap<V> {
    entries: BTreeMap<String, Register<V>>,
}

impl<V: Clone + PartialEq> LwwMap<V> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Set `key` to `value` at `stamp`. Returns true if the map changed.
    pub fn insert(&mut self, key: impl Into<String>, value: V, stamp: Stamp) -> bool {
        self.write(key.into(), Some(value), stamp)
    }

    /// Remove `key` at `stamp`. Removing an absent key records nothing.
    pub fn remove(&mut self, key: &str, stamp: Stamp) -> bool {
        if !self.contains_key(key) {
            return false;
        }
        self.write(key.to_string(), None, stamp)
    }

    fn write(&mut self, key: String, value: Option<V>, stamp: Stamp) -> bool {
        match self.entries.get_mut(&key) {
            Some(register) => register.write(value, stamp),
            None => {
                let register = match value {
                    Some(value) => Register::with_value(value, stamp),
                    None => Register::tombstone(stamp),
                };
                self.entries.insert(key, register);
                true
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(key).and_then(Register::get)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Live keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.iter().map(|(key, _)| key)
    }

    /// Live entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &V)> {
        self.entries
            .iter()
            .filter_map(|(key, register)| register.get().map(|value| (key, value)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Raw register for a key, including tombstones.
    pub fn register(&self, key: &str) -> Option<&Register<V>> {
        self.entries.get(key)
    }

    /// Merge a single register in. Returns true if the key changed.
    pub fn merge_register(&mut self, key: &str, register: &Register<V>) -> bool {
        match self.entries.get_mut(key) {
            Some(existing) => existing.join_assign(register),
            None => {
                self.entries.insert(key.to_string(), register.clone());
                true
            }
        }
    }

    /// Highest Lamport counter of any write held by this map.
    pub fn max_counter(&self) -> u64 {
        self.entries
            .values()
            .map(|register| register.stamp().counter)
            .max()
            .unwrap_or(0)
    }

    /// Number of registers including tombstones.
    pub fn raw_len(&self) -> usize {
        self.entries.len()
    }
}

impl<V: Clone + PartialEq> Default for LwwMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + PartialEq> Lattice for LwwMap<V> {
    fn bottom() -> Self {
        Self::new()
    }

    fn join_assign(&mut self, other: &Self) -> bool {
        let mut changed = false;
        for (key, register) in &other.entries {
            changed |= self.merge_register(key, register);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stamp::ReplicaId;

    fn stamp(counter: u64, replica: &str) -> Stamp {
        Stamp::new(counter, ReplicaId::new(replica))
    }

    #[test]
    fn test_map_basic_operations() {
        let mut map: LwwMap<i64> = LwwMap::new();

        assert!(map.insert("a", 1, stamp(1, "r1")));
        assert!(map.insert("b", 2, stamp(2, "r1")));
        assert_eq!(map.get("a"), Some(&1));
        assert_eq!(map.len(), 2);

        assert!(map.remove("a", stamp(3, "r1")));
        assert!(!map.contains_key("a"));
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(map.raw_len(), 2);
    }

    #[test]
    fn test_remove_absent_key_is_noop() {
        let mut map: LwwMap<i64> = LwwMap::new();
        assert!(!map.remove("missing", stamp(1, "r1")));
        assert_eq!(map.raw_len(), 0);
    }

    #[test]
    fn test_concurrent_adds_of_different_keys_survive() {
        let mut map1: LwwMap<String> = LwwMap::new();
        map1.insert("a", "child-a".to_string(), stamp(1, "r1"));

        let mut map2: LwwMap<String> = LwwMap::new();
        map2.insert("b", "child-b".to_string(), stamp(1, "r2"));

        let merged = map1.join(&map2);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged, map2.join(&map1));
    }

    #[test]
    fn test_late_older_set_does_not_resurrect() {
        let mut map: LwwMap<i64> = LwwMap::new();
        map.insert("a", 1, stamp(1, "r1"));
        map.remove("a", stamp(3, "r1"));

        let mut stale: LwwMap<i64> = LwwMap::new();
        stale.insert("a", 9, stamp(2, "r2"));

        map.join_assign(&stale);
        assert!(!map.contains_key("a"));
        assert_eq!(map.max_counter(), 3);
    }
}

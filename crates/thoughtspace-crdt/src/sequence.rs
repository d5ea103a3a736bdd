//! Replicated Growable Array (RGA) for append-mostly ordered logs.
//!
//! Each element remembers the element it was inserted after (its origin).
//! Siblings that share an origin are ordered by descending stamp, so two
//! replicas that append concurrently converge to the same order without
//! coordinating. Deletions are tombstones and are sticky across merges.

use crate::lattice::Lattice;
use crate::stamp::{LamportClock, Stamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// A single element of the sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequenceNode<T> {
    pub id: Stamp,
    /// The element this one was inserted after. `None` is the head.
    pub origin: Option<Stamp>,
    pub value: T,
}

/// Full or partial sequence state exchanged between replicas.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct SequenceUpdate<T> {
    #[serde(default)]
    pub inserts: Vec<SequenceNode<T>>,
    #[serde(default)]
    pub deletes: BTreeSet<Stamp>,
}

impl<T> SequenceUpdate<T> {
    pub fn new() -> Self {
        Self {
            inserts: Vec::new(),
            deletes: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.deletes.is_empty()
    }

    pub fn max_counter(&self) -> u64 {
        self.inserts
            .iter()
            .map(|node| node.id.counter)
            .chain(self.deletes.iter().map(|id| id.counter))
            .max()
            .unwrap_or(0)
    }
}

impl<T> Default for SequenceUpdate<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + PartialEq> Lattice for SequenceUpdate<T> {
    fn bottom() -> Self {
        Self::new()
    }

    fn join_assign(&mut self, other: &Self) -> bool {
        let known: HashSet<Stamp> = self.inserts.iter().map(|node| node.id.clone()).collect();
        let mut changed = false;
        for node in &other.inserts {
            if !known.contains(&node.id) {
                self.inserts.push(node.clone());
                changed = true;
            }
        }
        for id in &other.deletes {
            changed |= self.deletes.insert(id.clone());
        }
        changed
    }
}

/// An ordered, replicated sequence.
#[derive(Clone, Debug)]
pub struct Sequence<T> {
    nodes: HashMap<Stamp, SequenceNode<T>>,
    /// Origin -> children, sorted by descending id. `None` is the head.
    children: HashMap<Option<Stamp>, Vec<Stamp>>,
    deleted: BTreeSet<Stamp>,
}

impl<T: Clone + PartialEq> Sequence<T> {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            children: HashMap::new(),
            deleted: BTreeSet::new(),
        }
    }

    /// Append after the last visible element.
    pub fn push(&mut self, clock: &mut LamportClock, value: T) -> SequenceUpdate<T> {
        let origin = self.visible_nodes().last().map(|node| node.id.clone());
        let node = SequenceNode {
            id: clock.tick(),
            origin,
            value,
        };
        self.integrate(node.clone());

        let mut update = SequenceUpdate::new();
        update.inserts.push(node);
        update
    }

    /// Delete the visible element at `index`.
    pub fn delete(&mut self, index: usize) -> Option<SequenceUpdate<T>> {
        let id = self.visible_nodes().nth(index)?.id.clone();
        self.deleted.insert(id.clone());

        let mut update = SequenceUpdate::new();
        update.deletes.insert(id);
        Some(update)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.visible_nodes().nth(index).map(|node| &node.value)
    }

    pub fn last(&self) -> Option<&T> {
        self.visible_nodes().last().map(|node| &node.value)
    }

    pub fn len(&self) -> usize {
        self.visible_nodes().count()
    }

    pub fn is_empty(&self) -> bool {
        self.visible_nodes().next().is_none()
    }

    /// Visible values in order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.visible_nodes().map(|node| &node.value)
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }

    /// Join an update. Inserts whose origin has not arrived yet are kept
    /// and become visible once the origin shows up.
    pub fn apply(&mut self, update: &SequenceUpdate<T>) -> bool {
        let mut changed = false;
        for node in &update.inserts {
            if !self.nodes.contains_key(&node.id) {
                self.integrate(node.clone());
                changed = true;
            }
        }
        for id in &update.deletes {
            changed |= self.deleted.insert(id.clone());
        }
        changed
    }

    /// Entire state as an update, including inserts still waiting for
    /// their origin.
    pub fn state(&self) -> SequenceUpdate<T> {
        SequenceUpdate {
            inserts: self.nodes.values().cloned().collect(),
            deletes: self.deleted.clone(),
        }
    }

    pub fn max_counter(&self) -> u64 {
        self.nodes
            .keys()
            .map(|id| id.counter)
            .chain(self.deleted.iter().map(|id| id.counter))
            .max()
            .unwrap_or(0)
    }

    fn integrate(&mut self, node: SequenceNode<T>) {
        let id = node.id.clone();
        let siblings = self.children.entry(node.origin.clone()).or_default();
        let pos = siblings
            .iter()
            .position(|sibling| sibling < &id)
            .unwrap_or(siblings.len());
        siblings.insert(pos, id.clone());
        self.nodes.insert(id, node);
    }

    fn visible_nodes(&self) -> impl Iterator<Item = &SequenceNode<T>> {
        self.iter_nodes()
            .filter(move |node| !self.deleted.contains(&node.id))
    }

    /// All reachable nodes in document order, tombstones included.
    fn iter_nodes(&self) -> SequenceIter<'_, T> {
        let mut stack = Vec::new();
        if let Some(heads) = self.children.get(&None) {
            stack.extend(heads.iter().rev().cloned());
        }
        SequenceIter { sequence: self, stack }
    }
}

impl<T: Clone + PartialEq> Default for Sequence<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Depth-first walk from the head.
struct SequenceIter<'a, T> {
    sequence: &'a Sequence<T>,
    stack: Vec<Stamp>,
}

impl<'a, T> Iterator for SequenceIter<'a, T> {
    type Item = &'a SequenceNode<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        if let Some(children) = self.sequence.children.get(&Some(id.clone())) {
            self.stack.extend(children.iter().rev().cloned());
        }
        self.sequence.nodes.get(&id)
    }
}

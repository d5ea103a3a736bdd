//! Replica identities and Lamport stamps.
//!
//! Every write in a document is tagged with a [`Stamp`]. Stamps are totally
//! ordered (counter first, replica id as tie-break), which is what lets
//! last-writer-wins registers and sequence siblings resolve concurrent
//! writes identically on every replica.

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Identity of one writer. Each transaction is tagged with it so that a
/// replica can recognise its own changes when they are echoed back.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh, globally unique replica id.
    pub fn random() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A Lamport timestamp tagged with the replica that produced it.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub counter: u64,
    pub replica: ReplicaId,
}

impl Stamp {
    pub fn new(counter: u64, replica: ReplicaId) -> Self {
        Self { counter, replica }
    }
}

/// Per-replica Lamport clock.
#[derive(Clone, Debug)]
pub struct LamportClock {
    counter: u64,
    replica: ReplicaId,
}

impl LamportClock {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            counter: 0,
            replica,
        }
    }

    pub fn replica(&self) -> &ReplicaId {
        &self.replica
    }

    /// Produce the next stamp for a local write.
    pub fn tick(&mut self) -> Stamp {
        self.counter += 1;
        Stamp::new(self.counter, self.replica.clone())
    }

    /// Advance past a counter seen in a remote update.
    pub fn observe(&mut self, counter: u64) {
        self.counter = self.counter.max(counter);
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_orders_by_counter_then_replica() {
        let a = Stamp::new(1, ReplicaId::new("b"));
        let b = Stamp::new(2, ReplicaId::new("a"));
        let c = Stamp::new(2, ReplicaId::new("b"));

        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_clock_observe_moves_past_remote_counter() {
        let mut clock = LamportClock::new(ReplicaId::new("r1"));
        clock.tick();
        clock.observe(10);

        let next = clock.tick();
        assert_eq!(next.counter, 11);
        assert_eq!(next.replica.as_str(), "r1");
    }

    #[test]
    fn test_random_replica_ids_differ() {
        assert_ne!(ReplicaId::random(), ReplicaId::random());
    }
}

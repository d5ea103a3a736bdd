//! Last-Write-Wins (LWW) Register
//!
//! The register keeps the write with the highest [`Stamp`]. A removal is a
//! write of `None` (a tombstone), so a later set can revive the slot and an
//! older set arriving late cannot.

use crate::lattice::Lattice;
use crate::stamp::Stamp;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Register<V> {
    /// The current value, `None` once removed.
    value: Option<V>,
    /// The stamp of the winning write.
    stamp: Stamp,
}

impl<V: Clone + PartialEq> Register<V> {
    /// A register holding `value`, written at `stamp`.
    pub fn with_value(value: V, stamp: Stamp) -> Self {
        Self {
            value: Some(value),
            stamp,
        }
    }

    /// A removed register, written at `stamp`.
    pub fn tombstone(stamp: Stamp) -> Self {
        Self { value: None, stamp }
    }

    /// Apply a write. Older or equal stamps are ignored.
    pub fn write(&mut self, value: Option<V>, stamp: Stamp) -> bool {
        if stamp > self.stamp {
            self.value = value;
            self.stamp = stamp;
            true
        } else {
            false
        }
    }

    pub fn get(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn stamp(&self) -> &Stamp {
        &self.stamp
    }

    pub fn is_live(&self) -> bool {
        self.value.is_some()
    }
}

impl<V: Clone + PartialEq> Lattice for Register<V> {
    fn bottom() -> Self {
        Self {
            value: None,
            stamp: Stamp::default(),
        }
    }

    /// Stamps are unique per write, so equal stamps mean the same write.
    fn join_assign(&mut self, other: &Self) -> bool {
        if other.stamp > self.stamp {
            *self = other.clone();
            true
        } else {
            false
        }
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
    fn test_register_higher_stamp_wins() {
        let mut reg = Register::with_value(10, stamp(1, "r1"));

        assert!(reg.write(Some(20), stamp(2, "r2")));
        assert_eq!(reg.get(), Some(&20));

        // late arrival of an older write is ignored
        assert!(!reg.write(Some(30), stamp(1, "r3")));
        assert_eq!(reg.get(), Some(&20));
    }

    #[test]
    fn test_register_tie_breaks_on_replica() {
        let a = Register::with_value("a", stamp(5, "r1"));
        let b = Register::with_value("b", stamp(5, "r2"));

        assert_eq!(a.join(&b).get(), Some(&"b"));
        assert_eq!(b.join(&a).get(), Some(&"b"));
    }

    #[test]
    fn test_tombstone_beats_older_value() {
        let value = Register::with_value(1, stamp(1, "r1"));
        let removed = Register::tombstone(stamp(2, "r2"));

        let joined = value.join(&removed);
        assert!(!joined.is_live());
        assert_eq!(joined.stamp(), &stamp(2, "r2"));
    }

    #[test]
    fn test_bottom_is_identity() {
        let reg = Register::with_value(42, stamp(3, "r1"));
        assert_eq!(reg.join(&Register::bottom()), reg);
    }
}

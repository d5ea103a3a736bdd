//! Join-semilattice trait shared by every mergeable structure in this crate.
//!
//! A join-semilattice (S, ⊔) satisfies:
//! - Commutativity: a ⊔ b = b ⊔ a
//! - Associativity: (a ⊔ b) ⊔ c = a ⊔ (b ⊔ c)
//! - Idempotence:  a ⊔ a = a
//!
//! Replicas exchange partial states (updates) and join them in any order,
//! any number of times, and still end up with the same document.

/// The core merge trait. Updates and full states are the same type, so an
/// update is just a small state that gets joined into a bigger one.
pub trait Lattice: Clone {
    /// The bottom element (identity for join).
    fn bottom() -> Self;

    /// Join `other` into `self` in place. Returns true if `self` changed.
    fn join_assign(&mut self, other: &Self) -> bool;

    /// Join operation (least upper bound).
    fn join(&self, other: &Self) -> Self {
        let mut joined = self.clone();
        joined.join_assign(other);
        joined
    }
}

//! State vector: compact summary of which operations a replica has seen.
//!
//! For every replica the vector records the highest operation counter seen
//! *contiguously* from 1. Operations arriving beyond a gap are tracked by the
//! document store itself and only folded in once the gap closes, so
//! `covers(id)` never claims an operation that was not actually received.

use crate::ids::{OpId, ReplicaId};
use crate::lattice::Lattice;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-replica frontier of seen operation counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateVector {
    entries: BTreeMap<ReplicaId, u64>,
}

impl StateVector {
    /// Create an empty state vector.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Create a state vector from `(replica, counter)` pairs.
    pub fn from_entries<R: Into<ReplicaId>>(entries: impl IntoIterator<Item = (R, u64)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .filter(|(_, seq)| *seq > 0)
                .map(|(r, seq)| (r.into(), seq))
                .collect(),
        }
    }

    /// Highest contiguous counter seen from a replica (0 when unknown).
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.entries.get(replica).copied().unwrap_or(0)
    }

    /// Set the counter for a replica. A zero counter removes the entry.
    pub fn set(&mut self, replica: ReplicaId, seq: u64) {
        if seq > 0 {
            self.entries.insert(replica, seq);
        } else {
            self.entries.remove(&replica);
        }
    }

    /// Increment the counter for a replica, returning the new value.
    pub fn increment(&mut self, replica: &ReplicaId) -> u64 {
        let entry = self.entries.entry(replica.clone()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Whether the operation is already accounted for by this vector.
    pub fn covers(&self, id: &OpId) -> bool {
        id.seq <= self.get(&id.replica)
    }

    /// True if `self[r] >= other[r]` for every replica.
    pub fn dominates(&self, other: &StateVector) -> bool {
        other
            .entries
            .iter()
            .all(|(replica, &seq)| self.get(replica) >= seq)
    }

    /// Neither vector dominates the other.
    pub fn is_concurrent_with(&self, other: &StateVector) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }

    /// Component-wise maximum.
    pub fn merge(&mut self, other: &StateVector) {
        for (replica, &seq) in &other.entries {
            let current = self.entries.entry(replica.clone()).or_insert(0);
            *current = (*current).max(seq);
        }
    }

    pub fn merged_with(&self, other: &StateVector) -> StateVector {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// Counter ranges present in `self` but missing from `other`,
    /// as `(replica, first_missing, last_missing)`.
    pub fn missing_from(&self, other: &StateVector) -> Vec<(ReplicaId, u64, u64)> {
        self.entries
            .iter()
            .filter_map(|(replica, &seq)| {
                let theirs = other.get(replica);
                (seq > theirs).then(|| (replica.clone(), theirs + 1, seq))
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all counters (total operations summarized).
    pub fn total_operations(&self) -> u64 {
        self.entries.values().sum()
    }
}

impl Lattice for StateVector {
    fn bottom() -> Self {
        Self::new()
    }

    fn join(&self, other: &Self) -> Self {
        self.merged_with(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(s: &str) -> ReplicaId {
        ReplicaId::new(s)
    }

    #[test]
    fn test_state_vector_basic() {
        let mut sv = StateVector::new();
        assert_eq!(sv.get(&r("r1")), 0);

        sv.set(r("r1"), 5);
        assert_eq!(sv.get(&r("r1")), 5);
        assert_eq!(sv.increment(&r("r1")), 6);

        sv.set(r("r1"), 0);
        assert!(sv.is_empty());
    }

    #[test]
    fn test_covers() {
        let sv = StateVector::from_entries([("r1", 5)]);
        assert!(sv.covers(&OpId::new("r1", 1)));
        assert!(sv.covers(&OpId::new("r1", 5)));
        assert!(!sv.covers(&OpId::new("r1", 6)));
        assert!(!sv.covers(&OpId::new("r2", 1)));
    }

    #[test]
    fn test_dominates_and_concurrency() {
        let a = StateVector::from_entries([("r1", 5), ("r2", 3)]);
        let b = StateVector::from_entries([("r1", 3), ("r2", 3)]);
        let c = StateVector::from_entries([("r1", 3), ("r2", 5)]);

        assert!(a.dominates(&b));
        assert!(!b.dominates(&a));
        assert!(a.is_concurrent_with(&c));
        assert!(StateVector::new().dominates(&StateVector::new()));
    }

    #[test]
    fn test_missing_from() {
        let server = StateVector::from_entries([("r1", 10), ("r2", 5), ("r3", 2)]);
        let client = StateVector::from_entries([("r1", 7), ("r2", 5)]);

        let missing = server.missing_from(&client);
        assert_eq!(
            missing,
            vec![(r("r1"), 8, 10), (r("r3"), 1, 2)]
        );
        assert!(client.missing_from(&server).is_empty());
    }

    #[test]
    fn test_merge_is_componentwise_max() {
        let a = StateVector::from_entries([("r1", 5), ("r2", 3)]);
        let b = StateVector::from_entries([("r1", 3), ("r2", 7)]);
        let merged = a.join(&b);
        assert_eq!(merged.get(&r("r1")), 5);
        assert_eq!(merged.get(&r("r2")), 7);
        assert_eq!(merged.total_operations(), 12);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let sv = StateVector::from_entries([("r1", 5), ("r2", 10)]);
        let json = serde_json::to_string(&sv).unwrap();
        let back: StateVector = serde_json::from_str(&json).unwrap();
        assert_eq!(sv, back);
    }
}

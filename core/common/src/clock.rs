//! Vector clocks and record versions.
//!
//! A vector clock maps writer identities to monotonically increasing counters.
//! Comparing two clocks tells whether one version causally descends from the
//! other or whether the two were written concurrently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Causality relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    /// First clock happened before second.
    Before,
    /// First clock happened after second.
    After,
    /// Neither clock happened before the other.
    Concurrent,
    /// Clocks are identical.
    Equal,
}

/// A vector clock keyed by writer identity.
///
/// Missing writers count as zero, so `{a: 1}` equals `{a: 1, b: 0}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    clocks: BTreeMap<String, u64>,
}

impl VectorClock {
    /// Creates a new empty vector clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a clock from `(writer, counter)` pairs.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        Self {
            clocks: entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Returns the counter for a writer (0 if not present).
    #[must_use]
    pub fn get(&self, writer: &str) -> u64 {
        self.clocks.get(writer).copied().unwrap_or(0)
    }

    /// Returns true if every counter is zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clocks.values().all(|&v| v == 0)
    }

    /// Iterates over writers and counters.
    pub fn entries(&self) -> impl Iterator<Item = (&str, u64)> {
        self.clocks.iter().map(|(k, &v)| (k.as_str(), v))
    }

    /// Increments the counter of a writer and returns the new value.
    pub fn increment(&mut self, writer: &str) -> u64 {
        let entry = self.clocks.entry(writer.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Takes the component-wise maximum with another clock.
    pub fn merge(&mut self, other: &Self) {
        for (writer, &time) in &other.clocks {
            let entry = self.clocks.entry(writer.clone()).or_insert(0);
            if time > *entry {
                *entry = time;
            }
        }
    }

    /// Creates a new clock that is the merge of this and another.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// Compares this clock with another to determine causal ordering.
    #[must_use]
    pub fn compare(&self, other: &Self) -> CausalOrder {
        let writers: BTreeSet<&String> = self.clocks.keys().chain(other.clocks.keys()).collect();

        let mut self_ge = true;
        let mut other_ge = true;
        for writer in writers {
            let a = self.get(writer);
            let b = other.get(writer);
            if a < b {
                self_ge = false;
            }
            if b < a {
                other_ge = false;
            }
        }

        match (self_ge, other_ge) {
            (true, true) => CausalOrder::Equal,
            (true, false) => CausalOrder::After,
            (false, true) => CausalOrder::Before,
            (false, false) => CausalOrder::Concurrent,
        }
    }

    /// Strict dominance: every component >= and at least one strictly greater.
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::After
    }

    /// Returns true if neither clock dominates the other and they differ.
    #[must_use]
    pub fn is_concurrent(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::Concurrent
    }
}

impl PartialEq for VectorClock {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::Equal
    }
}

impl Eq for VectorClock {}

/// A versioned snapshot of one record as held by some side of a write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordVersion {
    /// Monotonic per-record version number assigned by the backend.
    pub version: u64,
    /// Causal history of the record.
    #[serde(default)]
    pub clock: VectorClock,
    /// Wall-clock time of the write that produced this version.
    pub timestamp: DateTime<Utc>,
    /// Record payload (Null for a deleted record).
    pub data: Value,
}

impl RecordVersion {
    /// Create a version snapshot.
    pub fn new(version: u64, clock: VectorClock, timestamp: DateTime<Utc>, data: Value) -> Self {
        Self {
            version,
            clock,
            timestamp,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn clock(a: u64, b: u64) -> VectorClock {
        VectorClock::from_entries([("a", a), ("b", b)])
    }

    #[test]
    fn test_dominance() {
        assert!(clock(2, 1).dominates(&clock(2, 0)));
        assert!(!clock(2, 0).dominates(&clock(2, 1)));
        assert!(!clock(2, 0).dominates(&clock(2, 0)));
    }

    #[test]
    fn test_concurrent() {
        assert!(clock(2, 0).is_concurrent(&clock(1, 1)));
        assert_eq!(clock(1, 1).compare(&clock(2, 0)), CausalOrder::Concurrent);
    }

    #[test]
    fn test_missing_writers_count_as_zero() {
        let sparse = VectorClock::from_entries([("a", 1)]);
        assert_eq!(sparse, clock(1, 0));
        assert!(VectorClock::from_entries([("z", 0)]).is_empty());
    }

    #[test]
    fn test_increment_and_merge() {
        let mut c = VectorClock::new();
        assert_eq!(c.increment("a"), 1);
        assert_eq!(c.increment("a"), 2);
        let merged = c.merged(&clock(1, 4));
        assert_eq!(merged.get("a"), 2);
        assert_eq!(merged.get("b"), 4);
    }

    #[test]
    fn test_serializes_as_map() {
        let json = serde_json::to_string(&clock(2, 1)).unwrap();
        assert_eq!(json, r#"{"a":2,"b":1}"#);
    }

    proptest! {
        #[test]
        fn dominance_is_antisymmetric(a1 in 0u64..5, b1 in 0u64..5, a2 in 0u64..5, b2 in 0u64..5) {
            let x = clock(a1, b1);
            let y = clock(a2, b2);
            prop_assert!(!(x.dominates(&y) && y.dominates(&x)));
        }

        #[test]
        fn merge_dominates_or_equals_inputs(a1 in 0u64..5, b1 in 0u64..5, a2 in 0u64..5, b2 in 0u64..5) {
            let x = clock(a1, b1);
            let y = clock(a2, b2);
            let m = x.merged(&y);
            prop_assert!(m.dominates(&x) || m == x);
            prop_assert!(m.dominates(&y) || m == y);
        }

        #[test]
        fn compare_is_mirrored(a1 in 0u64..5, b1 in 0u64..5, a2 in 0u64..5, b2 in 0u64..5) {
            let x = clock(a1, b1);
            let y = clock(a2, b2);
            let mirrored = match x.compare(&y) {
                CausalOrder::Before => CausalOrder::After,
                CausalOrder::After => CausalOrder::Before,
                other => other,
            };
            prop_assert_eq!(y.compare(&x), mirrored);
        }
    }
}

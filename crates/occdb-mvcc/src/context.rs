//! Per-(transaction, index) bookkeeping: read set, write set, absent-range
//! set, and scanned-leaf version map.

use std::collections::{BTreeMap, HashMap};

use occdb_index::LeafId;

use crate::cell::{CellPtr, Tid};

/// Half-open key interval `[lo, hi)`; `hi = None` means `[lo, +∞)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub lo: Vec<u8>,
    pub hi: Option<Vec<u8>>,
}

impl KeyRange {
    #[must_use]
    pub fn new(lo: impl Into<Vec<u8>>, hi: Option<Vec<u8>>) -> Self {
        Self { lo: lo.into(), hi }
    }

    /// `lo ≥ hi` denotes nothing and is discarded on insert.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match &self.hi {
            Some(hi) => self.lo >= *hi,
            None => false,
        }
    }

    /// `lo ≤ other.lo ∧ (¬has_hi ∨ (other.has_hi ∧ hi ≥ other.hi))`.
    #[must_use]
    pub fn contains(&self, other: &KeyRange) -> bool {
        if self.lo > other.lo {
            return false;
        }
        match (&self.hi, &other.hi) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(hi), Some(other_hi)) => hi >= other_hi,
        }
    }

    /// Whether `key` falls inside the interval.
    #[must_use]
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.lo.as_slice() <= key
            && match &self.hi {
                Some(hi) => key < hi.as_slice(),
                None => true,
            }
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.hi {
            Some(hi) => write!(f, "[{:?}, {:?})", self.lo, hi),
            None => write!(f, "[{:?}, +inf)", self.lo),
        }
    }
}

/// Smallest key strictly greater than `key` in byte-lexicographic order.
#[must_use]
pub(crate) fn key_successor(key: &[u8]) -> Vec<u8> {
    let mut succ = Vec::with_capacity(key.len() + 1);
    succ.extend_from_slice(key);
    succ.push(0);
    succ
}

/// One materialized read.
#[derive(Debug, Clone)]
pub(crate) struct ReadRecord {
    /// Tid of the version observed.
    pub tid: Tid,
    /// Bytes observed; empty means the key was absent (or a tombstone).
    pub bytes: Vec<u8>,
    /// Chain head at read time. Non-owning: validated through the version
    /// counter at commit, kept alive by the transaction's epoch pin. `None`
    /// when the key had no slot at all.
    pub cell: Option<CellPtr>,
}

impl ReadRecord {
    /// Record for a key with no index slot.
    pub fn miss() -> Self {
        Self {
            tid: crate::cell::MIN_TID,
            bytes: Vec::new(),
            cell: None,
        }
    }

    /// Whether this read observed absence (miss or tombstone).
    pub fn observed_absent(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Per-index transaction context.
#[derive(Debug, Default)]
pub(crate) struct TxnContext {
    /// key → observed read. Hash map: no ordering requirement on validation.
    pub read_set: HashMap<Vec<u8>, ReadRecord>,
    /// key → buffered new value; empty bytes means delete. Ordered so the
    /// commit lock phase is deterministic.
    pub write_set: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Observed-empty ranges, sorted, non-overlapping, non-adjacent.
    pub absent_ranges: Vec<KeyRange>,
    /// Leaf identity → version observed during low-level scans.
    pub node_scan: HashMap<LeafId, u64>,
}

/// Outcome of a local (buffered) lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LocalHit<'a> {
    /// Key has a buffered value.
    Present(&'a [u8]),
    /// Key is known absent (buffered delete, observed miss, or tombstone).
    Absent,
    /// Nothing local; consult the index.
    Unknown,
}

impl TxnContext {
    /// Write set first, then read set; empty bytes means absent.
    pub fn local_search(&self, key: &[u8]) -> LocalHit<'_> {
        if let Some(value) = self.write_set.get(key) {
            return if value.is_empty() {
                LocalHit::Absent
            } else {
                LocalHit::Present(value)
            };
        }
        if let Some(record) = self.read_set.get(key) {
            return if record.observed_absent() {
                LocalHit::Absent
            } else {
                LocalHit::Present(&record.bytes)
            };
        }
        LocalHit::Unknown
    }

    /// Whether `key` is covered by an observed-empty range.
    pub fn key_in_absent_set(&self, key: &[u8]) -> bool {
        // upper_bound: first range whose hi is beyond the key.
        let idx = self
            .absent_ranges
            .partition_point(|r| matches!(&r.hi, Some(hi) if hi.as_slice() <= key));
        self.absent_ranges
            .get(idx)
            .is_some_and(|r| r.contains_key(key))
    }

    /// Insert a range into the sorted set, merging overlapping and adjacent
    /// neighbors. Empty ranges are discarded.
    pub fn add_absent_range(&mut self, range: KeyRange) {
        if range.is_empty() {
            return;
        }

        // First range that could merge with ours: lo beyond it would still
        // touch if its hi reaches our lo.
        let start = self
            .absent_ranges
            .partition_point(|r| matches!(&r.hi, Some(hi) if *hi < range.lo));

        let mut merged = range;
        let mut end = start;
        while end < self.absent_ranges.len() {
            let existing = &self.absent_ranges[end];
            let touches = match &merged.hi {
                Some(hi) => existing.lo <= *hi,
                None => true,
            };
            if !touches {
                break;
            }
            if existing.lo < merged.lo {
                merged.lo = existing.lo.clone();
            }
            merged.hi = match (merged.hi.take(), existing.hi.clone()) {
                (Some(a), Some(b)) => Some(a.max(b)),
                _ => None,
            };
            end += 1;
        }

        self.absent_ranges.splice(start..end, [merged]);
        debug_assert!(self.assert_valid_range_set());
    }

    /// Range-set invariants: sorted by lo, pairwise non-overlapping and
    /// non-adjacent.
    pub fn assert_valid_range_set(&self) -> bool {
        for pair in self.absent_ranges.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            assert!(!a.is_empty() && !b.is_empty());
            let Some(a_hi) = &a.hi else {
                panic!("unbounded range {a} is not last");
            };
            assert!(
                *a_hi < b.lo,
                "ranges {a} and {b} overlap or are adjacent"
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn range(lo: &[u8], hi: Option<&[u8]>) -> KeyRange {
        KeyRange::new(lo.to_vec(), hi.map(<[u8]>::to_vec))
    }

    #[test]
    fn local_search_prefers_writes_over_reads() {
        let mut ctx = TxnContext::default();
        ctx.read_set.insert(
            b"k".to_vec(),
            ReadRecord {
                tid: 3,
                bytes: b"read".to_vec(),
                cell: None,
            },
        );
        assert_eq!(ctx.local_search(b"k"), LocalHit::Present(b"read"));

        ctx.write_set.insert(b"k".to_vec(), b"written".to_vec());
        assert_eq!(ctx.local_search(b"k"), LocalHit::Present(b"written"));

        ctx.write_set.insert(b"k".to_vec(), Vec::new());
        assert_eq!(ctx.local_search(b"k"), LocalHit::Absent);

        assert_eq!(ctx.local_search(b"other"), LocalHit::Unknown);
    }

    #[test]
    fn empty_ranges_are_discarded() {
        let mut ctx = TxnContext::default();
        ctx.add_absent_range(range(b"m", Some(b"m")));
        ctx.add_absent_range(range(b"z", Some(b"a")));
        assert!(ctx.absent_ranges.is_empty());
    }

    #[test]
    fn disjoint_ranges_stay_sorted() {
        let mut ctx = TxnContext::default();
        ctx.add_absent_range(range(b"m", Some(b"p")));
        ctx.add_absent_range(range(b"a", Some(b"c")));
        ctx.add_absent_range(range(b"x", None));
        assert_eq!(
            ctx.absent_ranges,
            vec![
                range(b"a", Some(b"c")),
                range(b"m", Some(b"p")),
                range(b"x", None),
            ]
        );
    }

    #[test]
    fn overlapping_and_adjacent_ranges_merge() {
        let mut ctx = TxnContext::default();
        ctx.add_absent_range(range(b"b", Some(b"d")));
        ctx.add_absent_range(range(b"c", Some(b"f")));
        assert_eq!(ctx.absent_ranges, vec![range(b"b", Some(b"f"))]);

        // Adjacent: hi of one equals lo of the next.
        ctx.add_absent_range(range(b"f", Some(b"h")));
        assert_eq!(ctx.absent_ranges, vec![range(b"b", Some(b"h"))]);

        // Swallow several at once with an unbounded range.
        ctx.add_absent_range(range(b"p", Some(b"q")));
        ctx.add_absent_range(range(b"a", None));
        assert_eq!(ctx.absent_ranges, vec![range(b"a", None)]);
    }

    #[test]
    fn key_membership() {
        let mut ctx = TxnContext::default();
        ctx.add_absent_range(range(b"b", Some(b"d")));
        ctx.add_absent_range(range(b"x", None));
        assert!(ctx.key_in_absent_set(b"b"));
        assert!(ctx.key_in_absent_set(b"c"));
        assert!(!ctx.key_in_absent_set(b"d"), "hi is exclusive");
        assert!(!ctx.key_in_absent_set(b"a"));
        assert!(ctx.key_in_absent_set(b"zzz"));
    }

    #[test]
    fn containment_formula() {
        let outer = range(b"b", Some(b"p"));
        assert!(outer.contains(&range(b"c", Some(b"d"))));
        assert!(outer.contains(&range(b"b", Some(b"p"))));
        assert!(!outer.contains(&range(b"a", Some(b"d"))));
        assert!(!outer.contains(&range(b"c", None)));
        assert!(range(b"b", None).contains(&range(b"c", None)));
    }

    #[test]
    fn successor_is_tight() {
        assert_eq!(key_successor(b"ab"), b"ab\0".to_vec());
        assert!(key_successor(b"ab").as_slice() > b"ab".as_slice());
        assert!(key_successor(b"ab").as_slice() < b"ac".as_slice());
    }

    proptest! {
        /// Inserting arbitrary ranges keeps the set sorted, non-overlapping,
        /// non-adjacent, and covering every inserted key interval.
        #[test]
        fn prop_range_set_invariants(
            ranges in proptest::collection::vec(
                (
                    proptest::collection::vec(any::<u8>(), 0..4),
                    proptest::option::of(proptest::collection::vec(any::<u8>(), 0..4)),
                ),
                0..24,
            )
        ) {
            let mut ctx = TxnContext::default();
            let mut inserted = Vec::new();
            for (lo, hi) in ranges {
                let r = KeyRange::new(lo, hi);
                if !r.is_empty() {
                    inserted.push(r.clone());
                }
                ctx.add_absent_range(r);
            }
            prop_assert!(ctx.assert_valid_range_set());
            for r in inserted {
                let covered = ctx.absent_ranges.iter().any(|have| have.contains(&r));
                prop_assert!(covered, "inserted range {r} no longer covered");
            }
        }
    }
}

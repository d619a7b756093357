//! Concurrent leaf-paged ordered index.
//!
//! This crate provides the ordered key-value structure the transaction
//! engine layers its version chains on. It is deliberately simple, a sorted
//! sequence of leaf pages behind reader-writer locks, but it exposes the two
//! things optimistic phantom detection needs and an ordinary map does not:
//!
//! - **Leaf identity**: every leaf has a stable [`LeafId`] for the lifetime
//!   of the index (leaves split but are never merged or dropped).
//! - **Leaf versions**: a per-leaf counter bumped on every structural change
//!   (key insert, key remove, split). A scan reports the version of every
//!   leaf it visits, hit or not, so a later re-check can detect keys that
//!   materialized in the scanned range.
//!
//! The index stores an opaque handle type `V` (the engine stores a chain
//! slot); it never interprets it beyond `Clone` and, for guarded removal,
//! `PartialEq`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Keys per leaf before a split.
const DEFAULT_FANOUT: usize = 16;

/// Stable identity of a leaf page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeafId(u64);

impl LeafId {
    /// Raw id, for diagnostics.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Outcome of [`PagedIndex::insert_if_absent`].
///
/// `version_before`/`version_after` bracket the insert on the containing
/// leaf: equal when the key already existed, `before + 1` when the insert
/// won. Callers tracking scanned leaf versions use the pair to distinguish
/// their own structural change from a foreign one.
#[derive(Debug, Clone)]
pub struct InsertOutcome<V> {
    /// The surviving value: the existing one on collision, ours otherwise.
    pub value: V,
    /// Whether our value was installed.
    pub inserted: bool,
    /// Leaf the key lives in.
    pub leaf: LeafId,
    /// Leaf version observed before the insert.
    pub version_before: u64,
    /// Leaf version after the insert.
    pub version_after: u64,
}

/// Event stream delivered to a [`PagedIndex::scan`] visitor.
///
/// Each visited leaf is announced once (before its entries), including
/// leaves with no matching entries; the absence of an `Entry` between two
/// `Leaf` events is meaningful to phantom trackers.
pub enum ScanEvent<'a, V> {
    /// Entering a leaf that overlaps the scanned range.
    Leaf {
        /// Identity of the leaf.
        leaf: LeafId,
        /// Version at visit time.
        version: u64,
    },
    /// A key within the scanned range.
    Entry {
        /// The entry's key.
        key: &'a [u8],
        /// The stored handle.
        value: &'a V,
    },
}

struct Leaf<V> {
    id: LeafId,
    /// Inclusive low fence. Immutable; the first leaf's fence is empty.
    lo: Box<[u8]>,
    /// Bumped on every insert/remove/split affecting this leaf.
    version: AtomicU64,
    entries: RwLock<Vec<(Box<[u8]>, V)>>,
}

impl<V> Leaf<V> {
    fn new(id: LeafId, lo: Box<[u8]>, entries: Vec<(Box<[u8]>, V)>) -> Arc<Self> {
        Arc::new(Self {
            id,
            lo,
            version: AtomicU64::new(0),
            entries: RwLock::new(entries),
        })
    }

    fn bump(&self) -> u64 {
        self.version.fetch_add(1, Ordering::Release) + 1
    }
}

/// Sorted, concurrent, leaf-paged map from byte keys to handles.
pub struct PagedIndex<V> {
    /// Sorted by `lo`; always non-empty. Leaves are only ever appended by
    /// splits, never merged or removed.
    leaves: RwLock<Vec<Arc<Leaf<V>>>>,
    next_leaf_id: AtomicU64,
    fanout: usize,
}

impl<V: Clone> PagedIndex<V> {
    /// Create an empty index with the default fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::with_fanout(DEFAULT_FANOUT)
    }

    /// Create an empty index splitting leaves at `fanout` keys.
    #[must_use]
    pub fn with_fanout(fanout: usize) -> Self {
        assert!(fanout >= 2, "fanout must be at least 2");
        let first = Leaf::new(LeafId(0), Box::default(), Vec::new());
        Self {
            leaves: RwLock::new(vec![first]),
            next_leaf_id: AtomicU64::new(1),
            fanout,
        }
    }

    fn alloc_leaf_id(&self) -> LeafId {
        LeafId(self.next_leaf_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Index of the leaf whose range contains `key`: the last leaf with
    /// `lo <= key`. The first leaf's empty fence makes this total.
    fn locate(leaves: &[Arc<Leaf<V>>], key: &[u8]) -> usize {
        match leaves.binary_search_by(|leaf| leaf.lo.as_ref().cmp(key)) {
            Ok(i) => i,
            Err(i) => i - 1,
        }
    }

    /// Point lookup.
    #[must_use]
    pub fn find(&self, key: &[u8]) -> Option<V> {
        let leaves = self.leaves.read();
        let leaf = &leaves[Self::locate(&leaves, key)];
        let entries = leaf.entries.read();
        entries
            .binary_search_by(|(k, _)| k.as_ref().cmp(key))
            .ok()
            .map(|i| entries[i].1.clone())
    }

    /// Insert `value` at `key` unless the key is already present.
    ///
    /// On collision the existing handle survives and is returned with
    /// `inserted = false`. The outcome carries the containing leaf's version
    /// before and after the operation.
    pub fn insert_if_absent(&self, key: &[u8], value: V) -> InsertOutcome<V> {
        let outcome = {
            let leaves = self.leaves.read();
            let leaf = &leaves[Self::locate(&leaves, key)];
            let mut entries = leaf.entries.write();
            let version_before = leaf.version.load(Ordering::Acquire);
            match entries.binary_search_by(|(k, _)| k.as_ref().cmp(key)) {
                Ok(i) => InsertOutcome {
                    value: entries[i].1.clone(),
                    inserted: false,
                    leaf: leaf.id,
                    version_before,
                    version_after: version_before,
                },
                Err(i) => {
                    entries.insert(i, (key.into(), value.clone()));
                    let version_after = leaf.bump();
                    InsertOutcome {
                        value,
                        inserted: true,
                        leaf: leaf.id,
                        version_before,
                        version_after,
                    }
                }
            }
        };
        if outcome.inserted {
            self.maybe_split(outcome.leaf);
        }
        outcome
    }

    /// Remove `key` if its current handle equals `expected`.
    ///
    /// Returns whether the entry was removed. The guard makes concurrent
    /// remove-vs-reinsert races resolve safely: a slot that was swapped out
    /// and re-inserted under the same key no longer matches.
    pub fn remove(&self, key: &[u8], expected: &V) -> bool
    where
        V: PartialEq,
    {
        let leaves = self.leaves.read();
        let leaf = &leaves[Self::locate(&leaves, key)];
        let mut entries = leaf.entries.write();
        match entries.binary_search_by(|(k, _)| k.as_ref().cmp(key)) {
            Ok(i) if entries[i].1 == *expected => {
                entries.remove(i);
                leaf.bump();
                true
            }
            _ => false,
        }
    }

    /// Current version of a leaf, or `None` for an unknown id.
    #[must_use]
    pub fn leaf_version(&self, id: LeafId) -> Option<u64> {
        let leaves = self.leaves.read();
        leaves
            .iter()
            .find(|leaf| leaf.id == id)
            .map(|leaf| leaf.version.load(Ordering::Acquire))
    }

    /// Visit `[lo, hi)` in key order (`hi = None` means unbounded).
    ///
    /// The visitor sees a [`ScanEvent::Leaf`] for every leaf overlapping the
    /// range (before that leaf's entries, and even when the leaf contributes
    /// none), then each matching entry. Returning `false` stops the scan.
    pub fn scan<F>(&self, lo: &[u8], hi: Option<&[u8]>, mut visitor: F)
    where
        F: FnMut(ScanEvent<'_, V>) -> bool,
    {
        let leaves = self.leaves.read();
        let start = Self::locate(&leaves, lo);
        for leaf in &leaves[start..] {
            if let Some(hi) = hi {
                if leaf.lo.as_ref() >= hi {
                    break;
                }
            }
            let entries = leaf.entries.read();
            let version = leaf.version.load(Ordering::Acquire);
            if !visitor(ScanEvent::Leaf {
                leaf: leaf.id,
                version,
            }) {
                return;
            }
            let from = entries.partition_point(|(k, _)| k.as_ref() < lo);
            for (key, value) in &entries[from..] {
                if let Some(hi) = hi {
                    if key.as_ref() >= hi {
                        return;
                    }
                }
                if !visitor(ScanEvent::Entry {
                    key: key.as_ref(),
                    value,
                }) {
                    return;
                }
            }
        }
    }

    /// Total number of entries. Not a consistent snapshot under concurrency.
    #[must_use]
    pub fn len(&self) -> usize {
        let leaves = self.leaves.read();
        leaves.iter().map(|leaf| leaf.entries.read().len()).sum()
    }

    /// Whether the index holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain every entry, invoking `f` on each handle. Used at teardown.
    pub fn drain_with<F: FnMut(&[u8], V)>(&self, mut f: F) {
        let leaves = self.leaves.read();
        for leaf in leaves.iter() {
            let mut entries = leaf.entries.write();
            if !entries.is_empty() {
                leaf.bump();
            }
            for (key, value) in entries.drain(..) {
                f(&key, value);
            }
        }
    }

    /// Split `leaf` if it overflowed the fan-out.
    ///
    /// Runs after the insert released its locks: takes the leaves write lock,
    /// re-finds the leaf, and re-checks the overflow condition.
    fn maybe_split(&self, id: LeafId) {
        let mut leaves = self.leaves.write();
        let Some(pos) = leaves.iter().position(|leaf| leaf.id == id) else {
            return;
        };
        let leaf = Arc::clone(&leaves[pos]);
        let mut entries = leaf.entries.write();
        if entries.len() <= self.fanout {
            return;
        }

        let mid = entries.len() / 2;
        let right_entries: Vec<_> = entries.drain(mid..).collect();
        let right_lo: Box<[u8]> = right_entries[0].0.clone();
        let right = Leaf::new(self.alloc_leaf_id(), right_lo, right_entries);
        // Both halves changed shape: every key tracked against the old leaf
        // version must revalidate.
        leaf.bump();
        right.bump();
        tracing::trace!(
            target: "occdb_index",
            left = leaf.id.get(),
            right = right.id.get(),
            "leaf split"
        );
        drop(entries);
        leaves.insert(pos + 1, right);
    }
}

impl<V: Clone> Default for PagedIndex<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> std::fmt::Debug for PagedIndex<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let leaves = self.leaves.read();
        f.debug_struct("PagedIndex")
            .field("leaves", &leaves.len())
            .finish_non_exhaustive()
    }
}

//! Protocol P1: globally consistent commit timestamps.
//!
//! One 64-bit counter orders every commit. Transactions read at the counter
//! value captured at begin, so reads are true snapshot reads; in-place
//! overwrites are never allowed, so every committed write spills a chain
//! entry. Chains are bounded by [`NMAX_CHAIN_LENGTH`]: once a chain grows
//! past the cap, versions older than the oldest active snapshot (the
//! quiescent watermark) are truncated and defer-freed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_epoch::Guard;
use parking_lot::Mutex;

use crate::cache_aligned::CacheAligned;
use crate::cell::{CellPtr, Tid, VersionCell};
use crate::chain::SlotRef;
use crate::protocol::{CommitProtocol, TxnSnapshot};
use crate::reclaim;
use crate::txn::TxnIndex;

/// Maximum chain length before spill GC truncates.
pub const NMAX_CHAIN_LENGTH: usize = 10;

/// Registry of active begin snapshots; its minimum is the truncation
/// watermark.
#[derive(Debug, Default)]
struct ActiveSnapshots {
    inner: Mutex<BTreeMap<Tid, usize>>,
}

impl ActiveSnapshots {
    fn register(&self, tid: Tid) {
        *self.inner.lock().entry(tid).or_insert(0) += 1;
    }

    fn unregister(&self, tid: Tid) {
        let mut inner = self.inner.lock();
        match inner.get_mut(&tid) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                inner.remove(&tid);
            }
            None => debug_assert!(false, "unregister of unknown snapshot {tid}"),
        }
    }

    fn min(&self) -> Option<Tid> {
        self.inner.lock().keys().next().copied()
    }
}

/// P1: a single global commit counter.
pub struct GlobalTidProtocol {
    global_tid: CacheAligned<AtomicU64>,
    /// Lags `global_tid`: highest tid whose commit has fully resolved.
    last_consistent_tid: CacheAligned<AtomicU64>,
    active: ActiveSnapshots,
}

impl GlobalTidProtocol {
    #[must_use]
    pub fn new() -> Self {
        Self {
            global_tid: CacheAligned::new(AtomicU64::new(0)),
            last_consistent_tid: CacheAligned::new(AtomicU64::new(0)),
            active: ActiveSnapshots::default(),
        }
    }

    /// Highest fully resolved commit tid (observability).
    #[must_use]
    pub fn last_consistent_tid(&self) -> Tid {
        self.last_consistent_tid.load(Ordering::Acquire)
    }

    fn watermark(&self) -> Tid {
        self.active
            .min()
            .unwrap_or_else(|| self.global_tid.load(Ordering::Acquire))
    }
}

impl Default for GlobalTidProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitProtocol for GlobalTidProtocol {
    fn name(&self) -> &'static str {
        "global-tid"
    }

    fn begin(&self) -> TxnSnapshot {
        let snapshot_tid = self.global_tid.load(Ordering::Acquire);
        self.active.register(snapshot_tid);
        TxnSnapshot {
            snapshot_tid,
            has_consistent: true,
            epoch: 0,
            core: 0,
        }
    }

    fn finish_snapshot(&self, snap: &TxnSnapshot) {
        self.active.unregister(snap.snapshot_tid);
    }

    fn consistent_snapshot_tid(&self, snap: &TxnSnapshot) -> Option<Tid> {
        Some(snap.snapshot_tid)
    }

    fn can_overwrite_record_tid(&self, _prev: Tid, _cur: Tid) -> bool {
        false
    }

    fn write_tid_visible(&self, snap: &TxnSnapshot, t: Tid) -> bool {
        t <= snap.snapshot_tid
    }

    fn gen_commit_tid(&self, _snap: &TxnSnapshot, _max_write: Tid, _max_read: Tid) -> Tid {
        self.global_tid.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn on_spill(&self, guard: &Guard, head: &VersionCell) {
        let mut len = 1usize;
        let mut cur = head.next_ptr();
        while let Some(cell) = unsafe { cur.as_ref() } {
            len += 1;
            cur = cell.next_ptr();
        }
        if len <= NMAX_CHAIN_LENGTH {
            return;
        }

        let watermark = self.watermark();
        // Keep the head through the first version a watermark reader can
        // still see; everything older is unreachable from any snapshot.
        let mut keep = head;
        while keep.tid() > watermark {
            match unsafe { keep.next_ptr().as_ref() } {
                Some(older) => keep = older,
                None => return,
            }
        }
        let mut cut = keep.next_ptr();
        if cut.is_null() {
            return;
        }
        keep.clear_next();

        let mut truncated = 0usize;
        while let Some(ptr) = std::ptr::NonNull::new(cut) {
            let cell = CellPtr::new(ptr);
            cut = unsafe { cell.as_ref() }.next_ptr();
            unsafe { reclaim::retire_cell(guard, cell) };
            truncated += 1;
        }
        tracing::trace!(
            target: "occdb_mvcc::gc",
            len,
            truncated,
            watermark,
            "chain spill truncation"
        );
    }

    fn on_logical_delete(
        &self,
        _index: &Arc<TxnIndex>,
        _key: &[u8],
        _slot: SlotRef,
        _cell: CellPtr,
    ) {
        // Tombstones persist as absent markers; the chain cap reclaims their
        // history.
    }

    fn on_tid_finish(&self, commit_tid: Tid, committed: bool) {
        if committed {
            self.last_consistent_tid
                .fetch_max(commit_tid, Ordering::AcqRel);
        }
    }
}

impl std::fmt::Debug for GlobalTidProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalTidProtocol")
            .field("global_tid", &self.global_tid.load(Ordering::Relaxed))
            .field(
                "last_consistent_tid",
                &self.last_consistent_tid.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_tids_are_strictly_increasing() {
        let p = GlobalTidProtocol::new();
        let snap = p.begin();
        let a = p.gen_commit_tid(&snap, 0, 0);
        let b = p.gen_commit_tid(&snap, 0, 0);
        assert!(b > a);
        p.finish_snapshot(&snap);
    }

    #[test]
    fn snapshot_is_counter_at_begin() {
        let p = GlobalTidProtocol::new();
        let s1 = p.begin();
        let t = p.gen_commit_tid(&s1, 0, 0);
        let s2 = p.begin();
        assert!(s1.snapshot_tid < t);
        assert!(s2.snapshot_tid >= t);
        assert_eq!(p.consistent_snapshot_tid(&s2), Some(s2.snapshot_tid));
        p.finish_snapshot(&s1);
        p.finish_snapshot(&s2);
    }

    #[test]
    fn watermark_tracks_oldest_active_snapshot() {
        let p = GlobalTidProtocol::new();
        assert_eq!(p.watermark(), 0);

        let s1 = p.begin();
        let _ = p.gen_commit_tid(&s1, 0, 0);
        let _ = p.gen_commit_tid(&s1, 0, 0);
        let s2 = p.begin();
        assert_eq!(p.watermark(), s1.snapshot_tid);

        p.finish_snapshot(&s1);
        assert_eq!(p.watermark(), s2.snapshot_tid);

        p.finish_snapshot(&s2);
        assert_eq!(p.watermark(), 2, "idle watermark is the counter itself");
    }

    #[test]
    fn never_overwrites_and_write_visibility_uses_snapshot() {
        let p = GlobalTidProtocol::new();
        let snap = p.begin();
        assert!(!p.can_overwrite_record_tid(1, 2));
        assert!(p.write_tid_visible(&snap, snap.snapshot_tid));
        assert!(!p.write_tid_visible(&snap, snap.snapshot_tid + 1));
        p.finish_snapshot(&snap);
    }

    #[test]
    fn last_consistent_lags_until_finish() {
        let p = GlobalTidProtocol::new();
        let snap = p.begin();
        let t = p.gen_commit_tid(&snap, 0, 0);
        assert_eq!(p.last_consistent_tid(), 0);
        p.on_tid_finish(t, true);
        assert_eq!(p.last_consistent_tid(), t);
        p.finish_snapshot(&snap);
    }
}

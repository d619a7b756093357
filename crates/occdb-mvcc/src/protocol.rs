//! The commit-protocol capability seam.
//!
//! The transaction lifecycle is polymorphic over how commit timestamps are
//! generated and how versions age out. Two implementations exist:
//! [`GlobalTidProtocol`](crate::proto_global::GlobalTidProtocol) (one global
//! counter, full version chains) and
//! [`EpochTidProtocol`](crate::proto_epoch::EpochTidProtocol) (partitioned
//! epoch/num/core timestamps with asynchronous garbage collection).

use std::sync::Arc;

use crossbeam_epoch::Guard;

use crate::cell::{CellPtr, Tid, VersionCell, MAX_TID, MIN_TID};
use crate::chain::SlotRef;
use crate::txn::TxnIndex;

/// Protocol-specific per-transaction state, captured at `begin`.
#[derive(Debug, Clone, Copy)]
pub struct TxnSnapshot {
    /// Upper bound for stable reads; `MAX_TID` when the protocol reads the
    /// newest committed version and relies on validation.
    pub snapshot_tid: Tid,
    /// Whether `snapshot_tid` is a consistent snapshot point.
    pub has_consistent: bool,
    /// Epoch the transaction runs in (0 outside the epoch protocol).
    pub epoch: u64,
    /// Core the transaction is pinned to for TID generation.
    pub core: usize,
}

/// Commit-time identifier and consistency protocol.
///
/// `on_spill` is invoked with the chain exclusively held (head locked, or a
/// not-yet-published replacement head) so truncation never races another
/// mutator. `on_logical_delete` is invoked with the cell's lock held.
pub trait CommitProtocol: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Capture per-transaction protocol state.
    fn begin(&self) -> TxnSnapshot;

    /// Release per-transaction protocol state (commit or abort).
    fn finish_snapshot(&self, snap: &TxnSnapshot);

    /// The consistent snapshot point, if this protocol maintains one.
    fn consistent_snapshot_tid(&self, snap: &TxnSnapshot) -> Option<Tid>;

    /// Tid used for stable reads by this transaction.
    fn read_tid(&self, snap: &TxnSnapshot) -> Tid {
        self.consistent_snapshot_tid(snap).unwrap_or(MAX_TID)
    }

    /// Tid carried by a freshly inserted absent cell.
    fn null_entry_tid(&self) -> Tid {
        MIN_TID
    }

    /// Whether a version written at `t` may be observed by this transaction.
    fn can_read_tid(&self, _snap: &TxnSnapshot, _t: Tid) -> bool {
        true
    }

    /// Whether a commit at `cur` may overwrite the version at `prev` in
    /// place instead of spilling a chain entry.
    fn can_overwrite_record_tid(&self, prev: Tid, cur: Tid) -> bool;

    /// Whether a locked write cell's current tid is visible at this
    /// transaction's begin snapshot. A `false` answer means another
    /// transaction committed the cell after we began: write-node
    /// interference.
    fn write_tid_visible(&self, snap: &TxnSnapshot, t: Tid) -> bool;

    /// Generate this transaction's commit tid. `max_write_tid` and
    /// `max_read_tid` are the largest tids observed on locked write cells
    /// and in the read set.
    fn gen_commit_tid(&self, snap: &TxnSnapshot, max_write_tid: Tid, max_read_tid: Tid) -> Tid;

    /// A write grew `head`'s chain; truncate versions no active snapshot
    /// can still read and defer-free them.
    fn on_spill(&self, guard: &Guard, head: &VersionCell);

    /// The latest value written to the chain at `slot` is a tombstone;
    /// schedule its eventual unlink from `index`. Called under `cell`'s
    /// lock.
    fn on_logical_delete(&self, index: &Arc<TxnIndex>, key: &[u8], slot: SlotRef, cell: CellPtr);

    /// Called after commit or abort resolution with the generated tid.
    fn on_tid_finish(&self, commit_tid: Tid, committed: bool);

    /// Block until the next epoch boundary (no-op outside the epoch
    /// protocol).
    fn sync_epoch(&self) {}

    /// Block until deferred per-epoch work has drained (no-op outside the
    /// epoch protocol).
    fn finish_work(&self) {}

    /// Stop background machinery and run remaining deferred work. Called
    /// once at engine teardown, before indexes are purged.
    fn shutdown(&self) {}
}

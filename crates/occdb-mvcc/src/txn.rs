//! Engine and transaction lifecycle.
//!
//! A [`Transaction`] buffers writes and materializes reads into per-index
//! contexts, then resolves through the commit protocol:
//!
//! 1. obtain an index slot for every buffered write (inserting absent cells
//!    as needed),
//! 2. lock every write cell in global (index, key) order,
//! 3. generate the commit tid,
//! 4. validate the read set against current cell versions,
//! 5. validate that no read came from a forbidden timestamp,
//! 6. validate phantom state (scanned-leaf versions, absent ranges),
//! 7. install the writes, swapping slots when a chain head is replaced,
//! 8. schedule tombstone unlinks,
//! 9. unlock in reverse order.
//!
//! Any validation failure releases every lock, leaves no visible mutation,
//! and resolves the transaction as aborted with a reason code.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use occdb_error::{AbortReason, OccError, Result};
use occdb_index::{LeafId, PagedIndex, ScanEvent};

use crate::cell::{CellPtr, Tid, VersionCell, MIN_TID};
use crate::chain::{self, SlotRef};
use crate::context::{key_successor, KeyRange, LocalHit, ReadRecord, TxnContext};
use crate::observability::GLOBAL_TXN_METRICS;
use crate::protocol::{CommitProtocol, TxnSnapshot};
use crate::proto_epoch::{EpochConfig, EpochTidProtocol};
use crate::proto_global::GlobalTidProtocol;
use crate::reclaim::{self, TxnGuard};

/// Use the low-level scan protocol (leaf-version tracking) for scan
/// consistency instead of absent-range bookkeeping.
pub const TXN_FLAG_LOW_LEVEL_SCAN: u64 = 0x1;

/// Mark the transaction read-only; a write raises
/// [`OccError::ReadOnly`] and aborts it.
pub const TXN_FLAG_READ_ONLY: u64 = 0x2;

thread_local! {
    static ACTIVE_TXNS: Cell<usize> = const { Cell::new(0) };
}

/// Number of unresolved transactions on the calling thread.
#[must_use]
pub(crate) fn active_txns_on_thread() -> usize {
    ACTIVE_TXNS.with(Cell::get)
}

// ---------------------------------------------------------------------------
// TxnIndex
// ---------------------------------------------------------------------------

/// A transactional index handle: the ordered index plus a stable identity
/// used for deterministic commit lock ordering.
pub struct TxnIndex {
    id: u64,
    name: String,
    raw: PagedIndex<SlotRef>,
}

impl TxnIndex {
    /// Application-visible name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub(crate) fn raw(&self) -> &PagedIndex<SlotRef> {
        &self.raw
    }

    /// Chain tids for `key`, newest first. Quiescent callers only.
    #[must_use]
    pub(crate) fn chain_tids(&self, key: &[u8]) -> Option<Vec<Tid>> {
        self.raw.find(key).map(|slot| chain::chain_tids(slot.head()))
    }

    /// Free every chain. Teardown only: no concurrent users remain.
    fn purge(&self) {
        self.raw.drain_with(|_key, slot| unsafe {
            reclaim::free_chain_now(slot.head());
        });
    }
}

impl std::fmt::Debug for TxnIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnIndex")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Owns the commit protocol and every transactional index.
pub struct Engine {
    protocol: Arc<dyn CommitProtocol>,
    indexes: Mutex<Vec<Arc<TxnIndex>>>,
    next_index_id: AtomicU64,
}

impl Engine {
    /// Engine running protocol P1: one global commit counter.
    #[must_use]
    pub fn with_global_tids() -> Self {
        Self::with_protocol(Arc::new(GlobalTidProtocol::new()))
    }

    /// Engine running protocol P2: epoch-partitioned commit tids.
    #[must_use]
    pub fn with_epoch_tids() -> Self {
        Self::with_protocol(Arc::new(EpochTidProtocol::new()))
    }

    /// P2 engine with explicit epoch tunables.
    #[must_use]
    pub fn with_epoch_config(config: EpochConfig) -> Self {
        Self::with_protocol(Arc::new(EpochTidProtocol::with_config(config)))
    }

    fn with_protocol(protocol: Arc<dyn CommitProtocol>) -> Self {
        tracing::info!(
            target: "occdb_mvcc::engine",
            protocol = protocol.name(),
            "engine started"
        );
        Self {
            protocol,
            indexes: Mutex::new(Vec::new()),
            next_index_id: AtomicU64::new(0),
        }
    }

    /// Name of the active commit protocol.
    #[must_use]
    pub fn protocol_name(&self) -> &'static str {
        self.protocol.name()
    }

    /// Create a new named index.
    pub fn create_index(&self, name: &str) -> Arc<TxnIndex> {
        let index = Arc::new(TxnIndex {
            id: self.next_index_id.fetch_add(1, Ordering::Relaxed),
            name: name.to_owned(),
            raw: PagedIndex::new(),
        });
        self.indexes.lock().push(Arc::clone(&index));
        tracing::info!(target: "occdb_mvcc::engine", name, id = index.id, "index created");
        index
    }

    /// Begin a transaction.
    #[must_use]
    pub fn begin(&self, flags: u64) -> Transaction<'_> {
        Transaction::new(self, flags)
    }

    /// Block until the next epoch boundary (P2; no-op under P1).
    pub fn wait_an_epoch(&self) {
        self.protocol.sync_epoch();
    }

    /// Block until deferred per-epoch work has drained (P2; no-op under P1).
    pub fn wait_for_empty_work_queue(&self) {
        self.protocol.finish_work();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.protocol.shutdown();
        for index in self.indexes.lock().iter() {
            index.purge();
        }
        reclaim::quiescent();
        tracing::info!(target: "occdb_mvcc::engine", "engine stopped");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("protocol", &self.protocol.name())
            .field("indexes", &self.indexes.lock().len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// Transaction lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Allocated, no operation performed yet.
    Embryo,
    /// At least one operation performed.
    Active,
    /// Resolved successfully.
    Committed,
    /// Resolved by abort.
    Aborted,
}

impl TxnState {
    /// Stable name for logs and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Embryo => "Embryo",
            Self::Active => "Active",
            Self::Committed => "Committed",
            Self::Aborted => "Aborted",
        }
    }
}

struct IndexCtx {
    index: Arc<TxnIndex>,
    ctx: TxnContext,
}

/// One transaction. Bound to its engine and, by the epoch pin it carries,
/// to the thread it was begun on.
pub struct Transaction<'e> {
    engine: &'e Engine,
    flags: u64,
    state: TxnState,
    last_reason: Option<AbortReason>,
    snap: TxnSnapshot,
    ctxs: BTreeMap<u64, IndexCtx>,
    /// Present while unresolved; doubles as the epoch pin for every cell
    /// pointer in the read set.
    guard: Option<TxnGuard>,
}

/// One buffered write bound to its slot during commit.
struct WriteEntry {
    index: Arc<TxnIndex>,
    index_id: u64,
    key: Vec<u8>,
    value: Vec<u8>,
    slot: SlotRef,
    cell: Option<CellPtr>,
}

fn find_write<'a>(writes: &'a [WriteEntry], index_id: u64, key: &[u8]) -> Option<&'a WriteEntry> {
    writes
        .binary_search_by(|e| (e.index_id, e.key.as_slice()).cmp(&(index_id, key)))
        .ok()
        .map(|i| &writes[i])
}

/// Obtain the slot for a write, inserting a fresh absent chain when the key
/// has none. Maintains the scanned-leaf bookkeeping for our own structural
/// changes.
fn acquire_slot(
    index: &Arc<TxnIndex>,
    key: &[u8],
    value_len: usize,
    low_level: bool,
    node_scan: &mut std::collections::HashMap<LeafId, u64>,
) -> std::result::Result<SlotRef, AbortReason> {
    if let Some(slot) = index.raw().find(key) {
        return Ok(slot);
    }
    let fresh_head = VersionCell::alloc_first(value_len);
    let fresh = SlotRef::new_chain(fresh_head);
    let out = index.raw().insert_if_absent(key, fresh);
    if !out.inserted {
        // Lost the race: adopt the existing slot, drop our never-published
        // cell.
        unsafe { reclaim::free_cell_now(fresh_head) };
        return Ok(out.value);
    }
    if low_level {
        if let Some(seen) = node_scan.get_mut(&out.leaf) {
            if *seen != out.version_before {
                return Err(AbortReason::NodeScanWriteVersionChanged);
            }
            *seen = out.version_after;
        }
    }
    Ok(out.value)
}

enum SlotRead {
    Hit {
        tid: Tid,
        bytes: Vec<u8>,
        head: CellPtr,
    },
    /// No version at or below the read tid exists on this chain.
    Invisible { head: CellPtr },
}

fn read_via_slot(slot: &SlotRef, read_tid: Tid) -> SlotRead {
    loop {
        let head = slot.head();
        match unsafe { head.as_ref() }.stable_read(read_tid) {
            Some((tid, bytes)) => return SlotRead::Hit { tid, bytes, head },
            None => {
                if slot.head() != head {
                    // The head was replaced mid-read; chase the new one.
                    continue;
                }
                return SlotRead::Invisible { head };
            }
        }
    }
}

impl<'e> Transaction<'e> {
    fn new(engine: &'e Engine, flags: u64) -> Self {
        let snap = engine.protocol.begin();
        ACTIVE_TXNS.with(|c| c.set(c.get() + 1));
        tracing::debug!(
            target: "occdb_mvcc::txn",
            protocol = engine.protocol.name(),
            flags,
            snapshot_tid = snap.snapshot_tid,
            epoch = snap.epoch,
            "transaction begun"
        );
        Self {
            engine,
            flags,
            state: TxnState::Embryo,
            last_reason: None,
            snap,
            ctxs: BTreeMap::new(),
            guard: Some(TxnGuard::pin()),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Flags passed at `begin`.
    #[must_use]
    pub fn flags(&self) -> u64 {
        self.flags
    }

    /// Reason of the most recent abort, if any.
    #[must_use]
    pub fn last_abort_reason(&self) -> Option<AbortReason> {
        self.last_reason
    }

    fn ensure_active(&mut self) -> Result<()> {
        match self.state {
            TxnState::Embryo => {
                self.state = TxnState::Active;
                Ok(())
            }
            TxnState::Active => Ok(()),
            state => Err(OccError::Unusable {
                state: state.as_str(),
            }),
        }
    }

    fn ctx(&mut self, index: &Arc<TxnIndex>) -> &mut TxnContext {
        &mut self
            .ctxs
            .entry(index.id)
            .or_insert_with(|| IndexCtx {
                index: Arc::clone(index),
                ctx: TxnContext::default(),
            })
            .ctx
    }

    /// Abort with `reason` and surface the matching error.
    fn fail(&mut self, reason: AbortReason) -> OccError {
        self.abort_impl(reason);
        OccError::Aborted { reason }
    }

    /// Read `key`, giving buffered local state priority over the index.
    pub fn get(&mut self, index: &Arc<TxnIndex>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_active()?;
        let protocol = Arc::clone(&self.engine.protocol);
        let read_tid = protocol.read_tid(&self.snap);

        {
            let ctx = self.ctx(index);
            match ctx.local_search(key) {
                LocalHit::Present(value) => return Ok(Some(value.to_vec())),
                LocalHit::Absent => return Ok(None),
                LocalHit::Unknown => {}
            }
            if ctx.key_in_absent_set(key) {
                return Ok(None);
            }
        }

        let Some(slot) = index.raw().find(key) else {
            self.ctx(index)
                .read_set
                .insert(key.to_vec(), ReadRecord::miss());
            return Ok(None);
        };

        match read_via_slot(&slot, read_tid) {
            SlotRead::Invisible { head } => {
                self.ctx(index).read_set.insert(
                    key.to_vec(),
                    ReadRecord {
                        tid: MIN_TID,
                        bytes: Vec::new(),
                        cell: Some(head),
                    },
                );
                Ok(None)
            }
            SlotRead::Hit { tid, bytes, head } => {
                if !protocol.can_read_tid(&self.snap, tid) {
                    return Err(self.fail(AbortReason::FutureTidRead));
                }
                if bytes.is_empty() {
                    GLOBAL_TXN_METRICS.record_tombstone_point_read();
                }
                let result = (!bytes.is_empty()).then(|| bytes.clone());
                self.ctx(index).read_set.insert(
                    key.to_vec(),
                    ReadRecord {
                        tid,
                        bytes,
                        cell: Some(head),
                    },
                );
                Ok(result)
            }
        }
    }

    /// Buffer a write of `value` at `key`.
    pub fn put(&mut self, index: &Arc<TxnIndex>, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(index, key, value.to_vec())
    }

    /// Buffer a delete of `key`.
    pub fn delete(&mut self, index: &Arc<TxnIndex>, key: &[u8]) -> Result<()> {
        self.write(index, key, Vec::new())
    }

    fn write(&mut self, index: &Arc<TxnIndex>, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.ensure_active()?;
        if self.flags & TXN_FLAG_READ_ONLY != 0 {
            self.abort_impl(AbortReason::User);
            return Err(OccError::ReadOnly);
        }
        self.ctx(index).write_set.insert(key.to_vec(), value);
        Ok(())
    }

    /// Scan `[lo, hi)` (`hi = None` is unbounded), calling `visitor` with
    /// each visible key/value in key order. Returning `false` stops
    /// delivery; the consistency bookkeeping for the whole range is kept
    /// either way.
    pub fn scan<F>(
        &mut self,
        index: &Arc<TxnIndex>,
        lo: &[u8],
        hi: Option<&[u8]>,
        mut visitor: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        self.ensure_active()?;
        let protocol = Arc::clone(&self.engine.protocol);
        let read_tid = protocol.read_tid(&self.snap);
        let low_level = self.flags & TXN_FLAG_LOW_LEVEL_SCAN != 0;

        let mut leaves: Vec<(LeafId, u64)> = Vec::new();
        let mut entries: Vec<(Vec<u8>, SlotRef)> = Vec::new();
        index.raw().scan(lo, hi, |ev| {
            match ev {
                ScanEvent::Leaf { leaf, version } => {
                    if low_level {
                        leaves.push((leaf, version));
                    }
                }
                ScanEvent::Entry { key, value } => entries.push((key.to_vec(), value.clone())),
            }
            true
        });

        if low_level {
            let ctx = self.ctx(index);
            let mut stale = false;
            for (leaf, version) in leaves {
                match ctx.node_scan.get(&leaf) {
                    Some(&seen) if seen != version => {
                        stale = true;
                        break;
                    }
                    Some(_) => {}
                    None => {
                        ctx.node_scan.insert(leaf, version);
                    }
                }
            }
            if stale {
                return Err(self.fail(AbortReason::NodeScanReadVersionChanged));
            }
        }

        let mut results: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for (key, slot) in &entries {
            let locally_known = {
                let ctx = self.ctx(index);
                if ctx.write_set.contains_key(key) {
                    true
                } else if let Some(record) = ctx.read_set.get(key) {
                    if !record.observed_absent() {
                        results.insert(key.clone(), record.bytes.clone());
                    }
                    true
                } else {
                    false
                }
            };
            if locally_known {
                continue;
            }

            match read_via_slot(slot, read_tid) {
                SlotRead::Invisible { head } => {
                    self.ctx(index).read_set.insert(
                        key.clone(),
                        ReadRecord {
                            tid: MIN_TID,
                            bytes: Vec::new(),
                            cell: Some(head),
                        },
                    );
                }
                SlotRead::Hit { tid, bytes, head } => {
                    if !protocol.can_read_tid(&self.snap, tid) {
                        return Err(self.fail(AbortReason::FutureTidRead));
                    }
                    if bytes.is_empty() {
                        GLOBAL_TXN_METRICS.record_tombstone_scan_read();
                    } else {
                        results.insert(key.clone(), bytes.clone());
                    }
                    self.ctx(index).read_set.insert(
                        key.clone(),
                        ReadRecord {
                            tid,
                            bytes,
                            cell: Some(head),
                        },
                    );
                }
            }
        }

        if !low_level {
            // The subranges between slot-bearing keys held no committed
            // keys; remember them for commit-time phantom detection.
            let ctx = self.ctx(index);
            let mut cursor = lo.to_vec();
            for (key, _) in &entries {
                ctx.add_absent_range(KeyRange::new(cursor.clone(), Some(key.clone())));
                cursor = key_successor(key);
            }
            ctx.add_absent_range(KeyRange::new(cursor, hi.map(<[u8]>::to_vec)));
        }

        // Overlay buffered writes, then deliver.
        {
            let hi_bound = match hi {
                Some(h) => Bound::Excluded(h),
                None => Bound::Unbounded,
            };
            let ctx = self.ctx(index);
            for (key, value) in ctx.write_set.range::<[u8], _>((Bound::Included(lo), hi_bound)) {
                if value.is_empty() {
                    results.remove(key);
                } else {
                    results.insert(key.clone(), value.clone());
                }
            }
        }
        for (key, value) in &results {
            if !visitor(key, value) {
                break;
            }
        }
        Ok(())
    }

    /// Commit. `Ok(true)` on success, `Ok(false)` on a validation abort
    /// (see [`last_abort_reason`](Self::last_abort_reason)); usage errors
    /// surface as `Err`.
    pub fn commit(&mut self) -> Result<bool> {
        match self.state {
            TxnState::Committed | TxnState::Aborted => {
                return Err(OccError::Unusable {
                    state: self.state.as_str(),
                })
            }
            TxnState::Embryo => {
                self.state = TxnState::Committed;
                self.resolve();
                return Ok(true);
            }
            TxnState::Active => {}
        }

        match self.try_commit() {
            Ok(commit_tid) => {
                self.state = TxnState::Committed;
                GLOBAL_TXN_METRICS.record_commit();
                self.engine.protocol.on_tid_finish(commit_tid, true);
                tracing::debug!(target: "occdb_mvcc::txn", commit_tid, "transaction committed");
                self.resolve();
                Ok(true)
            }
            Err(reason) => {
                self.abort_impl(reason);
                Ok(false)
            }
        }
    }

    /// Commit, signalling an abort as [`OccError::Aborted`] instead of a
    /// boolean.
    pub fn commit_strict(&mut self) -> Result<()> {
        if self.commit()? {
            Ok(())
        } else {
            Err(OccError::Aborted {
                reason: self.last_reason.unwrap_or(AbortReason::User),
            })
        }
    }

    /// Abort. Always succeeds; resolved transactions are left as they are.
    pub fn abort(&mut self) {
        if matches!(self.state, TxnState::Embryo | TxnState::Active) {
            self.abort_impl(AbortReason::User);
        }
    }

    fn abort_impl(&mut self, reason: AbortReason) {
        GLOBAL_TXN_METRICS.record_abort(reason);
        self.last_reason = Some(reason);
        self.state = TxnState::Aborted;
        tracing::debug!(target: "occdb_mvcc::txn", reason = %reason, "transaction aborted");
        self.resolve();
    }

    /// Release protocol state, contexts, and the epoch pin. Idempotent.
    fn resolve(&mut self) {
        if self.guard.take().is_some() {
            self.engine.protocol.finish_snapshot(&self.snap);
            ACTIVE_TXNS.with(|c| c.set(c.get() - 1));
            self.ctxs.clear();
            reclaim::quiescent();
        }
    }

    /// Log the transaction's state and per-index context sizes.
    pub fn dump_debug(&self) {
        tracing::debug!(
            target: "occdb_mvcc::txn",
            state = self.state.as_str(),
            flags = self.flags,
            reason = ?self.last_reason,
            snapshot_tid = self.snap.snapshot_tid,
            epoch = self.snap.epoch,
            "transaction"
        );
        for (id, ictx) in &self.ctxs {
            tracing::debug!(
                target: "occdb_mvcc::txn",
                index = id,
                name = ictx.index.name(),
                reads = ictx.ctx.read_set.len(),
                writes = ictx.ctx.write_set.len(),
                absent_ranges = ictx.ctx.absent_ranges.len(),
                scanned_leaves = ictx.ctx.node_scan.len(),
                "transaction context"
            );
        }
    }

    // -- commit internals --------------------------------------------------

    fn try_commit(&mut self) -> std::result::Result<Tid, AbortReason> {
        let protocol = Arc::clone(&self.engine.protocol);
        let low_level = self.flags & TXN_FLAG_LOW_LEVEL_SCAN != 0;

        // Step 1: a slot for every buffered write, sorted by (index, key).
        let mut writes: Vec<WriteEntry> = Vec::new();
        for ictx in self.ctxs.values_mut() {
            let index = Arc::clone(&ictx.index);
            for (key, value) in &ictx.ctx.write_set {
                let slot = acquire_slot(
                    &index,
                    key,
                    value.len(),
                    low_level,
                    &mut ictx.ctx.node_scan,
                )?;
                writes.push(WriteEntry {
                    index: Arc::clone(&index),
                    index_id: index.id,
                    key: key.clone(),
                    value: value.clone(),
                    slot,
                    cell: None,
                });
            }
        }

        // Step 2: lock in deterministic global order.
        let mut locked: SmallVec<[usize; 8]> = SmallVec::new();
        let mut failure = None;
        'locking: for i in 0..writes.len() {
            let cell = loop {
                let head = writes[i].slot.head();
                let c = unsafe { head.as_ref() };
                c.lock();
                if c.is_deleting() {
                    // The slot is being unlinked under us; take a fresh one.
                    c.unlock();
                    let ictx = self
                        .ctxs
                        .get_mut(&writes[i].index_id)
                        .expect("write entry has a context");
                    match acquire_slot(
                        &writes[i].index,
                        &writes[i].key,
                        writes[i].value.len(),
                        low_level,
                        &mut ictx.ctx.node_scan,
                    ) {
                        Ok(slot) => {
                            writes[i].slot = slot;
                            continue;
                        }
                        Err(reason) => {
                            failure = Some(reason);
                            break 'locking;
                        }
                    }
                }
                if writes[i].slot.head() != head || !c.is_latest() {
                    // Raced a replacement; the slot now points elsewhere.
                    c.unlock();
                    continue;
                }
                break head;
            };
            if !protocol.write_tid_visible(&self.snap, unsafe { cell.as_ref() }.tid()) {
                unsafe { cell.as_ref() }.unlock();
                failure = Some(AbortReason::WriteNodeInterference);
                break 'locking;
            }
            writes[i].cell = Some(cell);
            locked.push(i);
        }
        if let Some(reason) = failure {
            Self::unlock_all(&writes, &locked);
            return Err(reason);
        }

        // Step 3: commit tid.
        let max_write_tid = locked
            .iter()
            .map(|&i| unsafe { writes[i].cell.expect("locked").as_ref() }.tid())
            .max()
            .unwrap_or(MIN_TID);
        let max_read_tid = self
            .ctxs
            .values()
            .flat_map(|ictx| ictx.ctx.read_set.values().map(|r| r.tid))
            .max()
            .unwrap_or(MIN_TID);
        let commit_tid = protocol.gen_commit_tid(&self.snap, max_write_tid, max_read_tid);

        // Steps 4–6: validation, with every write cell locked.
        if let Err(reason) = self.validate(&protocol, &writes, commit_tid) {
            Self::unlock_all(&writes, &locked);
            protocol.on_tid_finish(commit_tid, false);
            return Err(reason);
        }

        // Steps 7–8: install.
        let guard = self.guard.as_ref().expect("active txn holds a pin").guard();
        let mut displaced: SmallVec<[CellPtr; 4]> = SmallVec::new();
        for &i in &locked {
            let entry = &writes[i];
            let cell = entry.cell.expect("locked");
            let c = unsafe { cell.as_ref() };
            let can_overwrite = protocol.can_overwrite_record_tid(c.tid(), commit_tid);
            let outcome = c.write_record_at(can_overwrite, commit_tid, &entry.value);
            let head_after = outcome.replacement.unwrap_or(cell);

            match outcome.replacement {
                Some(rep) => {
                    // A replaced head always carried a non-empty new value;
                    // any pending tombstone removal is canceled here, and a
                    // displaced head is reclaimed below after unlock.
                    if c.is_enqueued() {
                        c.set_enqueued(false);
                    }
                    if outcome.displaced {
                        displaced.push(cell);
                    }
                    if outcome.grew {
                        protocol.on_spill(guard, unsafe { rep.as_ref() });
                    }
                    entry.slot.store_head(rep);
                }
                None => {
                    if c.is_enqueued() && !entry.value.is_empty() {
                        c.set_enqueued(false);
                    }
                    if outcome.grew {
                        protocol.on_spill(guard, c);
                    }
                }
            }

            if entry.value.is_empty() {
                protocol.on_logical_delete(&entry.index, &entry.key, entry.slot.clone(), head_after);
            }
        }

        // Step 9: release in reverse order, then reclaim displaced heads.
        Self::unlock_all(&writes, &locked);
        for cell in displaced {
            unsafe { reclaim::retire_cell(guard, cell) };
        }
        Ok(commit_tid)
    }

    fn unlock_all(writes: &[WriteEntry], locked: &[usize]) {
        for &i in locked.iter().rev() {
            let cell = writes[i].cell.expect("locked entries carry their cell");
            unsafe { cell.as_ref() }.unlock();
        }
    }

    fn validate(
        &self,
        protocol: &Arc<dyn CommitProtocol>,
        writes: &[WriteEntry],
        commit_tid: Tid,
    ) -> std::result::Result<(), AbortReason> {
        for (&index_id, ictx) in &self.ctxs {
            let index = &ictx.index;

            // Step 4: every read must still be the latest version it saw;
            // step 5: and must not come from a forbidden timestamp.
            for (key, record) in &ictx.ctx.read_set {
                let own = find_write(writes, index_id, key);
                if record.observed_absent() {
                    if let Some(slot) = index.raw().find(key) {
                        let head = slot.head();
                        let still_absent = match own {
                            Some(entry) if entry.cell == Some(head) => {
                                unsafe { head.as_ref() }.latest_value_is_nil()
                            }
                            _ => unsafe { head.as_ref() }.stable_latest_value_is_nil(),
                        };
                        if !still_absent {
                            return Err(AbortReason::ReadAbsenceInterference);
                        }
                    }
                } else {
                    let cell = record.cell.expect("non-absent reads carry a cell");
                    match own {
                        Some(entry) => {
                            if entry.cell != Some(cell) {
                                return Err(AbortReason::ReadNodeInterference);
                            }
                            let c = unsafe { cell.as_ref() };
                            if !c.is_latest_version(record.tid) {
                                return Err(AbortReason::ReadNodeInterference);
                            }
                        }
                        None => {
                            let c = unsafe { cell.as_ref() };
                            if !c.stable_is_latest_version(record.tid) {
                                let reason = if c.is_locked() {
                                    AbortReason::UnstableRead
                                } else {
                                    AbortReason::ReadNodeInterference
                                };
                                return Err(reason);
                            }
                        }
                    }
                }
                if record.tid > commit_tid || !protocol.can_read_tid(&self.snap, record.tid) {
                    return Err(AbortReason::FutureTidRead);
                }
            }

            // Step 6: phantom avoidance.
            for (&leaf, &version) in &ictx.ctx.node_scan {
                if index.raw().leaf_version(leaf) != Some(version) {
                    return Err(AbortReason::NodeScanReadVersionChanged);
                }
            }
            for range in &ictx.ctx.absent_ranges {
                let mut violated = false;
                index.raw().scan(&range.lo, range.hi.as_deref(), |ev| {
                    if let ScanEvent::Entry { key, value: slot } = ev {
                        let head = slot.head();
                        let own = find_write(writes, index_id, key)
                            .is_some_and(|entry| entry.cell == Some(head));
                        if !own && !unsafe { head.as_ref() }.stable_latest_value_is_nil() {
                            violated = true;
                            return false;
                        }
                    }
                    true
                });
                if violated {
                    return Err(AbortReason::ReadAbsenceInterference);
                }
            }
        }
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if matches!(self.state, TxnState::Embryo | TxnState::Active) {
            self.abort_impl(AbortReason::User);
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state.as_str())
            .field("flags", &self.flags)
            .field("last_reason", &self.last_reason)
            .field("contexts", &self.ctxs.len())
            .finish_non_exhaustive()
    }
}

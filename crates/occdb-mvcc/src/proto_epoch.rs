//! Protocol P2: epoch-partitioned commit timestamps.
//!
//! A commit tid packs three fields:
//!
//! ```text
//! [ epoch | num | core ]
//! [  high | 27b | low  ]
//! ```
//!
//! All transactions running in epoch `e` commit with tids whose epoch field
//! is `e`; within an epoch, per-core `num` fields are monotonic, so commits
//! are partially ordered inside an epoch and strictly ordered across epochs.
//! In-place overwrites are allowed only within one epoch, which makes every
//! epoch boundary a clean snapshot frontier.
//!
//! A dedicated thread advances the epoch: it quiesces commit-tid generation
//! by taking every per-core spinlock, bumps `g_current_epoch`, waits out the
//! prior epoch, drains per-core deferred-work queues, and then publishes
//! `g_last_consistent_epoch`. The invariant
//! `current == last_consistent || current == last_consistent + 1` holds
//! throughout.

use std::cell::OnceCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_epoch::{self as epoch, Guard};
use parking_lot::Mutex;

use crate::cache_aligned::CacheAligned;
use crate::cell::{CellPtr, Tid, VersionCell};
use crate::chain::SlotRef;
use crate::protocol::{CommitProtocol, TxnSnapshot};
use crate::reclaim;
use crate::txn::{self, TxnIndex};

// ---------------------------------------------------------------------------
// TID layout
// ---------------------------------------------------------------------------

/// Maximum number of distinct cores (threads holding a core id at once).
pub const NMAX_CORES: usize = 1 << CORE_BITS;

const CORE_BITS: u32 = 8;
const NUM_BITS: u32 = 27;
const EPOCH_BITS: u32 = 64 - NUM_BITS - CORE_BITS;

const CORE_MASK: u64 = (1 << CORE_BITS) - 1;
const NUM_SHIFT: u32 = CORE_BITS;
const NUM_MASK: u64 = ((1 << NUM_BITS) - 1) << NUM_SHIFT;
const NUM_MAX: u64 = (1 << NUM_BITS) - 1;
const EPOCH_SHIFT: u32 = CORE_BITS + NUM_BITS;
const EPOCH_MASK: u64 = !0 << EPOCH_SHIFT;

// The three fields must partition the word.
const _: () = {
    assert!((CORE_MASK | NUM_MASK | EPOCH_MASK) == !0u64);
    assert!((CORE_MASK & NUM_MASK) == 0);
    assert!((NUM_MASK & EPOCH_MASK) == 0);
    assert!((CORE_MASK & EPOCH_MASK) == 0);
    assert!(EPOCH_BITS == 29);
};

/// Core field of a tid.
#[inline]
#[must_use]
pub fn core_of(t: Tid) -> u64 {
    t & CORE_MASK
}

/// Num field of a tid.
#[inline]
#[must_use]
pub fn num_of(t: Tid) -> u64 {
    (t & NUM_MASK) >> NUM_SHIFT
}

/// Epoch field of a tid.
#[inline]
#[must_use]
pub fn epoch_of(t: Tid) -> u64 {
    (t & EPOCH_MASK) >> EPOCH_SHIFT
}

/// Compose a tid from its fields.
#[inline]
#[must_use]
pub fn make_tid(core: u64, num: u64, epoch: u64) -> Tid {
    debug_assert!(core <= CORE_MASK);
    debug_assert!(num <= NUM_MAX);
    debug_assert!(epoch < (1u64 << EPOCH_BITS));
    core | (num << NUM_SHIFT) | (epoch << EPOCH_SHIFT)
}

// ---------------------------------------------------------------------------
// Core-id assignment
// ---------------------------------------------------------------------------

static CORE_ID_FREELIST: Mutex<Vec<usize>> = Mutex::new(Vec::new());
static NEXT_CORE_ID: AtomicUsize = AtomicUsize::new(0);

struct CoreIdGuard(usize);

impl Drop for CoreIdGuard {
    fn drop(&mut self) {
        CORE_ID_FREELIST.lock().push(self.0);
    }
}

thread_local! {
    static CORE_ID: OnceCell<CoreIdGuard> = const { OnceCell::new() };
}

/// The calling thread's core id. Assigned on first use from a process-wide
/// recycler and returned when the thread exits.
#[must_use]
pub fn core_id() -> usize {
    CORE_ID.with(|slot| {
        slot.get_or_init(|| {
            let id = CORE_ID_FREELIST
                .lock()
                .pop()
                .unwrap_or_else(|| NEXT_CORE_ID.fetch_add(1, Ordering::Relaxed));
            assert!(
                id < NMAX_CORES,
                "core-id space exhausted: more than {NMAX_CORES} live threads"
            );
            CoreIdGuard(id)
        })
        .0
    })
}

// ---------------------------------------------------------------------------
// Per-core commit spinlock
// ---------------------------------------------------------------------------

/// Test-and-test-and-set spinlock guarding one core's commit-tid generation.
struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> SpinGuard<'_> {
        loop {
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
            if !self.locked.swap(true, Ordering::Acquire) {
                return SpinGuard { lock: self };
            }
        }
    }
}

struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Deferred per-epoch work
// ---------------------------------------------------------------------------

/// Resolution of one deferred work invocation.
pub(crate) enum WorkOutcome {
    Done,
    Reschedule { at_epoch: u64 },
}

type WorkFn = Box<dyn FnMut(u64, &Guard) -> WorkOutcome + Send>;

struct WorkRecord {
    target_epoch: u64,
    work: WorkFn,
}

struct CoreState {
    lock: SpinLock,
    last_commit_tid: AtomicU64,
    queue: Mutex<Vec<WorkRecord>>,
}

impl CoreState {
    fn new() -> Self {
        Self {
            lock: SpinLock::new(),
            last_commit_tid: AtomicU64::new(0),
            queue: Mutex::new(Vec::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// Epoch state and advance loop
// ---------------------------------------------------------------------------

/// Tunables for the epoch-advance thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochConfig {
    /// How long the advance thread waits for the prior epoch's transactions
    /// to resolve before publishing the consistent frontier.
    pub advance_interval: Duration,
}

impl Default for EpochConfig {
    fn default() -> Self {
        Self {
            advance_interval: Duration::from_millis(10),
        }
    }
}

struct EpochShared {
    current_epoch: CacheAligned<AtomicU64>,
    last_consistent_epoch: CacheAligned<AtomicU64>,
    cores: Box<[CacheAligned<CoreState>]>,
    shutdown: AtomicBool,
    config: EpochConfig,
}

impl EpochShared {
    fn current(&self) -> u64 {
        self.current_epoch.load(Ordering::SeqCst)
    }

    fn last_consistent(&self) -> u64 {
        self.last_consistent_epoch.load(Ordering::SeqCst)
    }

    fn queues_empty(&self) -> bool {
        self.cores.iter().all(|core| core.queue.lock().is_empty())
    }

    /// Run queued work whose target epoch has been reached.
    fn drain(&self, upto: u64) {
        let guard = epoch::pin();
        for core in self.cores.iter() {
            let mut due = Vec::new();
            {
                let mut queue = core.queue.lock();
                let mut i = 0;
                while i < queue.len() {
                    if queue[i].target_epoch <= upto {
                        due.push(queue.swap_remove(i));
                    } else {
                        i += 1;
                    }
                }
            }
            for mut record in due {
                match (record.work)(upto, &guard) {
                    WorkOutcome::Done => {}
                    WorkOutcome::Reschedule { at_epoch } => {
                        record.target_epoch = at_epoch;
                        core.queue.lock().push(record);
                    }
                }
            }
        }
        guard.flush();
    }

    /// One advance cycle: flip, wait, drain, publish.
    fn advance_once(&self) {
        let next = self.last_consistent() + 1;
        {
            let guards: Vec<SpinGuard<'_>> =
                self.cores.iter().map(|core| core.lock.lock()).collect();
            self.current_epoch.store(next, Ordering::SeqCst);
            drop(guards);
        }
        tracing::trace!(target: "occdb_mvcc::epoch", epoch = next, "epoch advanced");

        let mut waited = Duration::ZERO;
        let step = Duration::from_millis(1).min(self.config.advance_interval);
        while waited < self.config.advance_interval && !self.shutdown.load(Ordering::Acquire) {
            std::thread::sleep(step);
            waited += step;
        }

        self.drain(next);
        self.last_consistent_epoch.store(next, Ordering::SeqCst);
        tracing::trace!(
            target: "occdb_mvcc::epoch",
            epoch = next,
            "consistent frontier published"
        );
    }

    fn run(&self) {
        while !self.shutdown.load(Ordering::Acquire) {
            self.advance_once();
        }
        // Final drain: give rescheduling work a few chances, then drop it.
        for _ in 0..3 {
            if self.queues_empty() {
                break;
            }
            self.drain(u64::MAX);
        }
        for core in self.cores.iter() {
            core.queue.lock().clear();
        }
    }
}

/// P2: epoch/num/core commit timestamps with an advance thread.
pub struct EpochTidProtocol {
    shared: Arc<EpochShared>,
    advance_thread: Mutex<Option<JoinHandle<()>>>,
}

impl EpochTidProtocol {
    /// Start the protocol with default tunables.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EpochConfig::default())
    }

    /// Start the protocol; spawns the epoch-advance thread.
    #[must_use]
    pub fn with_config(config: EpochConfig) -> Self {
        let cores = (0..NMAX_CORES)
            .map(|_| CacheAligned::new(CoreState::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let shared = Arc::new(EpochShared {
            current_epoch: CacheAligned::new(AtomicU64::new(1)),
            last_consistent_epoch: CacheAligned::new(AtomicU64::new(1)),
            cores,
            shutdown: AtomicBool::new(false),
            config,
        });
        let loop_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("occdb-epoch".into())
            .spawn(move || loop_shared.run())
            .expect("failed to spawn epoch-advance thread");
        tracing::info!(
            target: "occdb_mvcc::epoch",
            interval_ms = config.advance_interval.as_millis() as u64,
            "epoch protocol started"
        );
        Self {
            shared,
            advance_thread: Mutex::new(Some(handle)),
        }
    }

    /// Epoch new transactions currently run in.
    #[must_use]
    pub fn current_epoch(&self) -> u64 {
        self.shared.current()
    }

    /// Most recent epoch whose snapshots are fully visible.
    #[must_use]
    pub fn last_consistent_epoch(&self) -> u64 {
        self.shared.last_consistent()
    }

    fn enqueue(&self, core: usize, record: WorkRecord) {
        self.shared.cores[core].queue.lock().push(record);
    }
}

impl Default for EpochTidProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitProtocol for EpochTidProtocol {
    fn name(&self) -> &'static str {
        "epoch-tid"
    }

    fn begin(&self) -> TxnSnapshot {
        TxnSnapshot {
            snapshot_tid: crate::cell::MAX_TID,
            has_consistent: false,
            epoch: self.shared.current(),
            core: core_id(),
        }
    }

    fn finish_snapshot(&self, _snap: &TxnSnapshot) {}

    fn consistent_snapshot_tid(&self, _snap: &TxnSnapshot) -> Option<Tid> {
        None
    }

    fn can_read_tid(&self, snap: &TxnSnapshot, t: Tid) -> bool {
        epoch_of(t) <= snap.epoch
    }

    fn can_overwrite_record_tid(&self, prev: Tid, cur: Tid) -> bool {
        debug_assert!(prev < cur);
        epoch_of(prev) == epoch_of(cur)
    }

    fn write_tid_visible(&self, snap: &TxnSnapshot, t: Tid) -> bool {
        epoch_of(t) <= snap.epoch
    }

    fn gen_commit_tid(&self, snap: &TxnSnapshot, max_write_tid: Tid, max_read_tid: Tid) -> Tid {
        let core = snap.core;
        let state = &self.shared.cores[core];
        let _guard = state.lock.lock();

        let epoch = self.shared.current();
        debug_assert!(epoch >= snap.epoch);
        let floor = state
            .last_commit_tid
            .load(Ordering::Relaxed)
            .max(max_write_tid)
            .max(max_read_tid);
        let num = num_of(floor) + 1;
        assert!(num <= NUM_MAX, "tid num field exhausted within an epoch");
        let tid = make_tid(core as u64, num, epoch);
        state.last_commit_tid.store(tid, Ordering::Relaxed);
        tid
    }

    fn on_spill(&self, guard: &Guard, head: &VersionCell) {
        let frontier = self.shared.last_consistent();
        // Keep the head through the newest version at or below the
        // consistent frontier; older versions are invisible to every
        // snapshot the protocol can still serve.
        let mut keep = head;
        while epoch_of(keep.tid()) > frontier {
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
            truncated,
            frontier,
            "epoch-frontier chain truncation"
        );
    }

    fn on_logical_delete(&self, index: &Arc<TxnIndex>, key: &[u8], slot: SlotRef, cell: CellPtr) {
        let c = unsafe { cell.as_ref() };
        debug_assert!(c.is_locked());
        if c.is_enqueued() {
            // A pending unlink already covers this tombstone; its version
            // check will re-arm against the newer write.
            return;
        }
        c.set_enqueued(true);

        // The committer's unlock bumps the counter once more; that is the
        // value an untouched tombstone will show when the callback runs.
        let mut expected_version = c.version_counter() + 1;
        let target_epoch = self.shared.current() + 1;
        let index = Arc::clone(index);
        let key = key.to_vec();
        tracing::trace!(
            target: "occdb_mvcc::epoch",
            key = ?key,
            target_epoch,
            "tombstone unlink scheduled"
        );

        let work: WorkFn = Box::new(move |current, guard| {
            // Liveness: the cell may only be dereferenced while it is still
            // installed as the head for `key`. The drain loop's epoch pin
            // precedes any unlink or displacement that could free it after
            // this check.
            let installed = index.raw().find(&key).is_some_and(|current_slot| {
                current_slot == slot && slot.head() == cell
            });
            if !installed {
                // Whoever replaced or unlinked the head reclaims it.
                return WorkOutcome::Done;
            }
            let c = unsafe { cell.as_ref() };
            if !c.try_lock() {
                return WorkOutcome::Reschedule {
                    at_epoch: current + 1,
                };
            }
            if slot.head() != cell {
                // Displaced between the check and the lock; the writer that
                // swapped the head reclaims it.
                c.unlock();
                return WorkOutcome::Done;
            }
            if !c.is_enqueued() || !c.is_latest() {
                c.unlock();
                return WorkOutcome::Done;
            }
            if c.size() != 0 {
                // Revived tombstone: cancel the removal.
                c.set_enqueued(false);
                c.unlock();
                return WorkOutcome::Done;
            }
            if c.version_counter() != expected_version {
                // The tombstone was re-written (still nil); re-arm one epoch
                // later against the new state.
                expected_version = c.version_counter() + 1;
                c.unlock();
                return WorkOutcome::Reschedule {
                    at_epoch: current + 1,
                };
            }
            if !index.raw().remove(&key, &slot) {
                c.set_enqueued(false);
                c.unlock();
                return WorkOutcome::Done;
            }
            // The whole chain is unreachable once the slot is gone.
            let mut older = c.next_ptr();
            c.set_enqueued(false);
            c.mark_deleting();
            c.unlock();
            unsafe { reclaim::defer_free(guard, cell) };
            while let Some(ptr) = std::ptr::NonNull::new(older) {
                let old_cell = CellPtr::new(ptr);
                older = unsafe { old_cell.as_ref() }.next_ptr();
                unsafe { reclaim::retire_cell(guard, old_cell) };
            }
            tracing::trace!(target: "occdb_mvcc::epoch", key = ?key, "tombstone unlinked");
            WorkOutcome::Done
        });

        self.enqueue(core_id(), WorkRecord { target_epoch, work });
    }

    fn on_tid_finish(&self, _commit_tid: Tid, _committed: bool) {}

    /// Block until the epoch observed at call time is closed and no longer
    /// current. Asserts the calling thread has no open transaction, since
    /// a transaction would deadlock the frontier it is waiting on.
    fn sync_epoch(&self) {
        assert_eq!(
            txn::active_txns_on_thread(),
            0,
            "wait_an_epoch inside an open transaction"
        );
        let observed = self.shared.current();
        while self.shared.last_consistent() < observed || self.shared.current() <= observed {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn finish_work(&self) {
        while !self.shared.queues_empty() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.advance_thread.lock().take() {
            let _ = handle.join();
        }
        tracing::info!(target: "occdb_mvcc::epoch", "epoch protocol stopped");
    }
}

impl Drop for EpochTidProtocol {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for EpochTidProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochTidProtocol")
            .field("current_epoch", &self.shared.current())
            .field("last_consistent_epoch", &self.shared.last_consistent())
            .finish_non_exhaustive()
    }
}

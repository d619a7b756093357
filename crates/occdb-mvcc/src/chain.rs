//! Chain slots: the index-resident anchor of a version chain.
//!
//! A slot holds the pointer to the chain head (the LATEST cell). Committers
//! swap the head when `write_record_at` returns a replacement; the swap
//! happens while the displaced head's lock is held, so a reader that finds a
//! stale head fails its version bracket and re-reads the slot.

use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::cell::{CellPtr, Tid, VersionCell};

/// Anchor for one key's version chain. The head pointer is never null.
pub struct ChainSlot {
    head: AtomicPtr<VersionCell>,
}

impl ChainSlot {
    #[must_use]
    pub(crate) fn new(head: CellPtr) -> Self {
        Self {
            head: AtomicPtr::new(head.as_ptr()),
        }
    }

    /// Current chain head.
    #[must_use]
    pub(crate) fn head(&self) -> CellPtr {
        let ptr = self.head.load(Ordering::Acquire);
        debug_assert!(!ptr.is_null());
        CellPtr::new(unsafe { std::ptr::NonNull::new_unchecked(ptr) })
    }

    /// Publish a replacement head. Caller holds the displaced head's lock.
    pub(crate) fn store_head(&self, head: CellPtr) {
        self.head.store(head.as_ptr(), Ordering::Release);
    }
}

impl std::fmt::Debug for ChainSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainSlot")
            .field("head", &self.head.load(Ordering::Relaxed))
            .finish()
    }
}

/// Shared handle to a slot, stored as the index's value type.
///
/// Equality is slot identity, which makes the index's guarded `remove`
/// reject a slot that was removed and re-created under the same key.
#[derive(Clone, Debug)]
pub struct SlotRef(Arc<ChainSlot>);

impl SlotRef {
    #[must_use]
    pub(crate) fn new_chain(head: CellPtr) -> Self {
        Self(Arc::new(ChainSlot::new(head)))
    }

    #[must_use]
    pub(crate) fn head(&self) -> CellPtr {
        self.0.head()
    }

    pub(crate) fn store_head(&self, head: CellPtr) {
        self.0.store_head(head);
    }
}

impl PartialEq for SlotRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for SlotRef {}

/// Walk a chain collecting each cell's tid, newest first.
///
/// Requires quiescence (exclusive access or the head lock); used by tests
/// and teardown, not by the concurrent paths.
#[must_use]
pub(crate) fn chain_tids(head: CellPtr) -> Vec<Tid> {
    let mut out = Vec::new();
    let mut cur = head.as_ptr();
    while let Some(ptr) = std::ptr::NonNull::new(cur) {
        let cell = unsafe { ptr.as_ref() };
        out.push(cell.tid());
        cur = cell.next_ptr();
    }
    out
}

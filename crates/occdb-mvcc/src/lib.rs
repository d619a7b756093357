//! In-memory multi-version optimistic concurrency control.
//!
//! The engine layers per-key version chains over an ordered index
//! ([`occdb_index::PagedIndex`]) and runs transactions with buffered write
//! sets, materialized read sets, and commit-time validation. Two commit
//! protocols are provided:
//!
//! - [`GlobalTidProtocol`] (P1): one global 64-bit commit counter; true
//!   snapshot reads; every write spills a chain entry, chains bounded by a
//!   length cap.
//! - [`EpochTidProtocol`] (P2): (epoch, num, core) commit tids; reads take
//!   the newest version no later than the transaction's epoch; in-place
//!   updates within an epoch; a background thread advances epochs and runs
//!   deferred tombstone unlinks.
//!
//! Reads are lock-free (seqlock-style version brackets on each cell);
//! commits take fine-grained per-cell spin locks in a deterministic global
//! order. Unlinked cells are reclaimed through `crossbeam-epoch` with a
//! deleter that asserts the release discipline.

pub mod cache_aligned;
pub mod cell;
pub mod chain;
pub mod context;
pub mod observability;
pub mod protocol;
pub mod proto_epoch;
pub mod proto_global;
pub mod reclaim;
pub mod txn;

pub use cell::{Tid, VersionCell, WriteOutcome, MAX_TID, MIN_TID};
pub use context::KeyRange;
pub use observability::{TxnMetrics, TxnMetricsSnapshot, GLOBAL_TXN_METRICS};
pub use protocol::{CommitProtocol, TxnSnapshot};
pub use proto_epoch::{EpochConfig, EpochTidProtocol, NMAX_CORES};
pub use proto_global::{GlobalTidProtocol, NMAX_CHAIN_LENGTH};
pub use reclaim::{quiescent, TxnGuard};
pub use txn::{
    Engine, Transaction, TxnIndex, TxnState, TXN_FLAG_LOW_LEVEL_SCAN, TXN_FLAG_READ_ONLY,
};

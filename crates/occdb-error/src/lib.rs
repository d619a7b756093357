//! Error taxonomy for the occdb transaction engine.
//!
//! Three kinds of failure, per the engine's recovery rules:
//!
//! - **Usage errors** ([`OccError::Unusable`], [`OccError::ReadOnly`]) are
//!   programmer bugs surfaced to the caller immediately.
//! - **Aborts** ([`OccError::Aborted`]) are recovered internally (the
//!   transaction rolls back cleanly) and reported with an [`AbortReason`].
//! - Invariant violations in reclamation callbacks are fatal assertions and
//!   never reach this enum.

use serde::Serialize;
use thiserror::Error;

/// Why a transaction aborted.
///
/// `User` is the only caller-initiated reason; the rest are commit-time
/// validation failures. Each reason has a global event counter in the
/// engine's observability module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AbortReason {
    /// Explicit `abort()` call, or drop of an unresolved transaction.
    User,
    /// A read could not be stabilized against a concurrently locked record.
    UnstableRead,
    /// A read observed a version from a timestamp the protocol forbids.
    FutureTidRead,
    /// A scanned leaf's version changed while installing this transaction's
    /// own writes.
    NodeScanWriteVersionChanged,
    /// A scanned leaf's version changed between scan and commit.
    NodeScanReadVersionChanged,
    /// A written record was concurrently committed by another transaction.
    WriteNodeInterference,
    /// A read record was overwritten or replaced before commit.
    ReadNodeInterference,
    /// A key materialized inside a range this transaction observed empty.
    ReadAbsenceInterference,
}

impl AbortReason {
    /// All reasons, in counter order.
    pub const ALL: [AbortReason; 8] = [
        AbortReason::User,
        AbortReason::UnstableRead,
        AbortReason::FutureTidRead,
        AbortReason::NodeScanWriteVersionChanged,
        AbortReason::NodeScanReadVersionChanged,
        AbortReason::WriteNodeInterference,
        AbortReason::ReadNodeInterference,
        AbortReason::ReadAbsenceInterference,
    ];

    /// Stable snake_case name, used in logs and metrics snapshots.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::UnstableRead => "unstable_read",
            Self::FutureTidRead => "future_tid_read",
            Self::NodeScanWriteVersionChanged => "node_scan_write_version_changed",
            Self::NodeScanReadVersionChanged => "node_scan_read_version_changed",
            Self::WriteNodeInterference => "write_node_interference",
            Self::ReadNodeInterference => "read_node_interference",
            Self::ReadAbsenceInterference => "read_absence_interference",
        }
    }

    /// Dense index for counter arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::User => 0,
            Self::UnstableRead => 1,
            Self::FutureTidRead => 2,
            Self::NodeScanWriteVersionChanged => 3,
            Self::NodeScanReadVersionChanged => 4,
            Self::WriteNodeInterference => 5,
            Self::ReadNodeInterference => 6,
            Self::ReadAbsenceInterference => 7,
        }
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary error type for occdb operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccError {
    /// The transaction has already resolved (committed or aborted).
    #[error("transaction is unusable in state {state}")]
    Unusable {
        /// State the transaction was found in.
        state: &'static str,
    },

    /// A write was attempted on a transaction begun with the read-only flag.
    #[error("write attempted on read-only transaction")]
    ReadOnly,

    /// The transaction aborted; commit was asked to signal instead of
    /// returning `false`.
    #[error("transaction aborted: {reason}")]
    Aborted {
        /// Validation (or user) reason for the abort.
        reason: AbortReason,
    },
}

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, OccError>;

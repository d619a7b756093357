//! Engine event counters.
//!
//! Global lock-free counters, `Relaxed` ordering (a reader can lag but a
//! count is never torn). One counter per abort reason, plus tombstone-read
//! events split by point lookup vs. scan.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use occdb_error::AbortReason;

/// Global transaction metrics singleton.
pub static GLOBAL_TXN_METRICS: TxnMetrics = TxnMetrics::new();

/// Atomic counters for transaction lifecycle telemetry.
pub struct TxnMetrics {
    commits_total: AtomicU64,
    aborts: [AtomicU64; AbortReason::ALL.len()],
    /// Point lookups that landed on a logically deleted record.
    read_tombstone_point_total: AtomicU64,
    /// Scan hits that landed on a logically deleted record.
    read_tombstone_scan_total: AtomicU64,
}

impl TxnMetrics {
    /// Create a metrics instance with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            commits_total: ZERO,
            aborts: [ZERO; AbortReason::ALL.len()],
            read_tombstone_point_total: ZERO,
            read_tombstone_scan_total: ZERO,
        }
    }

    /// Record a successful commit.
    pub fn record_commit(&self) {
        self.commits_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an abort with its reason.
    pub fn record_abort(&self, reason: AbortReason) {
        self.aborts[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a point read that found a tombstone.
    pub fn record_tombstone_point_read(&self) {
        self.read_tombstone_point_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a scan read that found a tombstone.
    pub fn record_tombstone_scan_read(&self) {
        self.read_tombstone_scan_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count for one abort reason.
    #[must_use]
    pub fn abort_count(&self, reason: AbortReason) -> u64 {
        self.aborts[reason.index()].load(Ordering::Relaxed)
    }

    /// Read a point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> TxnMetricsSnapshot {
        let mut aborts = [0u64; AbortReason::ALL.len()];
        for reason in AbortReason::ALL {
            aborts[reason.index()] = self.abort_count(reason);
        }
        TxnMetricsSnapshot {
            commits_total: self.commits_total.load(Ordering::Relaxed),
            aborts_user_total: aborts[AbortReason::User.index()],
            aborts_unstable_read_total: aborts[AbortReason::UnstableRead.index()],
            aborts_future_tid_read_total: aborts[AbortReason::FutureTidRead.index()],
            aborts_node_scan_write_version_changed_total: aborts
                [AbortReason::NodeScanWriteVersionChanged.index()],
            aborts_node_scan_read_version_changed_total: aborts
                [AbortReason::NodeScanReadVersionChanged.index()],
            aborts_write_node_interference_total: aborts
                [AbortReason::WriteNodeInterference.index()],
            aborts_read_node_interference_total: aborts[AbortReason::ReadNodeInterference.index()],
            aborts_read_absence_interference_total: aborts
                [AbortReason::ReadAbsenceInterference.index()],
            read_tombstone_point_total: self.read_tombstone_point_total.load(Ordering::Relaxed),
            read_tombstone_scan_total: self.read_tombstone_scan_total.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero (tests/diagnostics).
    pub fn reset(&self) {
        self.commits_total.store(0, Ordering::Relaxed);
        for counter in &self.aborts {
            counter.store(0, Ordering::Relaxed);
        }
        self.read_tombstone_point_total.store(0, Ordering::Relaxed);
        self.read_tombstone_scan_total.store(0, Ordering::Relaxed);
    }
}

impl Default for TxnMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable snapshot of [`TxnMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TxnMetricsSnapshot {
    pub commits_total: u64,
    pub aborts_user_total: u64,
    pub aborts_unstable_read_total: u64,
    pub aborts_future_tid_read_total: u64,
    pub aborts_node_scan_write_version_changed_total: u64,
    pub aborts_node_scan_read_version_changed_total: u64,
    pub aborts_write_node_interference_total: u64,
    pub aborts_read_node_interference_total: u64,
    pub aborts_read_absence_interference_total: u64,
    pub read_tombstone_point_total: u64,
    pub read_tombstone_scan_total: u64,
}

impl TxnMetricsSnapshot {
    /// Sum across all abort reasons.
    #[must_use]
    pub fn aborts_total(&self) -> u64 {
        self.aborts_user_total
            + self.aborts_unstable_read_total
            + self.aborts_future_tid_read_total
            + self.aborts_node_scan_write_version_changed_total
            + self.aborts_node_scan_read_version_changed_total
            + self.aborts_write_node_interference_total
            + self.aborts_read_node_interference_total
            + self.aborts_read_absence_interference_total
    }
}

impl std::fmt::Display for TxnMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "txn(commits={} aborts={} tombstone_point={} tombstone_scan={})",
            self.commits_total,
            self.aborts_total(),
            self.read_tombstone_point_total,
            self.read_tombstone_scan_total,
        )
    }
}

//! occdb: an in-memory, multi-version, optimistic concurrency control
//! transaction engine.
//!
//! Transactions buffer writes, materialize reads, and validate at commit
//! against per-record version counters; phantom protection comes from either
//! scanned-leaf version tracking or absent-range re-checks. Commit
//! timestamps are produced by one of two protocols: a global counter
//! ([`Engine::with_global_tids`]) or epoch-partitioned per-core tids with
//! asynchronous garbage collection ([`Engine::with_epoch_tids`]).
//!
//! ```
//! use occdb::Engine;
//!
//! let engine = Engine::with_epoch_tids();
//! let index = engine.create_index("kv");
//!
//! let mut txn = engine.begin(0);
//! txn.put(&index, b"a", b"1")?;
//! assert!(txn.commit()?);
//!
//! let mut txn = engine.begin(0);
//! assert_eq!(txn.get(&index, b"a")?, Some(b"1".to_vec()));
//! # Ok::<(), occdb::OccError>(())
//! ```

pub use occdb_error::{AbortReason, OccError, Result};
pub use occdb_index::{InsertOutcome, LeafId, PagedIndex, ScanEvent};
pub use occdb_mvcc::{
    CommitProtocol, Engine, EpochConfig, EpochTidProtocol, GlobalTidProtocol, KeyRange, Tid,
    Transaction, TxnIndex, TxnMetricsSnapshot, TxnState, GLOBAL_TXN_METRICS, MAX_TID, MIN_TID,
    NMAX_CHAIN_LENGTH, NMAX_CORES, TXN_FLAG_LOW_LEVEL_SCAN, TXN_FLAG_READ_ONLY,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::Duration;

    fn init_tracing() {
        use tracing_subscriber::EnvFilter;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// §: begin; put; commit; a later transaction reads the value.
    #[test]
    fn solo_commit() {
        init_tracing();
        let engine = Engine::with_epoch_config(EpochConfig {
            advance_interval: Duration::from_millis(5),
        });
        let index = engine.create_index("kv");

        let mut txn = engine.begin(0);
        txn.put(&index, b"a", b"1").unwrap();
        assert!(txn.commit().unwrap());

        let mut txn = engine.begin(0);
        assert_eq!(txn.get(&index, b"a").unwrap(), Some(b"1".to_vec()));
    }

    /// A write on a read-only transaction raises and aborts.
    #[test]
    fn read_only_guard() {
        init_tracing();
        let engine = Engine::with_global_tids();
        let index = engine.create_index("kv");
        let mut txn = engine.begin(TXN_FLAG_READ_ONLY);
        assert!(matches!(
            txn.put(&index, b"a", b"x"),
            Err(OccError::ReadOnly)
        ));
        assert_eq!(txn.state(), TxnState::Aborted);
    }

    /// Two overlapping writers of one key: exactly one commits.
    #[test]
    fn write_write_conflict() {
        init_tracing();
        let engine = Engine::with_global_tids();
        let index = engine.create_index("kv");

        let mut t1 = engine.begin(0);
        let mut t2 = engine.begin(0);
        t1.put(&index, b"k", b"1").unwrap();
        t2.put(&index, b"k", b"2").unwrap();
        assert!(t1.commit().unwrap());
        assert!(!t2.commit().unwrap());
        assert_eq!(
            t2.last_abort_reason(),
            Some(AbortReason::WriteNodeInterference)
        );
    }

    /// Phantom avoidance in both scan modes.
    #[test]
    fn phantom_avoidance() {
        init_tracing();
        for (flags, expected) in [
            (
                TXN_FLAG_LOW_LEVEL_SCAN,
                AbortReason::NodeScanWriteVersionChanged,
            ),
            (0, AbortReason::ReadAbsenceInterference),
        ] {
            let engine = Engine::with_global_tids();
            let index = engine.create_index("kv");

            let mut t1 = engine.begin(flags);
            let mut count = 0;
            t1.scan(&index, b"a", Some(b"z"), |_, _| {
                count += 1;
                true
            })
            .unwrap();
            assert_eq!(count, 0);

            let mut t2 = engine.begin(0);
            t2.put(&index, b"m", b"v").unwrap();
            assert!(t2.commit().unwrap());

            t1.put(&index, b"x", b"v").unwrap();
            assert!(!t1.commit().unwrap());
            assert_eq!(t1.last_abort_reason(), Some(expected));
        }
    }

    /// Round-trip laws from the engine contract.
    #[test]
    fn roundtrip_laws() {
        init_tracing();
        let engine = Engine::with_global_tids();
        let index = engine.create_index("kv");

        let mut txn = engine.begin(0);
        txn.put(&index, b"k", b"v").unwrap();
        assert!(txn.commit().unwrap());
        let mut txn = engine.begin(0);
        assert_eq!(txn.get(&index, b"k").unwrap(), Some(b"v".to_vec()));
        assert!(txn.commit().unwrap());

        let mut txn = engine.begin(0);
        txn.delete(&index, b"k").unwrap();
        assert!(txn.commit().unwrap());
        let mut txn = engine.begin(0);
        assert_eq!(txn.get(&index, b"k").unwrap(), None);
        assert!(txn.commit().unwrap());

        let mut txn = engine.begin(0);
        txn.put(&index, b"k", b"ghost").unwrap();
        txn.abort();
        let mut txn = engine.begin(0);
        assert_eq!(txn.get(&index, b"k").unwrap(), None);
    }

    /// Scans honor half-open `[lo, hi)` boundaries.
    #[test]
    fn scan_boundaries() {
        init_tracing();
        let engine = Engine::with_global_tids();
        let index = engine.create_index("kv");

        let mut setup = engine.begin(0);
        for key in [b"a".as_slice(), b"b", b"d"] {
            setup.put(&index, key, key).unwrap();
        }
        assert!(setup.commit().unwrap());

        let mut txn = engine.begin(0);
        let mut keys = Vec::new();
        txn.scan(&index, b"a", Some(b"d"), |k, _| {
            keys.push(k.to_vec());
            true
        })
        .unwrap();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    /// Concurrent transactions stay serializable across threads.
    #[test]
    fn concurrent_disjoint_writers_all_commit() {
        init_tracing();
        let engine = Engine::with_epoch_config(EpochConfig {
            advance_interval: Duration::from_millis(5),
        });
        let index = engine.create_index("kv");
        let barrier = Barrier::new(4);

        std::thread::scope(|scope| {
            for t in 0..4u8 {
                let engine = &engine;
                let index = &index;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    for i in 0..16u8 {
                        let mut txn = engine.begin(0);
                        txn.put(index, &[t, i], &[i]).unwrap();
                        assert!(txn.commit().unwrap());
                    }
                });
            }
        });

        let mut txn = engine.begin(0);
        let mut count = 0;
        txn.scan(&index, &[], None, |_, _| {
            count += 1;
            true
        })
        .unwrap();
        assert_eq!(count, 64);
    }

    /// Abort-reason counters are observable and serializable.
    #[test]
    fn abort_counters_are_observable() {
        init_tracing();
        let before = GLOBAL_TXN_METRICS.snapshot();

        let engine = Engine::with_global_tids();
        let index = engine.create_index("kv");
        let mut t1 = engine.begin(0);
        let mut t2 = engine.begin(0);
        t1.put(&index, b"k", b"1").unwrap();
        t2.put(&index, b"k", b"2").unwrap();
        assert!(t1.commit().unwrap());
        assert!(!t2.commit().unwrap());
        t2.dump_debug();

        let after = GLOBAL_TXN_METRICS.snapshot();
        assert!(after.commits_total > before.commits_total);
        assert!(
            after.aborts_write_node_interference_total
                > before.aborts_write_node_interference_total
        );

        let json = serde_json::to_string(&after).unwrap();
        assert!(json.contains("aborts_write_node_interference_total"));
    }
}

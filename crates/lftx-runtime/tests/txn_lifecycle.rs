// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

//! Runtime-level transaction lifecycle tests against bare versioned cells.

use claims::{assert_err, assert_ok};
use lftx_runtime::{
    Abort, CountingFlush, OpLifecycle, Runtime, RuntimeConfig, SlabHeap, VersionedCell,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn quiet_runtime(threads: usize) -> Runtime {
    // Long epoch so the advancer never interferes; tests drive epochs by
    // hand where they need them.
    Runtime::new(
        RuntimeConfig::new(threads)
            .with_epoch_length(1, lftx_runtime::EpochLengthUnit::Second),
    )
}

#[test]
fn commit_publishes_all_writes() {
    let runtime = quiet_runtime(1);
    let handle = runtime.register_thread();
    let a = VersionedCell::new(1u64);
    let b = VersionedCell::new(2u64);

    handle.tx_begin();
    assert_ok!(a.tx_compare_exchange(&handle, 1, 10, true, true));
    assert_ok!(b.tx_compare_exchange(&handle, 2, 20, true, true));
    assert_ok!(handle.tx_end());

    assert_eq!(a.load(&handle), 10);
    assert_eq!(b.load(&handle), 20);
}

#[test]
fn explicit_abort_reverts_everything() {
    let runtime = quiet_runtime(1);
    let handle = runtime.register_thread();
    let a = VersionedCell::new(1u64);
    let b = VersionedCell::new(2u64);

    handle.tx_begin();
    assert_ok!(a.tx_compare_exchange(&handle, 1, 10, true, true));
    assert_ok!(b.tx_compare_exchange(&handle, 2, 20, true, true));
    assert_eq!(handle.tx_abort(), Abort::BeforeCommit);

    assert_eq!(a.load(&handle), 1);
    assert_eq!(b.load(&handle), 2);
    assert!(!handle.is_inside_txn());
}

#[test]
fn conflicting_writer_aborts_commit() {
    let runtime = quiet_runtime(2);
    let reader = runtime.register_thread();
    let writer = runtime.register_thread();
    let k1 = VersionedCell::new(1u64);
    let k2 = VersionedCell::new(2u64);

    reader.tx_begin();
    let observed = k1.tx_load(&reader);
    assert_ok!(reader.record_read(&k1, observed));
    // A concurrent commit to k1 invalidates the read set.
    assert!(k1.cas(&writer, 1, 99));
    assert_ok!(k2.tx_compare_exchange(&reader, 2, 20, true, true));
    assert_err!(reader.tx_end());

    assert_eq!(k1.load(&writer), 99);
    assert_eq!(k2.load(&writer), 2);
}

#[test]
fn read_only_txn_validates_without_epoch() {
    let runtime = quiet_runtime(2);
    let reader = runtime.register_thread();
    let writer = runtime.register_thread();
    let cell = VersionedCell::new(7u64);

    // Clean read-only commit.
    reader.tx_begin();
    let observed = cell.tx_load(&reader);
    assert_ok!(reader.record_read(&cell, observed));
    assert_ok!(reader.tx_end());

    // Invalidated read-only commit.
    reader.tx_begin();
    let observed = cell.tx_load(&reader);
    assert_ok!(reader.record_read(&cell, observed));
    assert!(cell.cas(&writer, 7, 8));
    assert_eq!(reader.tx_end(), Err(Abort::DuringCommit));
}

#[test]
fn transaction_helper_retries_until_commit() {
    let runtime = quiet_runtime(1);
    let handle = runtime.register_thread();
    let cell = VersionedCell::new(0u64);

    for _ in 0..10 {
        handle.transaction(|h| {
            let v = cell.tx_load(h);
            h.record_read(&cell, v)?;
            cell.tx_compare_exchange(h, v, v + 1, true, true)?;
            Ok(())
        });
    }
    assert_eq!(cell.load(&handle), 10);
}

#[test]
fn undo_and_unlock_ordering() {
    let runtime = quiet_runtime(1);
    let handle = runtime.register_thread();
    let cell = VersionedCell::new(0u64);
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

    // Committed transaction: unlocks and cleanups run, undos don't.
    handle.tx_begin();
    for tag in ["unlock-a", "unlock-b"] {
        let log = Arc::clone(&log);
        handle.add_unlock(move |_| log.lock().push(tag));
    }
    {
        let log = Arc::clone(&log);
        handle.add_undo(move |_| log.lock().push("undo"));
    }
    {
        let log = Arc::clone(&log);
        handle.add_cleanup(move |_| log.lock().push("cleanup"));
    }
    assert_ok!(cell.tx_compare_exchange(&handle, 0, 1, true, true));
    assert_ok!(handle.tx_end());
    // Unlocks are LIFO; cleanups run after.
    assert_eq!(*log.lock(), vec!["unlock-b", "unlock-a", "cleanup"]);

    // Aborted transaction: undos (LIFO) then unlocks, no cleanups.
    log.lock().clear();
    handle.tx_begin();
    for tag in ["undo-1", "undo-2"] {
        let log = Arc::clone(&log);
        handle.add_undo(move |_| log.lock().push(tag));
    }
    {
        let log = Arc::clone(&log);
        handle.add_unlock(move |_| log.lock().push("unlock"));
    }
    {
        let log = Arc::clone(&log);
        handle.add_cleanup(move |_| log.lock().push("cleanup"));
    }
    assert_ok!(cell.tx_compare_exchange(&handle, 1, 2, true, true));
    assert_eq!(handle.tx_abort(), Abort::BeforeCommit);
    assert_eq!(*log.lock(), vec!["undo-2", "undo-1", "unlock"]);
    assert_eq!(cell.load(&handle), 1);
}

/// Concurrent transactional increments of a shared pair of cells through
/// full runtime handles: both cells advance in lock step.
#[test]
fn concurrent_transactions_keep_cells_in_lock_step() {
    const PER_THREAD: u64 = 300;
    let workers = num_cpus::get().clamp(2, 4);
    let runtime = Arc::new(quiet_runtime(workers + 1));
    let a = Arc::new(VersionedCell::new(0u64));
    let b = Arc::new(VersionedCell::new(0u64));

    let threads: Vec<_> = (0..workers)
        .map(|_| {
            let runtime = Arc::clone(&runtime);
            let a = Arc::clone(&a);
            let b = Arc::clone(&b);
            std::thread::spawn(move || {
                let handle = runtime.register_thread();
                for _ in 0..PER_THREAD {
                    handle.transaction(|h| {
                        let va = a.tx_load(h);
                        h.record_read(&a, va)?;
                        // Mid-transaction reads may be mutually
                        // inconsistent; commit validation sorts them out.
                        let vb = b.tx_load(h);
                        h.record_read(&b, vb)?;
                        if !a.tx_compare_exchange(h, va, va + 1, true, false)?.succeeded() {
                            return Err(h.tx_abort());
                        }
                        if !b.tx_compare_exchange(h, vb, vb + 1, false, true)?.succeeded() {
                            return Err(h.tx_abort());
                        }
                        Ok(())
                    });
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let handle = runtime.register_thread();
    let total = workers as u64 * PER_THREAD;
    assert_eq!(a.load(&handle), total);
    assert_eq!(b.load(&handle), total);
}

#[test]
#[should_panic(expected = "nested transactions are not supported")]
fn nested_tx_begin_panics() {
    let runtime = quiet_runtime(1);
    let handle = runtime.register_thread();
    handle.tx_begin();
    handle.tx_begin();
}

#[test]
fn buffered_persistence_reaches_the_flush_capability() {
    let flush = Arc::new(CountingFlush::default());
    let config = RuntimeConfig::new(1)
        .with_epoch_length(1, lftx_runtime::EpochLengthUnit::Second)
        .with_buffer_size(4);
    let runtime = Runtime::with_flush(config, flush.clone());
    let handle = runtime.register_thread();
    let heap = SlabHeap::<u64>::open("flush_test_heap");

    let cell = VersionedCell::new(0u64);
    handle.tx_begin();
    let _block = handle.alloc_payload(&heap, 42);
    assert_ok!(cell.tx_compare_exchange(&handle, 0, 1, true, true));
    assert_ok!(handle.tx_end());

    // Drain the epoch holding the allocation, then rendezvous with the
    // advancer.
    runtime.advance_epoch();
    runtime.advance_epoch();
    handle.sync();
    assert!(flush.flushes.load(Ordering::Relaxed) > 0);
    assert!(flush.fences.load(Ordering::Relaxed) > 0);
    drop(runtime);
    SlabHeap::<u64>::destroy("flush_test_heap");
}

#[test]
fn payload_lifecycle_with_deferred_reclamation() {
    let runtime = quiet_runtime(1);
    let handle = runtime.register_thread();
    let heap = SlabHeap::<u64>::open("payload_lifecycle_heap");

    // Allocate and publish inside a committed transaction.
    let cell = VersionedCell::new(0u64);
    handle.tx_begin();
    let block = handle.alloc_payload(&heap, 7);
    assert_ok!(cell.tx_compare_exchange(&handle, 0, block.raw().addr() as u64, true, true));
    assert_ok!(handle.tx_end());
    assert_eq!(heap.live_blocks(), 1);
    assert_eq!(*heap.payload_of(block), 7);

    // Retire it in a later operation and let the epochs pass.
    handle.tx_begin();
    assert_ok!(cell.tx_compare_exchange(&handle, block.raw().addr() as u64, 0, true, true));
    assert_ok!(handle.retire_payload(&heap, block));
    assert_ok!(handle.tx_end());
    handle.reclaim_payload(&heap, block);

    for _ in 0..4 {
        runtime.advance_epoch();
    }
    // The next writing transaction's housekeeping drains this thread's
    // deferred-free buckets.
    handle.tx_begin();
    assert_ok!(cell.tx_compare_exchange(&handle, 0, 1, true, true));
    assert_ok!(handle.tx_end());
    assert_eq!(heap.live_blocks(), 0);
    drop(runtime);
    SlabHeap::<u64>::destroy("payload_lifecycle_heap");
}

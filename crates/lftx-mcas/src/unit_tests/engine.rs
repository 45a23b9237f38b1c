// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

//! Cross-thread engine tests: helpers finishing a suspended owner's
//! transaction, help idempotence, and a contended counter workload.

use super::{test_fixture, TestHost};
use crate::{Abort, CasOutcome, OpLifecycle, VersionedCell, TAG_VALUE};
use claims::assert_ok;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

/// A reader that finds an installed descriptor whose owner never reaches
/// tx_end must resolve it: the in-prep instance is aborted, the cell rolls
/// back, and no descriptor pointer remains visible.
#[test]
fn helper_aborts_suspended_in_prep_owner() {
    let (pool, clock) = test_fixture(2);
    let owner = TestHost::new(pool.clone(), clock.clone(), 0);
    let reader = TestHost::new(pool, clock, 1);
    let cell = VersionedCell::new(41u64);

    owner.enter_txn();
    assert_eq!(
        assert_ok!(cell.tx_compare_exchange(&owner, 41, 42, true, true)),
        CasOutcome::Speculative
    );
    assert!(cell.plain_load().is_descriptor());

    // The owner is "suspended" here: the reader must not observe the
    // descriptor nor block on it.
    assert_eq!(cell.load(&reader), 41);
    assert_eq!(cell.plain_load().tag(), TAG_VALUE);
    assert!(owner.session().descriptor().status().load().is_aborted());
}

/// Once the owner has moved its descriptor to in-progress with consistent
/// reads, any helper drives it to committed and the new values appear.
#[test]
fn helper_commits_in_progress_owner() {
    let (pool, clock) = test_fixture(2);
    let owner = TestHost::new(pool.clone(), clock.clone(), 0);
    let reader = TestHost::new(pool, clock.clone(), 1);
    let cell_a = VersionedCell::new(1u64);
    let cell_b = VersionedCell::new(2u64);

    owner.enter_txn();
    assert_eq!(
        assert_ok!(cell_a.tx_compare_exchange(&owner, 1, 10, true, true)),
        CasOutcome::Speculative
    );
    assert_eq!(
        assert_ok!(cell_b.tx_compare_exchange(&owner, 2, 20, true, true)),
        CasOutcome::Speculative
    );
    let desc = owner.session().descriptor();
    desc.set_epoch(clock.read());
    let observed = desc.status().load();
    assert!(desc.status().set_ready(observed));

    // Reader helps through either cell; both must land on the new values.
    assert_eq!(cell_b.load(&reader), 20);
    assert_eq!(cell_a.load(&reader), 10);
    assert!(desc.status().load().is_committed());

    // The owner's own uninstall after the fact is a no-op.
    desc.owner_uninstall();
    assert_eq!(cell_a.plain_load().val, 10);
    assert_eq!(cell_b.plain_load().val, 20);
}

/// Two helpers racing on the same installed descriptor agree on one
/// terminal state and leave the cells identical.
#[test]
fn help_is_idempotent() {
    let (pool, clock) = test_fixture(3);
    let owner = TestHost::new(pool.clone(), clock.clone(), 0);
    let cell = Arc::new(VersionedCell::new(5u64));

    owner.enter_txn();
    assert_eq!(
        assert_ok!(cell.tx_compare_exchange(&owner, 5, 6, true, true)),
        CasOutcome::Speculative
    );
    let desc = owner.session().descriptor();
    desc.set_epoch(clock.read());
    let observed = desc.status().load();
    assert!(desc.status().set_ready(observed));

    let barrier = Arc::new(Barrier::new(2));
    let results: Vec<u64> = [1usize, 2]
        .iter()
        .map(|&tid| {
            let pool = pool.clone();
            let clock = clock.clone();
            let cell = Arc::clone(&cell);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let helper = TestHost::new(pool, clock, tid);
                barrier.wait();
                cell.load(&helper)
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect();

    assert_eq!(results, vec![6, 6]);
    assert!(desc.status().load().is_committed());
    assert_eq!(cell.plain_load().tag(), TAG_VALUE);
}

/// Contended single-cell CAS: every successful update advances the counter
/// by exactly 4 and no update is lost.
#[test]
fn contended_cas_counter() {
    const PER_THREAD: u64 = 2_000;
    let threads = num_cpus::get().clamp(2, 8) as u64;
    let (pool, clock) = test_fixture(threads as usize);
    let cell = Arc::new(VersionedCell::new(0u64));
    let start = Arc::new(Barrier::new(threads as usize));

    let handles: Vec<_> = (0..threads)
        .map(|tid| {
            let pool = pool.clone();
            let clock = clock.clone();
            let cell = Arc::clone(&cell);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                let host = TestHost::new(pool, clock, tid as usize);
                start.wait();
                for _ in 0..PER_THREAD {
                    loop {
                        let current = cell.load(&host);
                        if cell.cas(&host, current, current + 1) {
                            break;
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let finished = cell.plain_load();
    assert_eq!(finished.val, threads * PER_THREAD);
    assert_eq!(finished.cnt, threads * PER_THREAD * 4);
}

/// Transactional transfers between two cells from competing threads: the
/// sum is preserved and only complete transfers are ever visible.
#[test]
fn concurrent_transactional_transfers() {
    const PER_THREAD: u64 = 200;
    let threads = num_cpus::get().clamp(2, 4);
    let (pool, clock) = test_fixture(threads);
    let cell_a = Arc::new(VersionedCell::new(1_000u64));
    let cell_b = Arc::new(VersionedCell::new(1_000u64));
    let committed = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..threads)
        .map(|tid| {
            let pool = pool.clone();
            let clock = clock.clone();
            let cell_a = Arc::clone(&cell_a);
            let cell_b = Arc::clone(&cell_b);
            let committed = Arc::clone(&committed);
            thread::spawn(move || {
                let host = TestHost::new(pool, clock, tid);
                let mut done = 0;
                while done < PER_THREAD {
                    host.enter_txn();
                    let attempt: Result<bool, Abort> = (|| {
                        let a = cell_a.tx_load(&host);
                        host.record_read(&cell_a, a)?;
                        if a == 0 {
                            return Ok(false);
                        }
                        let b = cell_b.tx_load(&host);
                        host.record_read(&cell_b, b)?;
                        if !cell_a
                            .tx_compare_exchange(&host, a, a - 1, true, false)?
                            .succeeded()
                        {
                            return Ok(false);
                        }
                        if !cell_b
                            .tx_compare_exchange(&host, b, b + 1, false, true)?
                            .succeeded()
                        {
                            return Ok(false);
                        }
                        Ok(true)
                    })();
                    match attempt {
                        Ok(true) => {
                            if host.finish_txn().is_ok() {
                                committed.fetch_add(1, Ordering::Relaxed);
                                done += 1;
                            }
                        },
                        Ok(false) => {
                            // A CAS lost its race; drop the partial write
                            // set instead of committing half a transfer.
                            let _ = host.rollback_txn();
                        },
                        Err(_) => {
                            // rollback already ran inside the engine
                        },
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let a = cell_a.plain_load();
    let b = cell_b.plain_load();
    assert_eq!(a.tag(), TAG_VALUE);
    assert_eq!(b.tag(), TAG_VALUE);
    assert_eq!(a.val + b.val, 2_000);
    assert_eq!(
        1_000 - a.val,
        committed.load(Ordering::Relaxed),
        "every committed transfer moved exactly one unit"
    );
}

/// try_abort only fires on a matching epoch and a non-terminal state.
#[test]
fn try_abort_respects_epoch() {
    let (pool, clock) = test_fixture(1);
    let owner = TestHost::new(pool, clock.clone(), 0);
    let desc = owner.session().descriptor();

    owner.enter_txn();
    desc.set_epoch(clock.read());
    desc.try_abort(clock.read() + 1);
    assert!(!desc.status().load().is_aborted());
    desc.try_abort(clock.read());
    assert!(desc.status().load().is_aborted());

    // Terminal state: no further effect.
    let terminal = desc.status().load();
    desc.try_abort(clock.read());
    assert_eq!(desc.status().load(), terminal);
}

// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{
    Abort, Annotated, CasOutcome, Descriptor, DescriptorPool, EpochClock, OpLifecycle, SlabMap,
    StatusWord, TxSession, TxState, VersionedCell, INIT_EPOCH, NULL_EPOCH, TAG_DESCRIPTOR,
    TAG_VALUE,
};
use claims::{assert_none, assert_ok, assert_some_eq};
use proptest::prelude::*;
use std::sync::Arc;

mod engine;
mod slab;

/// Minimal operation lifecycle for exercising the engine without the
/// runtime: begin/end only manage the epoch and descriptor reinit.
pub(crate) struct TestHost {
    session: TxSession,
}

impl TestHost {
    pub(crate) fn new(pool: Arc<DescriptorPool>, clock: Arc<EpochClock>, tid: usize) -> Self {
        TestHost {
            session: TxSession::new(pool, clock, tid),
        }
    }

    pub(crate) fn enter_txn(&self) {
        self.session.set_inside_txn(true);
        self.session.reset_rolling_cas();
        self.session.clear_pending_reads();
        self.session.descriptor().reinit();
    }

    /// Drive the in-flight transaction to its terminal state the way
    /// tx_end would, without any epoch-system bookkeeping.
    pub(crate) fn finish_txn(&self) -> Result<(), Abort> {
        let session = &self.session;
        let desc = session.descriptor();
        if desc.write_set_is_empty() {
            session.set_inside_txn(false);
            if desc.owner_validate_reads() {
                return Ok(());
            }
            return Err(Abort::DuringCommit);
        }
        let e = session.clock().read();
        desc.set_epoch(e);
        session.set_op_epoch(e);
        let observed = desc.status().load();
        if !desc.status().set_ready(observed) {
            session.set_inside_txn(false);
            session.set_op_epoch(NULL_EPOCH);
            desc.owner_uninstall();
            return Err(Abort::DuringCommit);
        }
        desc.owner_try_complete(session.clock());
        session.set_inside_txn(false);
        session.set_op_epoch(NULL_EPOCH);
        if desc.status().load().is_committed() {
            Ok(())
        } else {
            Err(Abort::DuringCommit)
        }
    }
}

impl OpLifecycle for TestHost {
    fn session(&self) -> &TxSession {
        &self.session
    }

    fn begin_op(&self) {
        let session = &self.session;
        session.descriptor().reinit();
        let e = session.clock().read();
        session.descriptor().set_epoch(e);
        session.set_op_epoch(e);
    }

    fn end_op(&self) {
        self.session.set_op_epoch(NULL_EPOCH);
    }

    fn abort_op(&self) {
        self.session.set_op_epoch(NULL_EPOCH);
    }

    fn rollback_txn(&self) -> Abort {
        let session = &self.session;
        let desc = session.descriptor();
        let observed = desc.status().load();
        desc.status().abort(observed);
        desc.owner_uninstall();
        session.set_inside_txn(false);
        session.set_op_epoch(NULL_EPOCH);
        Abort::BeforeCommit
    }
}

pub(crate) fn test_fixture(threads: usize) -> (Arc<DescriptorPool>, Arc<EpochClock>) {
    (
        Arc::new(DescriptorPool::new(threads)),
        Arc::new(EpochClock::new()),
    )
}

#[test]
fn status_word_packing() {
    let w = StatusWord::pack(37, 12345, TxState::InProgress);
    assert_eq!(w.tid(), 37);
    assert_eq!(w.sn(), 12345);
    assert_eq!(w.state(), TxState::InProgress);
    assert!(w.is_in_progress());
}

#[test]
fn status_transitions() {
    let status = crate::AtomicStatus::new(StatusWord::pack(1, 0, TxState::InPrep));

    // commit is only valid from in-progress.
    assert!(!status.commit(status.load()));
    assert!(status.set_ready(status.load()));
    assert!(status.load().is_in_progress());
    assert!(status.commit(status.load()));
    assert!(status.load().is_committed());

    // terminal states reject further transitions.
    assert!(!status.abort(status.load()));
    assert!(!status.commit(status.load()));
}

#[test]
fn abort_is_idempotent_and_state_agnostic() {
    let status = crate::AtomicStatus::new(StatusWord::pack(2, 7, TxState::InPrep));
    assert!(status.abort(status.load()));
    assert!(status.load().is_aborted());
    let before = status.load();
    assert!(!status.abort(before));
    assert_eq!(status.load(), before);

    let status = crate::AtomicStatus::new(StatusWord::pack(2, 7, TxState::InProgress));
    assert!(status.abort(status.load()));
    assert!(status.load().is_aborted());
}

#[test]
fn set_unready_moves_to_fresh_instance() {
    let status = crate::AtomicStatus::new(StatusWord::pack(3, 9, TxState::InProgress));
    let before = status.load();
    assert!(status.set_unready(before));
    let after = status.load();
    assert!(after.is_in_prep());
    assert_eq!(after.sn(), before.sn() + 1);
    assert!(!after.matches(before));
}

#[test]
fn reinit_cleanliness() {
    let (pool, clock) = test_fixture(1);
    let host = TestHost::new(pool.clone(), clock, 0);
    let desc = host.session().descriptor();
    let cell = VersionedCell::new(5u64);

    host.enter_txn();
    assert_eq!(cell.tx_load(&host), 5);
    assert_ok!(host.record_read(&cell, 5u64));
    assert_ok!(cell.tx_store(&host, 6));
    assert!(!desc.write_set_is_empty());
    let sn = desc.sn();
    let _ = host.finish_txn();

    desc.reinit();
    assert!(desc.read_set_is_empty());
    assert!(desc.write_set_is_empty());
    assert!(desc.status().load().is_in_prep());
    assert!(desc.sn() > sn);
}

#[test]
fn annotated_tags() {
    let plain = Annotated::new(7, 8);
    assert_eq!(plain.tag(), TAG_VALUE);
    assert!(!plain.is_descriptor());
    let tagged = Annotated::new(7, 9);
    assert_eq!(tagged.tag(), TAG_DESCRIPTOR);
    assert!(tagged.is_descriptor());
}

#[test]
fn plain_cas_advances_counter_by_four() {
    let (pool, clock) = test_fixture(1);
    let host = TestHost::new(pool, clock, 0);
    let cell = VersionedCell::new(1u64);

    let before = cell.plain_load();
    assert!(cell.cas(&host, 1, 2));
    let after = cell.plain_load();
    assert_eq!(after.val, 2);
    assert_eq!(after.cnt, before.cnt + 4);
    assert_eq!(after.tag(), TAG_VALUE);

    assert!(!cell.cas(&host, 1, 3));
    assert_eq!(cell.plain_load(), after);
}

#[test]
fn cas_verify_commits_under_stable_epoch() {
    let (pool, clock) = test_fixture(1);
    let host = TestHost::new(pool, clock.clone(), 0);
    let cell = VersionedCell::new(10u64);

    assert!(cell.cas_verify(&host, 10, 11));
    assert_eq!(cell.load(&host), 11);
    // The descriptor must not be left behind.
    assert_eq!(cell.plain_load().tag(), TAG_VALUE);

    // Mismatched expectation fails without touching the cell.
    let before = cell.plain_load();
    assert!(!cell.cas_verify(&host, 10, 12));
    assert_eq!(cell.plain_load(), before);
}

#[test]
fn cas_verify_fails_when_epoch_moves() {
    let (pool, clock) = test_fixture(1);
    let host = TestHost::new(pool, clock.clone(), 0);
    let cell = VersionedCell::new(1u64);

    // Open the operation at the current epoch, then advance the clock so
    // the commit-time check fails.
    host.begin_op();
    clock.store(INIT_EPOCH + 1);
    assert!(!cell.cas_verify(&host, 1, 2));
    host.abort_op();
    assert_eq!(cell.load(&host), 1);
    assert_eq!(cell.plain_load().tag(), TAG_VALUE);
}

#[test]
fn tx_load_sees_own_pending_write() {
    let (pool, clock) = test_fixture(1);
    let host = TestHost::new(pool, clock, 0);
    let cell = VersionedCell::new(100u64);

    host.enter_txn();
    let outcome = assert_ok!(cell.tx_compare_exchange(&host, 100, 200, true, true));
    assert_eq!(outcome, CasOutcome::Speculative);

    let (value, speculative) = cell.tx_load_speculative(&host);
    assert_eq!(value, 200);
    assert!(speculative);

    assert_ok!(host.finish_txn());
    assert_eq!(cell.plain_load().val, 200);
    assert_eq!(cell.plain_load().tag(), TAG_VALUE);
}

#[test]
fn aborted_txn_leaves_no_trace() {
    let (pool, clock) = test_fixture(1);
    let host = TestHost::new(pool, clock, 0);
    let cell_a = VersionedCell::new(1u64);
    let cell_b = VersionedCell::new(2u64);

    host.enter_txn();
    assert_eq!(
        assert_ok!(cell_a.tx_compare_exchange(&host, 1, 10, true, true)),
        CasOutcome::Speculative
    );
    assert_eq!(
        assert_ok!(cell_b.tx_compare_exchange(&host, 2, 20, true, true)),
        CasOutcome::Speculative
    );
    assert_eq!(host.rollback_txn(), Abort::BeforeCommit);

    assert_eq!(cell_a.plain_load().val, 1);
    assert_eq!(cell_b.plain_load().val, 2);
    assert_eq!(cell_a.plain_load().tag(), TAG_VALUE);
    assert_eq!(cell_b.plain_load().tag(), TAG_VALUE);
}

#[test]
fn write_conflicting_with_recorded_read_aborts() {
    let (pool, clock) = test_fixture(2);
    let writer = TestHost::new(pool.clone(), clock.clone(), 1);
    let host = TestHost::new(pool, clock, 0);
    let cell = VersionedCell::new(1u64);

    host.enter_txn();
    let v = cell.tx_load(&host);
    assert_ok!(host.record_read(&cell, v));
    // The cell moves on underneath us; a write based on the fresh value
    // contradicts the recorded read and must roll the transaction back.
    assert!(cell.cas(&writer, 1, 5));
    assert_eq!(
        cell.tx_compare_exchange(&host, 5, 6, true, true),
        Err(Abort::BeforeCommit)
    );
    assert!(!host.session().is_inside_txn());
    assert_eq!(cell.plain_load().val, 5);
}

#[test]
fn read_validation_detects_interference() {
    let (pool, clock) = test_fixture(2);
    let writer = TestHost::new(pool.clone(), clock.clone(), 1);
    let host = TestHost::new(pool, clock, 0);
    let cell_a = VersionedCell::new(1u64);
    let cell_b = VersionedCell::new(2u64);

    host.enter_txn();
    let a = cell_a.tx_load(&host);
    assert_ok!(host.record_read(&cell_a, a));
    // Concurrent writer commits to cell_a between our read and commit.
    assert!(cell_a.cas(&writer, 1, 99));
    assert_eq!(
        assert_ok!(cell_b.tx_compare_exchange(&host, 2, 20, true, true)),
        CasOutcome::Speculative
    );
    assert_eq!(host.finish_txn(), Err(Abort::DuringCommit));
    assert_eq!(cell_a.plain_load().val, 99);
    assert_eq!(cell_b.plain_load().val, 2);
}

#[test]
fn slab_map_smoke() {
    let map: SlabMap<Annotated> = SlabMap::new();
    assert!(map.is_empty());
    assert_none!(map.get(16));
    assert_none!(map.put(16, Annotated::new(1, 0)));
    assert_some_eq!(map.get(16), Annotated::new(1, 0));
    assert_some_eq!(map.put(16, Annotated::new(2, 4)), Annotated::new(1, 0));
    assert_some_eq!(map.remove(16), Annotated::new(2, 4));
    assert_none!(map.get(16));
}

proptest! {
    #[test]
    fn status_word_roundtrip(tid in 0u64..(1 << 14), sn in 0u64..(1 << 48)) {
        for state in [TxState::InPrep, TxState::InProgress, TxState::Committed, TxState::Aborted] {
            let w = StatusWord::pack(tid, sn, state);
            prop_assert_eq!(w.tid(), tid);
            prop_assert_eq!(w.sn(), sn);
            prop_assert_eq!(w.state(), state);
        }
    }

    #[test]
    fn counter_monotonicity(ops in proptest::collection::vec(0u64..4, 1..64)) {
        let (pool, clock) = test_fixture(1);
        let host = TestHost::new(pool, clock, 0);
        let cell = VersionedCell::new(0u64);
        let mut last = cell.plain_load().cnt;
        for op in ops {
            let current = cell.load(&host);
            match op {
                0 => { cell.cas(&host, current, current + 1); },
                1 => { cell.store(&host, current + 2); },
                2 => { cell.cas(&host, current + 1, current); },
                _ => { cell.load(&host); },
            }
            let now = cell.plain_load().cnt;
            prop_assert!(now >= last);
            prop_assert_eq!(now % 4, 0);
            last = now;
        }
    }
}

/// Descriptors never move: the pool hands out stable addresses that cells
/// embed, so this is load-bearing for helper dereferences.
#[test]
fn descriptor_addresses_are_stable() {
    let pool = DescriptorPool::new(4);
    let addrs: Vec<u64> = pool.iter().map(Descriptor::addr).collect();
    let again: Vec<u64> = pool.iter().map(Descriptor::addr).collect();
    assert_eq!(addrs, again);
    for (tid, desc) in pool.iter().enumerate() {
        assert_eq!(desc.tid(), tid as u64);
        assert_eq!(pool.descriptor(tid).addr(), desc.addr());
    }
}

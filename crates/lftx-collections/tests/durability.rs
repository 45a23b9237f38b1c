// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

//! Read-set invalidation across threads and end-to-end crash recovery of a
//! populated map.

use claims::{assert_ok, assert_ok_eq};
use lftx_collections::{ConcurrentMap, LfHashMap};
use lftx_runtime::{recover_heap, Abort, Runtime, RuntimeConfig, SlabHeap};

fn runtime_named(threads: usize, name: &str) -> Runtime {
    Runtime::new(
        RuntimeConfig::new(threads)
            .with_epoch_length(1, lftx_runtime::EpochLengthUnit::Second)
            .with_heap_name(name),
    )
}

/// Scenario: A reads two keys inside a transaction, B commits a write to
/// one of them, A's commit must fail.
#[test]
fn read_set_invalidation_aborts_commit() {
    let rt = runtime_named(2, "dur_invalidation");
    let a = rt.register_thread();
    let b = rt.register_thread();
    let map: LfHashMap<u64, u64> = LfHashMap::new(64, "dur_invalidation");
    assert_ok_eq!(map.insert(&a, 1, 10), true);
    assert_ok_eq!(map.insert(&a, 2, 20), true);

    a.tx_begin();
    assert_ok_eq!(map.get(&a, &1), Some(10));
    assert_ok_eq!(map.get(&a, &2), Some(20));
    assert_ok_eq!(map.put(&b, 1, 11), Some(10));
    assert_eq!(a.tx_end(), Err(Abort::DuringCommit));

    // The same reads succeed once re-run against the new state.
    a.tx_begin();
    assert_ok_eq!(map.get(&a, &1), Some(11));
    assert_ok_eq!(map.get(&a, &2), Some(20));
    assert_ok!(a.tx_end());

    drop(map);
    drop(rt);
    SlabHeap::<(u64, u64)>::destroy("dur_invalidation");
}

/// Populate, crash, recover, re-index: committed entries come back, the
/// entry removed before the crash stays gone, and writes from the crash
/// window are dropped.
#[test]
fn map_survives_a_crash() {
    let name = "dur_map_recovery";
    let meta_name = format!("{}::meta", name);
    {
        let rt = runtime_named(1, name);
        let h = rt.register_thread();
        let map: LfHashMap<u64, u64> = LfHashMap::new(256, name);

        for k in 1..=20u64 {
            assert_ok_eq!(map.insert(&h, k, k * 100), true);
        }
        assert_ok_eq!(map.remove(&h, &13), Some(1300));
        // Age everything past the recovery uncertainty window.
        rt.advance_epoch();
        rt.advance_epoch();
        // This write lands inside the crash window and must not survive.
        assert_ok_eq!(map.insert(&h, 99, 9900), true);

        drop(map);
        rt.simulate_crash();
    }

    let heap = SlabHeap::<(u64, u64)>::open(name);
    let meta = SlabHeap::<()>::open(&meta_name);
    let outcome = recover_heap(&heap, &meta, false).expect("recovery");

    let rt = runtime_named(1, name);
    // Restart the clock above everything recovered so epoch validation
    // holds for the re-indexed blocks.
    rt.system().clock().store(outcome.max_epoch + 1);
    let h = rt.register_thread();
    let map: LfHashMap<u64, u64> = LfHashMap::new(256, name);
    map.reindex(&h, &outcome.survivors);

    for k in 1..=20u64 {
        let expected = if k == 13 { None } else { Some(k * 100) };
        assert_ok_eq!(map.get(&h, &k), expected);
    }
    assert_ok_eq!(map.get(&h, &99), None);

    // The recovered map stays fully operational.
    assert_ok_eq!(map.insert(&h, 13, 1301), true);
    assert_ok_eq!(map.get(&h, &13), Some(1301));

    drop(map);
    drop(rt);
    SlabHeap::<(u64, u64)>::destroy(name);
    SlabHeap::<()>::destroy(&meta_name);
}

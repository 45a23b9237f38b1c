// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end container semantics, single-threaded and transactional.

use claims::{assert_none, assert_ok, assert_ok_eq};
use lftx_collections::{ConcurrentMap, ConcurrentQueue, LfHashMap, MsQueue, SkipListMap};
use lftx_runtime::{Runtime, RuntimeConfig, SlabHeap};

fn runtime(threads: usize) -> Runtime {
    Runtime::new(
        RuntimeConfig::new(threads)
            .with_epoch_length(1, lftx_runtime::EpochLengthUnit::Second),
    )
}

fn teardown(name: &str) {
    SlabHeap::<(u64, u64)>::destroy(name);
}

#[test]
fn hash_map_single_thread_semantics() {
    let rt = runtime(1);
    let h = rt.register_thread();
    let map: LfHashMap<u64, u64> = LfHashMap::new(1024, "hm_single");

    assert_ok_eq!(map.get(&h, &42), None);
    assert_ok_eq!(map.insert(&h, 42, 100), true);
    assert_ok_eq!(map.get(&h, &42), Some(100));
    assert_ok_eq!(map.get(&h, &7), None);

    // Duplicate insert fails; put replaces.
    assert_ok_eq!(map.insert(&h, 42, 200), false);
    assert_ok_eq!(map.get(&h, &42), Some(100));
    assert_ok_eq!(map.put(&h, 42, 200), Some(100));
    assert_ok_eq!(map.get(&h, &42), Some(200));
    assert_ok_eq!(map.put(&h, 43, 1), None);

    // Replace only touches present keys.
    assert_ok_eq!(map.replace(&h, 42, 300), Some(200));
    assert_ok_eq!(map.replace(&h, 99, 1), None);

    assert_ok_eq!(map.remove(&h, &42), Some(300));
    assert_ok_eq!(map.remove(&h, &42), None);
    assert_ok_eq!(map.get(&h, &42), None);
    assert_ok_eq!(map.get(&h, &43), Some(1));

    drop(map);
    drop(rt);
    teardown("hm_single");
}

#[test]
fn skip_list_single_thread_semantics() {
    let rt = runtime(1);
    let h = rt.register_thread();
    let map: SkipListMap<u64, u64> = SkipListMap::new(1, "sl_single");

    assert_ok_eq!(map.get(&h, &42), None);
    assert_ok_eq!(map.insert(&h, 42, 100), true);
    assert_ok_eq!(map.get(&h, &42), Some(100));
    assert_ok_eq!(map.insert(&h, 42, 200), false);
    assert_ok_eq!(map.put(&h, 42, 200), Some(100));
    assert_ok_eq!(map.replace(&h, 42, 300), Some(200));
    assert_ok_eq!(map.replace(&h, 7, 1), None);

    // Keys stay sorted and unique through churn.
    for k in (0..64u64).rev() {
        assert_ok!(map.put(&h, k, k * 2));
    }
    for k in 0..64u64 {
        assert_ok_eq!(map.get(&h, &k), Some(if k == 42 { 300 } else { k * 2 }));
    }

    assert_ok_eq!(map.remove(&h, &42), Some(300));
    assert_ok_eq!(map.get(&h, &42), None);
    assert_ok_eq!(map.remove(&h, &42), None);

    drop(map);
    drop(rt);
    teardown("sl_single");
}

#[test]
fn queue_fifo_semantics() {
    let rt = runtime(1);
    let h = rt.register_thread();
    let queue: MsQueue<u64> = MsQueue::new("q_single");

    assert_ok_eq!(queue.dequeue(&h), None);
    for v in 1..=5u64 {
        assert_ok!(queue.enqueue(&h, v));
    }
    for v in 1..=5u64 {
        assert_ok_eq!(queue.dequeue(&h), Some(v));
    }
    assert_ok_eq!(queue.dequeue(&h), None);

    drop(queue);
    drop(rt);
    SlabHeap::<(u64, u64)>::destroy("q_single");
}

/// Transaction commit: both writes become visible atomically.
#[test]
fn transaction_commit_is_atomic() {
    let rt = runtime(1);
    let h = rt.register_thread();
    let map: LfHashMap<u64, u64> = LfHashMap::new(1024, "hm_tx_commit");
    for k in 1..=10u64 {
        assert_ok_eq!(map.insert(&h, k, 1), true);
    }

    h.tx_begin();
    let body = (|| {
        map.put(&h, 3, 30)?;
        map.put(&h, 7, 70)?;
        Ok::<(), lftx_runtime::Abort>(())
    })();
    assert_ok!(body);
    assert_ok!(h.tx_end());

    assert_ok_eq!(map.get(&h, &3), Some(30));
    assert_ok_eq!(map.get(&h, &7), Some(70));
    for k in [1u64, 2, 4, 5, 6, 8, 9, 10] {
        assert_ok_eq!(map.get(&h, &k), Some(1));
    }

    drop(map);
    drop(rt);
    teardown("hm_tx_commit");
}

/// Transaction abort: no write survives.
#[test]
fn transaction_abort_leaves_no_trace() {
    let rt = runtime(1);
    let h = rt.register_thread();
    let map: LfHashMap<u64, u64> = LfHashMap::new(1024, "hm_tx_abort");
    for k in 1..=10u64 {
        assert_ok_eq!(map.insert(&h, k, 1), true);
    }

    h.tx_begin();
    assert_ok_eq!(map.put(&h, 3, 30), Some(1));
    assert_ok_eq!(map.put(&h, 7, 70), Some(1));
    let _ = h.tx_abort();

    assert_ok_eq!(map.get(&h, &3), Some(1));
    assert_ok_eq!(map.get(&h, &7), Some(1));

    drop(map);
    drop(rt);
    teardown("hm_tx_abort");
}

/// Cross-container transaction: a map update and a queue push commit (or
/// abort) together.
#[test]
fn transaction_spans_map_and_queue() {
    let rt = runtime(1);
    let h = rt.register_thread();
    let map: LfHashMap<u64, u64> = LfHashMap::new(1024, "hm_tx_mixed");
    let queue: MsQueue<u64> = MsQueue::new("q_tx_mixed");

    h.tx_begin();
    assert_ok_eq!(map.insert(&h, 1, 11), true);
    assert_ok!(queue.enqueue(&h, 11));
    assert_ok!(h.tx_end());

    h.tx_begin();
    assert_ok_eq!(map.insert(&h, 2, 22), true);
    assert_ok!(queue.enqueue(&h, 22));
    let _ = h.tx_abort();

    assert_ok_eq!(map.get(&h, &1), Some(11));
    assert_ok_eq!(map.get(&h, &2), None);
    assert_ok_eq!(queue.dequeue(&h), Some(11));
    assert_ok_eq!(queue.dequeue(&h), None);

    drop(map);
    drop(queue);
    drop(rt);
    teardown("hm_tx_mixed");
    SlabHeap::<(u64, u64)>::destroy("q_tx_mixed");
}

#[test]
fn skip_list_transactions() {
    let rt = runtime(1);
    let h = rt.register_thread();
    let map: SkipListMap<u64, u64> = SkipListMap::new(1, "sl_tx");
    for k in 1..=10u64 {
        assert_ok_eq!(map.insert(&h, k, 1), true);
    }

    h.tx_begin();
    assert_ok_eq!(map.put(&h, 3, 30), Some(1));
    assert_ok_eq!(map.remove(&h, &7), Some(1));
    assert_ok_eq!(map.insert(&h, 11, 110), true);
    assert_ok!(h.tx_end());

    assert_ok_eq!(map.get(&h, &3), Some(30));
    assert_ok_eq!(map.get(&h, &7), None);
    assert_ok_eq!(map.get(&h, &11), Some(110));

    h.tx_begin();
    assert_ok_eq!(map.put(&h, 3, 99), Some(30));
    assert_ok_eq!(map.remove(&h, &11), Some(110));
    let _ = h.tx_abort();

    assert_ok_eq!(map.get(&h, &3), Some(30));
    assert_ok_eq!(map.get(&h, &11), Some(110));

    drop(map);
    drop(rt);
    teardown("sl_tx");
}

#[test]
fn queue_transactional_dequeue_reverts_on_abort() {
    let rt = runtime(1);
    let h = rt.register_thread();
    let queue: MsQueue<u64> = MsQueue::new("q_tx_abort");
    for v in 1..=3u64 {
        assert_ok!(queue.enqueue(&h, v));
    }

    h.tx_begin();
    assert_ok_eq!(queue.dequeue(&h), Some(1));
    let _ = h.tx_abort();

    // The dequeue never happened.
    assert_ok_eq!(queue.dequeue(&h), Some(1));
    assert_ok_eq!(queue.dequeue(&h), Some(2));
    assert_ok_eq!(queue.dequeue(&h), Some(3));
    assert_none!(queue.dequeue(&h).unwrap());

    drop(queue);
    drop(rt);
    SlabHeap::<(u64, u64)>::destroy("q_tx_abort");
}

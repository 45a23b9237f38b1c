// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

//! Active-transaction trackers.
//!
//! Blocking epoch semantics need to know when every thread that registered
//! in epoch `e` has left it before `e` can be drained. The closed set of
//! implementations trades registration cost against drain precision.

use crossbeam::utils::CachePadded;
use lftx_mcas::{EpochClock, NULL_EPOCH};
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

pub trait TransactionTracker: Send + Sync {
    /// Record thread `tid` as active in `target` iff the global epoch still
    /// equals `expected`. Callers loop on failure with a refreshed epoch.
    fn register_active(&self, tid: usize, target: u64, expected: u64) -> bool;

    fn unregister_active(&self, tid: usize, epoch: u64);

    /// No thread is still active in an epoch `<= epoch`.
    fn no_active(&self, epoch: u64) -> bool;

    fn finalize(&self) {}
}

/// No tracking; used when persistence is off.
pub struct NoTracker;

impl TransactionTracker for NoTracker {
    fn register_active(&self, _tid: usize, _target: u64, _expected: u64) -> bool {
        true
    }

    fn unregister_active(&self, _tid: usize, _epoch: u64) {}

    fn no_active(&self, _epoch: u64) -> bool {
        true
    }
}

/// Per-thread current-epoch slots; `NULL_EPOCH` marks an inactive thread.
pub struct CurrEpochTracker {
    clock: Arc<EpochClock>,
    slots: Vec<CachePadded<AtomicU64>>,
}

impl CurrEpochTracker {
    pub fn new(clock: Arc<EpochClock>, threads: usize) -> Self {
        CurrEpochTracker {
            clock,
            slots: (0..threads)
                .map(|_| CachePadded::new(AtomicU64::new(NULL_EPOCH)))
                .collect(),
        }
    }
}

impl TransactionTracker for CurrEpochTracker {
    fn register_active(&self, tid: usize, target: u64, expected: u64) -> bool {
        self.slots[tid].store(target, Ordering::SeqCst);
        if self.clock.read() == expected {
            true
        } else {
            self.slots[tid].store(NULL_EPOCH, Ordering::SeqCst);
            false
        }
    }

    fn unregister_active(&self, tid: usize, _epoch: u64) {
        self.slots[tid].store(NULL_EPOCH, Ordering::SeqCst);
    }

    fn no_active(&self, epoch: u64) -> bool {
        self.slots.iter().all(|slot| {
            let e = slot.load(Ordering::SeqCst);
            e == NULL_EPOCH || e > epoch
        })
    }
}

/// Same slot scheme, with an explicit full fence between publication and
/// the epoch re-read on registration.
pub struct ActiveThreadTracker {
    clock: Arc<EpochClock>,
    slots: Vec<CachePadded<AtomicU64>>,
}

impl ActiveThreadTracker {
    pub fn new(clock: Arc<EpochClock>, threads: usize) -> Self {
        ActiveThreadTracker {
            clock,
            slots: (0..threads)
                .map(|_| CachePadded::new(AtomicU64::new(NULL_EPOCH)))
                .collect(),
        }
    }
}

impl TransactionTracker for ActiveThreadTracker {
    fn register_active(&self, tid: usize, target: u64, expected: u64) -> bool {
        self.slots[tid].store(target, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        if self.clock.read() == expected {
            true
        } else {
            self.slots[tid].store(NULL_EPOCH, Ordering::SeqCst);
            false
        }
    }

    fn unregister_active(&self, tid: usize, _epoch: u64) {
        self.slots[tid].store(NULL_EPOCH, Ordering::SeqCst);
    }

    fn no_active(&self, epoch: u64) -> bool {
        self.slots.iter().all(|slot| {
            let e = slot.load(Ordering::SeqCst);
            e == NULL_EPOCH || e > epoch
        })
    }
}

const RING: usize = 8;

/// Per-epoch global counters on a ring. Registration is a single
/// fetch-add; draining checks one counter instead of scanning threads.
pub struct AtomicCounterTracker {
    clock: Arc<EpochClock>,
    counters: [CachePadded<AtomicU64>; RING],
}

impl AtomicCounterTracker {
    pub fn new(clock: Arc<EpochClock>) -> Self {
        AtomicCounterTracker {
            clock,
            counters: Default::default(),
        }
    }

    fn counter(&self, epoch: u64) -> &AtomicU64 {
        &self.counters[(epoch as usize) % RING]
    }
}

impl TransactionTracker for AtomicCounterTracker {
    fn register_active(&self, _tid: usize, target: u64, expected: u64) -> bool {
        self.counter(target).fetch_add(1, Ordering::SeqCst);
        if self.clock.read() == expected {
            true
        } else {
            self.counter(target).fetch_sub(1, Ordering::SeqCst);
            false
        }
    }

    fn unregister_active(&self, _tid: usize, epoch: u64) {
        self.counter(epoch).fetch_sub(1, Ordering::SeqCst);
    }

    fn no_active(&self, epoch: u64) -> bool {
        self.counter(epoch).load(Ordering::SeqCst) == 0
    }
}

// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

//! Persist-frontier trackers: how far each thread has written back.
//!
//! The advancer walks lagging threads through `next_thread_to_persist`
//! until the global minimum reaches the epoch being closed. Implemented as
//! flat per-thread frontier arrays scanned for the minimum; the interface
//! and ordering contract follow the tree-shaped original.

use crossbeam::utils::CachePadded;
use lftx_mcas::INIT_EPOCH;
use std::sync::atomic::{AtomicU64, Ordering};

pub trait PersistFrontier: Send + Sync {
    /// Thread `tid` issued its first write in `epoch`; epochs it skipped
    /// while idle carry nothing and are considered persisted.
    fn first_write_on_new_epoch(&self, epoch: u64, tid: usize);

    /// The next epoch thread `tid` still owes a write-back for.
    fn next_epoch_to_persist(&self, tid: usize) -> u64;

    /// Thread `tid` finished writing back `epoch`.
    fn after_persist_epoch(&self, epoch: u64, tid: usize);

    /// A thread whose frontier is still below `epoch`, scanning from
    /// `start`; `None` once every thread has caught up.
    fn next_thread_to_persist(&self, epoch: u64, start: usize) -> Option<usize>;
}

fn fetch_max(slot: &AtomicU64, value: u64) {
    let mut current = slot.load(Ordering::SeqCst);
    while current < value {
        match slot.compare_exchange(current, value, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

/// Frontier that only moves forward.
pub struct IncreasingMindicator {
    slots: Vec<CachePadded<AtomicU64>>,
}

impl IncreasingMindicator {
    pub fn new(threads: usize) -> Self {
        IncreasingMindicator {
            slots: (0..threads)
                .map(|_| CachePadded::new(AtomicU64::new(INIT_EPOCH - 1)))
                .collect(),
        }
    }
}

impl PersistFrontier for IncreasingMindicator {
    fn first_write_on_new_epoch(&self, epoch: u64, tid: usize) {
        fetch_max(&self.slots[tid], epoch.saturating_sub(1));
    }

    fn next_epoch_to_persist(&self, tid: usize) -> u64 {
        self.slots[tid].load(Ordering::SeqCst) + 1
    }

    fn after_persist_epoch(&self, epoch: u64, tid: usize) {
        fetch_max(&self.slots[tid], epoch);
    }

    fn next_thread_to_persist(&self, epoch: u64, start: usize) -> Option<usize> {
        let n = self.slots.len();
        (0..n)
            .map(|i| (start + i) % n)
            .find(|&tid| self.slots[tid].load(Ordering::SeqCst) < epoch)
    }
}

/// Frontier without the monotonicity constraint: `after_persist_epoch`
/// overwrites the slot, so a thread revisiting an old epoch lowers its
/// reported frontier.
pub struct Mindicator {
    slots: Vec<CachePadded<AtomicU64>>,
}

impl Mindicator {
    pub fn new(threads: usize) -> Self {
        Mindicator {
            slots: (0..threads)
                .map(|_| CachePadded::new(AtomicU64::new(INIT_EPOCH - 1)))
                .collect(),
        }
    }
}

impl PersistFrontier for Mindicator {
    fn first_write_on_new_epoch(&self, epoch: u64, tid: usize) {
        fetch_max(&self.slots[tid], epoch.saturating_sub(1));
    }

    fn next_epoch_to_persist(&self, tid: usize) -> u64 {
        self.slots[tid].load(Ordering::SeqCst) + 1
    }

    fn after_persist_epoch(&self, epoch: u64, tid: usize) {
        self.slots[tid].store(epoch, Ordering::SeqCst);
    }

    fn next_thread_to_persist(&self, epoch: u64, start: usize) -> Option<usize> {
        let n = self.slots.len();
        (0..n)
            .map(|i| (start + i) % n)
            .find(|&tid| self.slots[tid].load(Ordering::SeqCst) < epoch)
    }
}

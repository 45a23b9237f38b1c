// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

//! Reclamation: deferred frees of payload blocks (per-epoch buckets) and an
//! epoch-based tracker for transient container nodes.
//!
//! A payload retired in epoch `e` may only be freed once no thread can
//! still be active in `e`; the advancer enforces that by draining bucket
//! `e` no earlier than the beginning of `e + 2`. Transient nodes use a
//! separate, finer-grained tracker because container operations outside
//! transactions retire nodes at operation granularity.

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Type-erased deferred destruction of a retired object.
pub struct Retired(Box<dyn FnOnce()>);

// The captured pointers are owned by the retiring thread until the closure
// runs, and the runtime runs each closure at most once.
unsafe impl Send for Retired {}

impl Retired {
    pub fn new(f: impl FnOnce() + 'static) -> Self {
        Retired(Box::new(f))
    }

    pub fn run(self) {
        (self.0)();
    }

    /// Drop without running; used when a tentative retire is withdrawn and
    /// the object must stay live.
    pub fn cancel(self) {}
}

/// Per-epoch free buckets. `tid == threads` is the shared overflow bucket
/// used by deferred contexts with no thread identity (the advancer).
pub trait ToBeFreed: Send + Sync {
    fn register_free(&self, tid: usize, epoch: u64, item: Retired);

    /// Drain every thread's buckets up to and including `epoch`.
    fn help_free(&self, epoch: u64);

    /// Drain one thread's buckets up to and including `epoch`.
    fn help_free_local(&self, epoch: u64, tid: usize);

    /// Housekeeping on epoch entry; the per-epoch policy frees `epoch - 2`.
    fn free_on_new_epoch(&self, epoch: u64, tid: usize);
}

/// Immediate free; the "No" policy.
pub struct NoFree;

impl ToBeFreed for NoFree {
    fn register_free(&self, _tid: usize, _epoch: u64, item: Retired) {
        item.run();
    }

    fn help_free(&self, _epoch: u64) {}

    fn help_free_local(&self, _epoch: u64, _tid: usize) {}

    fn free_on_new_epoch(&self, _epoch: u64, _tid: usize) {}
}

struct EpochBuckets {
    buckets: Mutex<BTreeMap<u64, Vec<Retired>>>,
}

impl EpochBuckets {
    fn new() -> Self {
        EpochBuckets {
            buckets: Mutex::new(BTreeMap::new()),
        }
    }

    fn push(&self, epoch: u64, item: Retired) {
        self.buckets.lock().entry(epoch).or_default().push(item);
    }

    fn drain_up_to(&self, epoch: u64) {
        let drained: Vec<Retired> = {
            let mut buckets = self.buckets.lock();
            let keep = buckets.split_off(&(epoch + 1));
            let drained = std::mem::replace(&mut *buckets, keep);
            drained.into_values().flatten().collect()
        };
        for item in drained {
            item.run();
        }
    }
}

/// Per-epoch buckets drained by whoever crosses the epoch boundary (the
/// advancer, or threads entering a new epoch).
pub struct PerEpochFree {
    threads: Vec<CachePadded<EpochBuckets>>,
}

impl PerEpochFree {
    pub fn new(threads: usize) -> Self {
        PerEpochFree {
            threads: (0..=threads)
                .map(|_| CachePadded::new(EpochBuckets::new()))
                .collect(),
        }
    }
}

impl ToBeFreed for PerEpochFree {
    fn register_free(&self, tid: usize, epoch: u64, item: Retired) {
        self.threads[tid].push(epoch, item);
    }

    fn help_free(&self, epoch: u64) {
        for slot in self.threads.iter() {
            slot.drain_up_to(epoch);
        }
    }

    fn help_free_local(&self, epoch: u64, tid: usize) {
        self.threads[tid].drain_up_to(epoch);
    }

    fn free_on_new_epoch(&self, epoch: u64, tid: usize) {
        self.threads[tid].drain_up_to(epoch.saturating_sub(2));
    }
}

/// Strictly thread-local buckets: each thread frees only its own garbage as
/// it moves between epochs; the advancer never touches them.
pub struct ThreadLocalFree {
    threads: Vec<CachePadded<EpochBuckets>>,
}

impl ThreadLocalFree {
    pub fn new(threads: usize) -> Self {
        ThreadLocalFree {
            threads: (0..=threads)
                .map(|_| CachePadded::new(EpochBuckets::new()))
                .collect(),
        }
    }
}

impl ToBeFreed for ThreadLocalFree {
    fn register_free(&self, tid: usize, epoch: u64, item: Retired) {
        self.threads[tid].push(epoch, item);
    }

    fn help_free(&self, _epoch: u64) {}

    fn help_free_local(&self, epoch: u64, tid: usize) {
        self.threads[tid].drain_up_to(epoch);
    }

    fn free_on_new_epoch(&self, epoch: u64, tid: usize) {
        self.threads[tid].drain_up_to(epoch.saturating_sub(2));
    }
}

const QUIESCENT: u64 = u64::MAX;

struct ThreadLimbo {
    limbo: Mutex<Vec<(u64, Retired)>>,
    temp: Mutex<Vec<Retired>>,
    retire_count: AtomicU64,
}

impl ThreadLimbo {
    fn new() -> Self {
        ThreadLimbo {
            limbo: Mutex::new(Vec::new()),
            temp: Mutex::new(Vec::new()),
            retire_count: AtomicU64::new(0),
        }
    }
}

/// Epoch-based tracker for transient container nodes.
///
/// Each operation brackets itself with `start_op`/`end_op`; retired nodes
/// go to the thread's limbo list stamped with the tracker epoch and are
/// freed once every in-flight operation started after the stamp.
/// `temp_retire` records a retire that a transaction may still withdraw:
/// promoted to the limbo list when the operation ends normally, discarded
/// (without freeing) by `abort_op`.
pub struct Tracker {
    epoch: AtomicU64,
    reservations: Vec<CachePadded<AtomicU64>>,
    threads: Vec<CachePadded<ThreadLimbo>>,
    epoch_freq: u64,
    empty_freq: u64,
}

impl Tracker {
    pub fn new(threads: usize, epoch_freq: u64, empty_freq: u64) -> Self {
        Tracker {
            epoch: AtomicU64::new(1),
            reservations: (0..threads)
                .map(|_| CachePadded::new(AtomicU64::new(QUIESCENT)))
                .collect(),
            threads: (0..threads)
                .map(|_| CachePadded::new(ThreadLimbo::new()))
                .collect(),
            epoch_freq,
            empty_freq,
        }
    }

    pub fn start_op(&self, tid: usize) {
        let e = self.epoch.load(Ordering::SeqCst);
        self.reservations[tid].store(e, Ordering::SeqCst);
    }

    pub fn end_op(&self, tid: usize) {
        // Promote tentative retires: the operation committed, the nodes
        // are really unreachable now.
        let promoted: Vec<Retired> = std::mem::take(&mut *self.threads[tid].temp.lock());
        if !promoted.is_empty() {
            let e = self.epoch.load(Ordering::SeqCst);
            let mut limbo = self.threads[tid].limbo.lock();
            for item in promoted {
                limbo.push((e, item));
            }
        }
        self.reservations[tid].store(QUIESCENT, Ordering::SeqCst);
        let count = self.threads[tid].retire_count.load(Ordering::Relaxed);
        if count % self.empty_freq == 0 {
            self.collect(tid);
        }
    }

    /// Discard tentative retires: the transaction rolled back, the nodes
    /// are still reachable and must not be freed.
    pub fn abort_op(&self, tid: usize) {
        let withdrawn: Vec<Retired> = std::mem::take(&mut *self.threads[tid].temp.lock());
        for item in withdrawn {
            item.cancel();
        }
    }

    /// Assert that no tentative retire is pending (read-only paths).
    pub fn check_temp_retire(&self, tid: usize) {
        assert!(
            self.threads[tid].temp.lock().is_empty(),
            "tentative retire left behind by a read-only transaction"
        );
    }

    pub fn retire(&self, tid: usize, item: Retired) {
        let count = self.threads[tid]
            .retire_count
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        if count % self.epoch_freq == 0 {
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
        let e = self.epoch.load(Ordering::SeqCst);
        self.threads[tid].limbo.lock().push((e, item));
    }

    pub fn temp_retire(&self, tid: usize, item: Retired) {
        self.threads[tid].temp.lock().push(item);
    }

    fn min_reservation(&self) -> u64 {
        self.reservations
            .iter()
            .map(|r| r.load(Ordering::SeqCst))
            .min()
            .unwrap_or(QUIESCENT)
    }

    fn collect(&self, tid: usize) {
        let safe_before = self.min_reservation();
        let ready: Vec<Retired> = {
            let mut limbo = self.threads[tid].limbo.lock();
            let mut ready = Vec::new();
            let mut keep = Vec::new();
            for (e, item) in limbo.drain(..) {
                if e < safe_before {
                    ready.push(item);
                } else {
                    keep.push((e, item));
                }
            }
            *limbo = keep;
            ready
        };
        for item in ready {
            item.run();
        }
    }

    /// Free everything regardless of reservations; only sound once all
    /// threads have stopped (runtime teardown).
    pub fn drain_all(&self) {
        for slot in self.threads.iter() {
            let items: Vec<(u64, Retired)> = std::mem::take(&mut *slot.limbo.lock());
            for (_, item) in items {
                item.run();
            }
            let temp: Vec<Retired> = std::mem::take(&mut *slot.temp.lock());
            for item in temp {
                item.cancel();
            }
        }
    }
}

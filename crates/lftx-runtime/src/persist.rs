// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

//! To-be-persisted containers.
//!
//! Durability is abstracted as a flush+fence capability over byte ranges;
//! the containers decide when registered ranges reach it. Buckets are
//! per-thread so registration on the hot path stays uncontended; the epoch
//! advancer drains other threads' buckets at epoch end.

use crate::heap::RawBlock;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Flush-and-fence capability over a byte range. The runtime never
/// interprets the range; a real persistent medium would write it back here.
pub trait FlushFence: Send + Sync {
    fn flush_range(&self, addr: usize, len: usize);
    fn fence(&self);
}

/// Volatile stand-in: flushes are accepted and dropped.
pub struct NoopFlush;

impl FlushFence for NoopFlush {
    fn flush_range(&self, _addr: usize, _len: usize) {}

    fn fence(&self) {}
}

/// Test double that counts flushes and fences.
#[derive(Default)]
pub struct CountingFlush {
    pub flushes: AtomicU64,
    pub fences: AtomicU64,
}

impl FlushFence for CountingFlush {
    fn flush_range(&self, _addr: usize, _len: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn fence(&self) {
        self.fences.fetch_add(1, Ordering::Relaxed);
    }
}

/// Container of ranges awaiting write-back, bucketed by epoch.
pub trait ToBePersisted: Send + Sync {
    /// Register a block modified in `epoch` by thread `tid`.
    fn register_persist(&self, tid: usize, block: RawBlock, epoch: u64);

    /// Register a raw range (descriptor images, reset headers).
    fn register_range(&self, tid: usize, range: (usize, usize), epoch: u64);

    /// Write back everything thread `tid` registered for `epoch`.
    fn persist_epoch_local(&self, epoch: u64, tid: usize);

    /// Write back `epoch` across all threads.
    fn persist_epoch(&self, epoch: u64) {
        let _ = epoch;
    }
}

/// Persistence disabled.
pub struct NoPersist;

impl ToBePersisted for NoPersist {
    fn register_persist(&self, _tid: usize, _block: RawBlock, _epoch: u64) {}

    fn register_range(&self, _tid: usize, _range: (usize, usize), _epoch: u64) {}

    fn persist_epoch_local(&self, _epoch: u64, _tid: usize) {}
}

/// Direct write-back: every registration flushes immediately; epoch drains
/// reduce to a fence.
pub struct DirectWriteBack {
    flush: Arc<dyn FlushFence>,
}

impl DirectWriteBack {
    pub fn new(flush: Arc<dyn FlushFence>) -> Self {
        DirectWriteBack { flush }
    }
}

impl ToBePersisted for DirectWriteBack {
    fn register_persist(&self, _tid: usize, block: RawBlock, _epoch: u64) {
        let (addr, len) = block.range();
        self.flush.flush_range(addr, len);
    }

    fn register_range(&self, _tid: usize, range: (usize, usize), _epoch: u64) {
        self.flush.flush_range(range.0, range.1);
    }

    fn persist_epoch_local(&self, _epoch: u64, _tid: usize) {
        self.flush.fence();
    }

    fn persist_epoch(&self, _epoch: u64) {
        self.flush.fence();
    }
}

// Epochs more than RING apart never hold pending ranges simultaneously:
// registration happens at the current epoch and drains run one epoch
// behind.
const RING: usize = 4;

struct ThreadBuckets {
    buckets: [Mutex<Vec<(u64, (usize, usize))>>; RING],
}

impl ThreadBuckets {
    fn new() -> Self {
        ThreadBuckets {
            buckets: [
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
            ],
        }
    }
}

/// Buffered write-back: bounded per-thread buffers; overflow drains the
/// bucket early, epoch end drains the rest.
pub struct BufferedWriteBack {
    threads: Vec<CachePadded<ThreadBuckets>>,
    capacity: usize,
    flush: Arc<dyn FlushFence>,
}

impl BufferedWriteBack {
    pub fn new(threads: usize, capacity: usize, flush: Arc<dyn FlushFence>) -> Self {
        BufferedWriteBack {
            threads: (0..threads)
                .map(|_| CachePadded::new(ThreadBuckets::new()))
                .collect(),
            capacity: capacity.max(1),
            flush,
        }
    }

    fn push(&self, tid: usize, range: (usize, usize), epoch: u64) {
        let bucket = &self.threads[tid].buckets[(epoch as usize) % RING];
        let mut entries = bucket.lock();
        if entries.len() >= self.capacity {
            for (_, (addr, len)) in entries.drain(..) {
                self.flush.flush_range(addr, len);
            }
        }
        entries.push((epoch, range));
    }
}

impl ToBePersisted for BufferedWriteBack {
    fn register_persist(&self, tid: usize, block: RawBlock, epoch: u64) {
        self.push(tid, block.range(), epoch);
    }

    fn register_range(&self, tid: usize, range: (usize, usize), epoch: u64) {
        self.push(tid, range, epoch);
    }

    fn persist_epoch_local(&self, epoch: u64, tid: usize) {
        let bucket = &self.threads[tid].buckets[(epoch as usize) % RING];
        let mut entries = bucket.lock();
        // The ring slot may already hold ranges for epoch + RING; keep
        // those.
        let mut kept = Vec::new();
        for (e, (addr, len)) in entries.drain(..) {
            if e <= epoch {
                self.flush.flush_range(addr, len);
            } else {
                kept.push((e, (addr, len)));
            }
        }
        *entries = kept;
    }

    fn persist_epoch(&self, epoch: u64) {
        for tid in 0..self.threads.len() {
            self.persist_epoch_local(epoch, tid);
        }
        self.flush.fence();
    }
}

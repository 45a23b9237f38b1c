// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

//! The epoch system: global clock, policy containers, payload-block state
//! machine, and the cross-thread epoch transitions driven by the advancer.

use crate::advancer::EpochAdvancer;
use crate::config::{
    FreePolicy, Liveness, PersistStrategy, PersistTrackerKind, RuntimeConfig, TransTrackerKind,
};
use crate::frontier::{IncreasingMindicator, Mindicator, PersistFrontier};
use crate::heap::{BlockKind, RawBlock, SlabHeap, UidGenerator};
use crate::persist::{BufferedWriteBack, DirectWriteBack, FlushFence, NoPersist, ToBePersisted};
use crate::reclaim::{NoFree, PerEpochFree, Retired, ThreadLocalFree, ToBeFreed, Tracker};
use crate::tracker::{
    ActiveThreadTracker, AtomicCounterTracker, CurrEpochTracker, NoTracker, TransactionTracker,
};
use lftx_mcas::{Abort, DescriptorPool, EpochClock, INIT_EPOCH, NULL_EPOCH};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub struct EpochSystem {
    config: RuntimeConfig,
    clock: Arc<EpochClock>,
    pool: Arc<DescriptorPool>,
    pub(crate) trans_tracker: Box<dyn TransactionTracker>,
    pub(crate) to_be_persisted: Box<dyn ToBePersisted>,
    pub(crate) to_be_freed: Box<dyn ToBeFreed>,
    pub(crate) frontier: Box<dyn PersistFrontier>,
    pub(crate) tracker: Tracker,
    pub(crate) flush: Arc<dyn FlushFence>,
    meta_heap: Arc<SlabHeap<()>>,
    epoch_block: RawBlock,
    desc_blocks: Vec<RawBlock>,
    uid: UidGenerator,
    advancer: OnceCell<Arc<dyn EpochAdvancer>>,
    next_tid: AtomicUsize,
}

impl EpochSystem {
    pub fn new(config: RuntimeConfig, flush: Arc<dyn FlushFence>) -> EpochSystem {
        config.validate();
        let threads = config.max_threads;
        let clock = Arc::new(EpochClock::new());
        let pool = Arc::new(DescriptorPool::new(threads));

        let trans_tracker: Box<dyn TransactionTracker> =
            if config.persist == PersistStrategy::No {
                Box::new(NoTracker)
            } else {
                match config.trans_tracker {
                    TransTrackerKind::AtomicCounter => {
                        Box::new(AtomicCounterTracker::new(clock.clone()))
                    },
                    TransTrackerKind::ActiveThread => {
                        Box::new(ActiveThreadTracker::new(clock.clone(), threads))
                    },
                    TransTrackerKind::CurrEpoch => {
                        Box::new(CurrEpochTracker::new(clock.clone(), threads))
                    },
                    TransTrackerKind::None => Box::new(NoTracker),
                }
            };

        let to_be_persisted: Box<dyn ToBePersisted> = match config.persist {
            PersistStrategy::No => Box::new(NoPersist),
            PersistStrategy::DirWB => Box::new(DirectWriteBack::new(flush.clone())),
            PersistStrategy::BufferedWB => Box::new(BufferedWriteBack::new(
                threads,
                config.buffer_size,
                flush.clone(),
            )),
        };

        let to_be_freed: Box<dyn ToBeFreed> = match config.free {
            FreePolicy::No => Box::new(NoFree),
            FreePolicy::PerEpoch => Box::new(PerEpochFree::new(threads)),
            FreePolicy::ThreadLocal => Box::new(ThreadLocalFree::new(threads)),
        };

        let frontier: Box<dyn PersistFrontier> = match config.persist_tracker {
            PersistTrackerKind::IncreasingMindicator => {
                Box::new(IncreasingMindicator::new(threads))
            },
            PersistTrackerKind::Mindicator => Box::new(Mindicator::new(threads)),
        };

        let meta_heap = SlabHeap::<()>::open(&format!("{}::meta", config.heap_name));
        meta_heap.mark_dirty();

        // Reuse the persistent epoch container if one survived a previous
        // session, otherwise allocate it.
        let epoch_block = meta_heap
            .scan()
            .into_iter()
            .find(|b| b.header().kind() == BlockKind::Epoch)
            .unwrap_or_else(|| {
                let block = meta_heap.alloc(());
                block.header().set_kind(BlockKind::Epoch);
                block.raw()
            });
        epoch_block.header().set_epoch(INIT_EPOCH);

        let desc_blocks: Vec<RawBlock> = (0..threads)
            .map(|tid| {
                let block = meta_heap.alloc(());
                block.header().set_kind(BlockKind::Descriptor);
                block.header().set_tid_sn(tid as u64, 0);
                block.raw()
            })
            .collect();

        EpochSystem {
            uid: UidGenerator::new(threads),
            tracker: Tracker::new(threads, 100, 1000),
            config,
            clock,
            pool,
            trans_tracker,
            to_be_persisted,
            to_be_freed,
            frontier,
            flush,
            meta_heap,
            epoch_block,
            desc_blocks,
            advancer: OnceCell::new(),
            next_tid: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn liveness(&self) -> Liveness {
        self.config.liveness
    }

    pub fn clock(&self) -> &Arc<EpochClock> {
        &self.clock
    }

    pub fn pool(&self) -> &Arc<DescriptorPool> {
        &self.pool
    }

    pub fn meta_heap(&self) -> &Arc<SlabHeap<()>> {
        &self.meta_heap
    }

    pub(crate) fn set_advancer(&self, advancer: Arc<dyn EpochAdvancer>) {
        self.advancer
            .set(advancer)
            .unwrap_or_else(|_| panic!("advancer installed twice"));
    }

    pub fn advancer(&self) -> &Arc<dyn EpochAdvancer> {
        self.advancer.get().expect("advancer not installed")
    }

    /// Hand out the next thread slot.
    pub(crate) fn allocate_tid(&self) -> usize {
        let tid = self.next_tid.fetch_add(1, Ordering::SeqCst);
        assert!(
            tid < self.config.max_threads,
            "more threads registered than the runtime was sized for"
        );
        tid
    }

    /// Bucket index for deferred contexts with no thread identity.
    pub(crate) fn overflow_tid(&self) -> usize {
        self.config.max_threads
    }

    pub fn check_epoch(&self, c: u64) -> bool {
        self.clock.check(c)
    }

    /// Advance the global epoch: only the advancer (or a test driving
    /// `Runtime::advance_epoch`) calls this.
    pub(crate) fn set_epoch(&self, c: u64) {
        self.epoch_block.header().set_epoch(c);
        let (addr, len) = self.epoch_block.range();
        self.flush.flush_range(addr, len);
        self.clock.store(c);
    }

    /// Epoch `c` has begun: the reclamation bucket for `c - 2` becomes
    /// eligible. Nonblocking mode reclaims thread-locally, so the advancer
    /// only drains the shared overflow bucket it owns.
    pub(crate) fn on_epoch_begin(&self, c: u64) {
        match self.liveness() {
            Liveness::Blocking => self.to_be_freed.help_free(c.saturating_sub(2)),
            Liveness::Nonblocking => self
                .to_be_freed
                .help_free_local(c.saturating_sub(2), self.overflow_tid()),
        }
    }

    /// Epoch `c` is ending: make `c - 1` durable. Blocking mode first waits
    /// for every thread still active in `c - 1`; nonblocking mode lazily
    /// aborts descriptors bound to `c - 1` while walking lagging threads.
    pub(crate) fn on_epoch_end(&self, c: u64) {
        let target = c.saturating_sub(1);
        match self.liveness() {
            Liveness::Blocking => {
                while !self.trans_tracker.no_active(target) {
                    std::thread::yield_now();
                }
                let mut cursor = 0;
                while let Some(tid) = self.frontier.next_thread_to_persist(target, cursor) {
                    self.to_be_persisted.persist_epoch_local(target, tid);
                    self.frontier.after_persist_epoch(target, tid);
                    cursor = tid;
                }
            },
            Liveness::Nonblocking => {
                let mut cursor = 0;
                while let Some(tid) = self.frontier.next_thread_to_persist(target, cursor) {
                    self.pool.descriptor(tid).try_abort(target);
                    self.to_be_persisted.persist_epoch_local(target, tid);
                    self.frontier.after_persist_epoch(target, tid);
                    cursor = tid;
                }
            },
        }
    }

    /// One full epoch transition; used by the advancer thread and by tests
    /// running without one.
    pub fn advance_epoch(&self) {
        let c = self.clock.read();
        self.on_epoch_end(c);
        self.flush.fence();
        self.set_epoch(c + 1);
        self.on_epoch_begin(c + 1);
    }

    /// Copy the thread's descriptor status into its persistent image and
    /// schedule both for write-back. Called whenever the descriptor's
    /// commit-relevant state becomes durable-worthy (epoch acquisition and
    /// the commit/abort epilogues).
    pub(crate) fn persist_descriptor(&self, tid: usize, epoch: u64) {
        let image = &self.desc_blocks[tid];
        image
            .header()
            .set_raw_tid_sn(self.pool.descriptor(tid).status().load().0);
        image.header().set_epoch(epoch);
        self.to_be_persisted.register_range(tid, image.range(), epoch);
    }

    /// Tag a freshly allocated payload block with the operation's epoch and
    /// register it for write-back.
    pub(crate) fn register_alloc_block(
        &self,
        tid: usize,
        block: RawBlock,
        epoch: u64,
        inside_txn: bool,
    ) {
        assert_ne!(epoch, NULL_EPOCH);
        let header = block.header();
        if self.liveness() == Liveness::Nonblocking {
            header.set_tid_sn(tid as u64, self.pool.descriptor(tid).sn());
        }
        header.set_epoch(epoch);
        match header.kind() {
            BlockKind::Init => header.set_kind(BlockKind::Alloc),
            BlockKind::Owned => {},
            BlockKind::Alloc if inside_txn => {},
            other => panic!("registering allocation of a {:?} block", other),
        }
        if header.id() == 0 {
            header.set_id(self.uid.next_id(tid));
        }
        self.to_be_persisted.register_persist(tid, block, epoch);
    }

    /// Revert a pending allocation whose operation aborted.
    pub(crate) fn reset_alloc_block(&self, tid: usize, block: RawBlock, epoch: u64) {
        let header = block.header();
        header.set_epoch(NULL_EPOCH);
        assert_eq!(header.kind(), BlockKind::Alloc);
        header.set_kind(BlockKind::Init);
        self.to_be_persisted.register_range(tid, block.range(), epoch);
    }

    /// Nonblocking retirement: create the anti-node (delete marker) up
    /// front so it is durable with the epoch the retirement belongs to.
    pub(crate) fn prepare_retire_anti(
        &self,
        tid: usize,
        block: RawBlock,
        epoch: u64,
    ) -> Result<RawBlock, Abort> {
        if block.header().epoch() > epoch {
            return Err(Abort::OldSeesNew);
        }
        let anti = self.meta_heap.alloc(());
        let header = anti.header();
        header.set_kind(BlockKind::Delete);
        header.set_epoch(epoch);
        header.set_id(block.header().id());
        header.set_tid_sn(tid as u64, self.pool.descriptor(tid).sn());
        self.to_be_persisted.register_persist(tid, anti.raw(), epoch);
        Ok(anti.raw())
    }

    /// Re-stamp an already-created anti-node for a commit retry under a
    /// fresh epoch.
    pub(crate) fn restamp_retire_anti(&self, tid: usize, anti: RawBlock, epoch: u64) {
        let header = anti.header();
        debug_assert_eq!(header.kind(), BlockKind::Delete);
        header.set_epoch(epoch);
        header.set_tid_sn(tid as u64, self.pool.descriptor(tid).sn());
        self.to_be_persisted.register_range(tid, anti.range(), epoch);
    }

    /// Withdraw a tentative retirement: the anti-node is discarded.
    pub(crate) fn withdraw_retire_anti(&self, anti: RawBlock) {
        self.meta_heap.dealloc(anti);
    }

    /// Commit a retirement at the end of a successful operation.
    ///
    /// Nonblocking mode links the pre-created anti-node to the payload.
    /// Blocking mode creates the delete marker here (retirements buffered
    /// until the operation is known to commit).
    pub(crate) fn commit_retire(
        &self,
        tid: usize,
        block: RawBlock,
        anti: Option<RawBlock>,
        epoch: u64,
    ) {
        let header = block.header();
        assert!(
            !header.retired(),
            "double retire, or this block was tentatively retired before a recent crash"
        );
        match self.liveness() {
            Liveness::Nonblocking => {
                let anti = anti.expect("nonblocking retirement without an anti-node");
                debug_assert!(header.epoch() <= epoch);
                // The retire marker itself is transient; the durable fact
                // is the anti-node registered at prepare time.
                header.set_retire_marker(Some(anti.header_ptr()));
            },
            Liveness::Blocking => {
                debug_assert!(anti.is_none());
                let e = header.epoch();
                assert!(e <= epoch, "retiring a block from a newer epoch");
                if e == epoch {
                    // Retiring a block allocated/updated in the same epoch:
                    // flip it to a delete record in place.
                    match header.kind() {
                        BlockKind::Alloc | BlockKind::Update => header.set_kind(BlockKind::Delete),
                        other => panic!("wrong type of block to retire: {:?}", other),
                    }
                } else {
                    let marker = self.meta_heap.alloc(());
                    let marker_header = marker.header();
                    marker_header.set_kind(BlockKind::Delete);
                    marker_header.set_epoch(epoch);
                    marker_header.set_id(header.id());
                    header.set_retire_marker(Some(marker.raw().header_ptr()));
                    self.to_be_persisted
                        .register_persist(tid, marker.raw(), epoch);
                }
            },
        }
        self.to_be_persisted.register_persist(tid, block, epoch);
    }

    pub(crate) fn register_free(&self, tid: Option<usize>, epoch: u64, item: Retired) {
        let bucket = tid.unwrap_or_else(|| self.overflow_tid());
        self.to_be_freed.register_free(bucket, epoch, item);
    }

    /// Per-thread buckets for owned contexts; contexts without a thread
    /// identity (deferred frees) write back immediately instead.
    fn register_range_or_flush(&self, tid: Option<usize>, range: (usize, usize), epoch: u64) {
        match tid {
            Some(t) => self.to_be_persisted.register_range(t, range, epoch),
            None => self.flush.flush_range(range.0, range.1),
        }
    }

    fn register_persist_or_flush(&self, tid: Option<usize>, block: RawBlock, epoch: u64) {
        match tid {
            Some(t) => self.to_be_persisted.register_persist(t, block, epoch),
            None => self.flush.flush_range(block.addr(), block.len()),
        }
    }

    /// Immediately return a block to its heap, scheduling the (now dead)
    /// range for write-back so recovery observes the cleared header.
    pub(crate) fn delete_block<P: Send + Sync + 'static>(
        &self,
        heap: &Arc<SlabHeap<P>>,
        tid: Option<usize>,
        block: RawBlock,
        epoch: u64,
    ) {
        heap.dealloc(block);
        if epoch != NULL_EPOCH {
            self.register_range_or_flush(tid, block.range(), epoch);
        }
    }

    /// Free a payload block that was never retired through an anti-node
    /// (lock-based deletion path). Blocks from older epochs leave a delete
    /// marker behind and go through the deferred-free buckets.
    pub(crate) fn free_block<P: Send + Sync + 'static>(
        &self,
        heap: &Arc<SlabHeap<P>>,
        tid: Option<usize>,
        block: RawBlock,
        epoch: u64,
    ) -> Result<(), Abort> {
        let header = block.header();
        let e = header.epoch();
        if e == NULL_EPOCH {
            // Never tagged with an epoch; safe to deallocate directly.
            self.delete_block(heap, tid, block, epoch);
            return Ok(());
        }
        if e > epoch {
            return Err(Abort::OldSeesNew);
        }
        if e == epoch {
            match header.kind() {
                BlockKind::Alloc => {
                    self.delete_block(heap, tid, block, epoch);
                    return Ok(());
                },
                BlockKind::Update => header.set_kind(BlockKind::Delete),
                BlockKind::Delete => panic!("double free of a payload block"),
                _ => {},
            }
        } else {
            let marker = self.meta_heap.alloc(());
            let marker_header = marker.header();
            marker_header.set_kind(BlockKind::Delete);
            marker_header.set_epoch(epoch);
            marker_header.set_id(header.id());
            self.register_persist_or_flush(tid, marker.raw(), epoch);
            let meta = Arc::clone(&self.meta_heap);
            let marker_raw = marker.raw();
            self.register_free(
                tid,
                epoch + 1,
                Retired::new(move || meta.dealloc(marker_raw)),
            );
        }
        let heap = Arc::clone(heap);
        self.register_free(tid, epoch, Retired::new(move || heap.dealloc(block)));
        Ok(())
    }

    /// Reclaim a retired payload block once its operation has committed.
    pub(crate) fn reclaim_block<P: Send + Sync + 'static>(
        &self,
        heap: &Arc<SlabHeap<P>>,
        tid: Option<usize>,
        block: RawBlock,
        epoch: u64,
    ) {
        assert_ne!(epoch, NULL_EPOCH, "reclaiming a block in the null epoch");
        let header = block.header();
        let e = header.epoch();
        assert!(e <= epoch, "reclaiming a block created in a newer epoch");
        match header.retire_marker() {
            None => {
                if header.kind() != BlockKind::Delete {
                    // Not retired: treat as a plain delete. The epoch
                    // relation was asserted above, so this cannot fail.
                    self.free_block(heap, tid, block, epoch)
                        .expect("free of an epoch-checked block");
                } else if e + 1 < epoch {
                    // Retired at least two epochs ago; nothing can still
                    // observe it.
                    self.delete_block(heap, tid, block, epoch);
                } else {
                    let heap = Arc::clone(heap);
                    self.register_free(tid, epoch, Retired::new(move || heap.dealloc(block)));
                }
            },
            Some(anti_ptr) => {
                let anti_raw = self.meta_heap.block_at(anti_ptr.as_ptr() as usize);
                assert!(
                    anti_raw.header().epoch() <= epoch,
                    "reclaiming a block retired in a newer epoch"
                );
                let meta = Arc::clone(&self.meta_heap);
                let payload_heap = Arc::clone(heap);
                if e + 1 < epoch {
                    self.register_free(tid, epoch, Retired::new(move || meta.dealloc(anti_raw)));
                    self.delete_block(heap, tid, block, epoch);
                } else {
                    self.register_free(
                        tid,
                        epoch + 1,
                        Retired::new(move || meta.dealloc(anti_raw)),
                    );
                    self.register_free(
                        tid,
                        epoch,
                        Retired::new(move || payload_heap.dealloc(block)),
                    );
                }
            },
        }
    }

    /// Deferred reclamation with no thread identity (runs from cleanup
    /// closures executed by the reclamation tracker or the advancer).
    pub fn preclaim_deferred<P: Send + Sync + 'static>(
        sys: &Arc<EpochSystem>,
        heap: &Arc<SlabHeap<P>>,
        block: RawBlock,
    ) {
        let epoch = sys.clock.read();
        sys.reclaim_block(heap, None, block, epoch);
    }

    /// Reclaim-only transaction bracket for frees issued outside any
    /// operation.
    pub(crate) fn begin_reclaim(&self, tid: usize) -> u64 {
        match self.liveness() {
            Liveness::Blocking => {
                let e = loop {
                    let e = self.clock.read();
                    if self.trans_tracker.register_active(tid, e, e) {
                        break e;
                    }
                };
                self.to_be_freed.free_on_new_epoch(e, tid);
                e
            },
            Liveness::Nonblocking => {
                let e = self.clock.read();
                self.to_be_freed.help_free_local(e.saturating_sub(2), tid);
                e
            },
        }
    }

    pub(crate) fn end_reclaim(&self, tid: usize, epoch: u64) {
        if self.liveness() == Liveness::Blocking {
            self.trans_tracker.unregister_active(tid, epoch);
        }
        self.advancer().on_end_transaction(epoch);
    }
}

// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-thread runtime context and the transaction API.
//!
//! All thread-local state of the original design (current epoch, pending
//! queues, flags) is bundled into [`TxHandle`]; library users obtain one by
//! registering with the [`Runtime`](crate::Runtime) and pass it into every
//! container operation.

use crate::config::Liveness;
use crate::heap::{BlockRef, RawBlock, SlabHeap};
use crate::reclaim::Retired;
use crate::system::EpochSystem;
use lftx_mcas::{Abort, OpLifecycle, TxSession, NULL_EPOCH};
use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

type Callback = Box<dyn FnOnce(&TxHandle)>;

/// Thread context: session, per-operation queues, and payload-block
/// bookkeeping. Not sendable; each thread registers its own.
pub struct TxHandle {
    sys: Arc<EpochSystem>,
    session: TxSession,
    last_epoch: Cell<u64>,
    /// FIFO; run after a successful commit of the enclosing operation
    /// (publication callbacks: swinging pointers past marked nodes, tower
    /// completion, deferred retires).
    cleanups: RefCell<Vec<Callback>>,
    /// LIFO; run during abort rollback in addition to the write-set rewind.
    undos: RefCell<Vec<Callback>>,
    /// LIFO; always run at commit or abort.
    unlocks: RefCell<Vec<Callback>>,
    /// Transient allocations tied to the transaction, keyed by address;
    /// released with the recorded destructor on abort.
    allocs: RefCell<HashMap<usize, Retired>>,
    /// Payload blocks awaiting their first epoch registration. Shared (via
    /// `deferred_payload_release`) with release closures so a block freed
    /// before its operation commits is withdrawn instead of registered.
    pending_allocs: Arc<Mutex<Vec<RawBlock>>>,
    pending_retires: RefCell<Vec<(RawBlock, Option<RawBlock>)>>,
    _not_send: PhantomData<*mut ()>,
}

impl TxHandle {
    pub(crate) fn new(sys: Arc<EpochSystem>) -> TxHandle {
        let tid = sys.allocate_tid();
        let session = TxSession::new(Arc::clone(sys.pool()), Arc::clone(sys.clock()), tid);
        TxHandle {
            sys,
            session,
            last_epoch: Cell::new(NULL_EPOCH),
            cleanups: RefCell::new(Vec::new()),
            undos: RefCell::new(Vec::new()),
            unlocks: RefCell::new(Vec::new()),
            allocs: RefCell::new(HashMap::new()),
            pending_allocs: Arc::new(Mutex::new(Vec::new())),
            pending_retires: RefCell::new(Vec::new()),
            _not_send: PhantomData,
        }
    }

    pub fn tid(&self) -> usize {
        self.session.tid()
    }

    pub fn system(&self) -> &Arc<EpochSystem> {
        &self.sys
    }

    pub fn is_inside_txn(&self) -> bool {
        self.session.is_inside_txn()
    }

    fn liveness(&self) -> Liveness {
        self.sys.liveness()
    }

    // ---------------------------------------------------------------
    // Operation separator
    // ---------------------------------------------------------------

    /// To be constructed at the top of every outer container operation.
    /// Outside a transaction it brackets the reclamation tracker's op;
    /// inside one it clears the pending-reads carrier of the previous
    /// operation.
    pub fn op_guard(&self) -> OpGuard<'_> {
        self.session.reset_rolling_cas();
        if !self.session.is_inside_txn() {
            self.sys.tracker.start_op(self.tid());
        } else {
            self.session.clear_pending_reads();
        }
        OpGuard { handle: self }
    }

    // ---------------------------------------------------------------
    // Queues
    // ---------------------------------------------------------------

    pub fn add_cleanup(&self, f: impl FnOnce(&TxHandle) + 'static) {
        self.cleanups.borrow_mut().push(Box::new(f));
    }

    pub fn add_undo(&self, f: impl FnOnce(&TxHandle) + 'static) {
        if !self.session.is_inside_txn() {
            return;
        }
        self.undos.borrow_mut().push(Box::new(f));
    }

    pub fn add_unlock(&self, f: impl FnOnce(&TxHandle) + 'static) {
        self.unlocks.borrow_mut().push(Box::new(f));
    }

    fn run_cleanups(&self) {
        let callbacks: Vec<Callback> = std::mem::take(&mut *self.cleanups.borrow_mut());
        for f in callbacks {
            f(self);
        }
    }

    fn run_undos(&self) {
        self.session.set_during_abort(true);
        let callbacks: Vec<Callback> = std::mem::take(&mut *self.undos.borrow_mut());
        for f in callbacks.into_iter().rev() {
            f(self);
        }
        self.session.set_during_abort(false);
    }

    fn run_unlocks(&self) {
        let callbacks: Vec<Callback> = std::mem::take(&mut *self.unlocks.borrow_mut());
        for f in callbacks.into_iter().rev() {
            f(self);
        }
    }

    fn release_allocs(&self) {
        let entries: HashMap<usize, Retired> = std::mem::take(&mut *self.allocs.borrow_mut());
        for (_, dealloc) in entries {
            dealloc.run();
        }
    }

    // ---------------------------------------------------------------
    // Transient allocations (container nodes)
    // ---------------------------------------------------------------

    /// Allocate a transient object. Inside a transaction the allocation is
    /// remembered so an abort releases it with the right destructor.
    pub fn alloc_transient<T: 'static>(&self, value: T) -> *mut T {
        let p = Box::into_raw(Box::new(value));
        if self.session.is_inside_txn() {
            self.allocs.borrow_mut().insert(
                p as usize,
                // SAFETY (deferred): the pointer is exclusively ours until
                // either the abort path or free_transient consumes the
                // entry.
                Retired::new(move || unsafe { drop(Box::from_raw(p)) }),
            );
        }
        p
    }

    /// Free a transient object eagerly (never published).
    ///
    /// # Safety
    ///
    /// `p` must come from `alloc_transient` on this handle and must not be
    /// reachable by any other thread.
    pub unsafe fn free_transient<T: 'static>(&self, p: *mut T) {
        let tracked = self.allocs.borrow_mut().remove(&(p as usize));
        if let Some(dealloc) = tracked {
            dealloc.run();
            return;
        }
        drop(Box::from_raw(p));
    }

    /// Record a custom transactional allocation: `dealloc` releases the
    /// object (and anything it owns) if the transaction aborts. No-op
    /// outside transactions.
    pub fn track_transient(&self, addr: usize, dealloc: Retired) {
        if !self.session.is_inside_txn() {
            dealloc.cancel();
            return;
        }
        self.allocs.borrow_mut().insert(addr, dealloc);
    }

    /// Withdraw (and return) a tracked transactional allocation.
    pub fn untrack_transient(&self, addr: usize) -> Option<Retired> {
        self.allocs.borrow_mut().remove(&addr)
    }

    /// Retire a published transient object. `cleanup` frees it (and any
    /// payload it owns) once no thread can still observe it. An object
    /// allocated by the current transaction is released immediately
    /// instead, since it was never visible outside the transaction.
    pub fn retire_transient(&self, addr: usize, cleanup: Retired) {
        if !self.session.is_inside_txn() {
            self.sys.tracker.retire(self.tid(), cleanup);
            return;
        }
        let tracked = self.allocs.borrow_mut().remove(&addr);
        if let Some(dealloc) = tracked {
            cleanup.cancel();
            dealloc.run();
            return;
        }
        self.sys.tracker.retire(self.tid(), cleanup);
    }

    /// Tentative retire inside a transaction, withdrawn if it aborts.
    pub fn retire_transient_tentative(&self, addr: usize, cleanup: Retired) {
        assert!(self.session.is_inside_txn());
        let tracked = self.allocs.borrow_mut().remove(&addr);
        if let Some(dealloc) = tracked {
            cleanup.cancel();
            dealloc.run();
            return;
        }
        self.sys.tracker.temp_retire(self.tid(), cleanup);
    }

    // ---------------------------------------------------------------
    // Payload blocks
    // ---------------------------------------------------------------

    /// Allocate a payload block; registration with an epoch is deferred
    /// until the operation acquires one.
    pub fn alloc_payload<P: Send + Sync + 'static>(
        &self,
        heap: &Arc<SlabHeap<P>>,
        value: P,
    ) -> BlockRef<P> {
        let block = heap.alloc(value);
        if self.session.op_epoch() == NULL_EPOCH {
            self.pending_allocs.lock().push(block.raw());
        } else {
            self.sys.register_alloc_block(
                self.tid(),
                block.raw(),
                self.session.op_epoch(),
                self.session.is_inside_txn(),
            );
        }
        block
    }

    /// The canonical deferred release of a payload block this thread
    /// allocated: withdraws the block from the pending allocations (if it
    /// never reached an epoch registration) and reclaims it.
    pub fn deferred_payload_release<P: Send + Sync + 'static>(
        &self,
        heap: &Arc<SlabHeap<P>>,
        block: BlockRef<P>,
    ) -> Retired {
        let sys = Arc::clone(&self.sys);
        let heap = Arc::clone(heap);
        let pending = Arc::clone(&self.pending_allocs);
        let raw = block.raw();
        Retired::new(move || {
            pending.lock().retain(|b| b.addr() != raw.addr());
            EpochSystem::preclaim_deferred(&sys, &heap, raw);
        })
    }

    /// `alloc_payload` plus transactional tracking: if the enclosing
    /// transaction aborts, the block is reclaimed.
    pub fn alloc_payload_tracked<P: Send + Sync + 'static>(
        &self,
        heap: &Arc<SlabHeap<P>>,
        value: P,
    ) -> BlockRef<P> {
        let block = self.alloc_payload(heap, value);
        if self.session.is_inside_txn() {
            self.allocs
                .borrow_mut()
                .insert(block.raw().addr(), self.deferred_payload_release(heap, block));
        }
        block
    }

    /// Retire a payload block. Must be called before the operation's
    /// linearization point; the retirement commits with the operation and
    /// is withdrawn on abort.
    pub fn retire_payload<P: Send + Sync + 'static>(
        &self,
        _heap: &Arc<SlabHeap<P>>,
        block: BlockRef<P>,
    ) -> Result<(), Abort> {
        let e = self.session.op_epoch();
        if e == NULL_EPOCH {
            self.pending_retires.borrow_mut().push((block.raw(), None));
            return Ok(());
        }
        match self.liveness() {
            Liveness::Nonblocking => {
                let anti = self.sys.prepare_retire_anti(self.tid(), block.raw(), e)?;
                self.pending_retires
                    .borrow_mut()
                    .push((block.raw(), Some(anti)));
            },
            Liveness::Blocking => {
                if block.header().epoch() > e {
                    return Err(Abort::OldSeesNew);
                }
                self.pending_retires.borrow_mut().push((block.raw(), None));
            },
        }
        Ok(())
    }

    /// Really reclaim a retired payload block.
    pub fn reclaim_payload<P: Send + Sync + 'static>(
        &self,
        heap: &Arc<SlabHeap<P>>,
        block: BlockRef<P>,
    ) {
        let mut opened = false;
        let mut e = self.session.op_epoch();
        if e == NULL_EPOCH {
            opened = true;
            e = self.sys.begin_reclaim(self.tid());
            self.session.set_op_epoch(e);
            if !block.header().retired() {
                // A block never published is still sitting in the pending
                // allocations; withdraw it.
                self.pending_allocs
                    .lock()
                    .retain(|b| b.addr() != block.raw().addr());
            }
        }
        self.sys
            .reclaim_block(heap, Some(self.tid()), block.raw(), e);
        if opened {
            self.session.set_op_epoch(NULL_EPOCH);
            self.last_epoch.set(e);
            self.sys.end_reclaim(self.tid(), e);
        }
    }

    /// Epoch-validated payload read; a block from a newer epoch means this
    /// thread fell behind and the outer transaction must restart.
    pub fn open_payload<'h, P: Send + Sync + 'static>(
        &self,
        heap: &'h Arc<SlabHeap<P>>,
        block: BlockRef<P>,
    ) -> Result<&'h P, Abort> {
        let c = self.session.op_epoch();
        assert_ne!(c, NULL_EPOCH, "payload opened outside an operation");
        if block.header().epoch() > c {
            return Err(Abort::OldSeesNew);
        }
        Ok(heap.payload_of(block))
    }

    /// Payload read without epoch validation, for values located before
    /// the operation acquired its epoch.
    pub fn open_payload_unchecked<'h, P: Send + Sync + 'static>(
        &self,
        heap: &'h Arc<SlabHeap<P>>,
        block: BlockRef<P>,
    ) -> &'h P {
        heap.payload_of(block)
    }

    // ---------------------------------------------------------------
    // Single-operation lifecycle
    // ---------------------------------------------------------------

    fn local_persist(&self, c: u64) {
        let last = self.last_epoch.get();
        if last == c {
            return;
        }
        let tid = self.tid();
        self.sys.frontier.first_write_on_new_epoch(c, tid);
        if last != NULL_EPOCH {
            self.sys.to_be_persisted.persist_epoch_local(last, tid);
            if self.sys.frontier.next_epoch_to_persist(tid) <= last {
                self.sys.frontier.after_persist_epoch(last, tid);
            }
        }
        self.sys.flush.fence();
    }

    fn local_free(&self, c: u64) {
        let last = self.last_epoch.get();
        if last == c || last == NULL_EPOCH {
            return;
        }
        self.sys
            .to_be_freed
            .help_free_local(c.saturating_sub(2), self.tid());
    }

    /// Acquire the current epoch and stamp every pending registration with
    /// it. Retries internally when a pending retirement observes a newer
    /// block (the refreshed epoch resolves the race).
    fn acquire_epoch(&self) -> u64 {
        let tid = self.tid();
        'retry: loop {
            let e = match self.liveness() {
                Liveness::Nonblocking => {
                    let e = self.sys.clock().read();
                    self.local_persist(e);
                    self.sys.pool().descriptor(tid).set_epoch(e);
                    self.sys.persist_descriptor(tid, e);
                    self.local_free(e);
                    e
                },
                Liveness::Blocking => {
                    let e = loop {
                        let e = self.sys.clock().read();
                        if self.sys.trans_tracker.register_active(tid, e, e) {
                            break e;
                        }
                    };
                    let last = self.last_epoch.get();
                    if last != e {
                        self.last_epoch.set(e);
                        if last + 1 == e {
                            self.sys.frontier.first_write_on_new_epoch(e, tid);
                        }
                        // Persist past epochs if the advancer's target
                        // needs this thread to catch up.
                        let persist_until = self
                            .sys
                            .advancer()
                            .ongoing_target()
                            .saturating_sub(2)
                            .min(e - 1);
                        loop {
                            let to_persist = self.sys.frontier.next_epoch_to_persist(tid);
                            if to_persist > persist_until {
                                break;
                            }
                            self.sys.to_be_persisted.persist_epoch_local(to_persist, tid);
                            self.sys.frontier.after_persist_epoch(to_persist, tid);
                        }
                    }
                    self.sys.to_be_freed.free_on_new_epoch(e, tid);
                    self.sys.pool().descriptor(tid).set_epoch(e);
                    e
                },
            };

            // Stamp pending retirements and allocations.
            if self.liveness() == Liveness::Nonblocking {
                let mut stale_epoch = false;
                {
                    let mut retires = self.pending_retires.borrow_mut();
                    for entry in retires.iter_mut() {
                        match entry.1 {
                            Some(anti) => self.sys.restamp_retire_anti(tid, anti, e),
                            None => match self.sys.prepare_retire_anti(tid, entry.0, e) {
                                Ok(anti) => entry.1 = Some(anti),
                                Err(Abort::OldSeesNew) => {
                                    // The block was tagged after we read
                                    // the clock; a refreshed epoch covers
                                    // it.
                                    stale_epoch = true;
                                    break;
                                },
                                Err(_) => unreachable!(),
                            },
                        }
                    }
                }
                if stale_epoch {
                    continue 'retry;
                }
            }
            for block in self.pending_allocs.lock().iter() {
                self.sys
                    .register_alloc_block(tid, *block, e, self.session.is_inside_txn());
            }
            return e;
        }
    }

    fn clear_pending_retires(&self) {
        let retires: Vec<(RawBlock, Option<RawBlock>)> =
            std::mem::take(&mut *self.pending_retires.borrow_mut());
        for (_, anti) in retires {
            if let Some(anti) = anti {
                self.sys.withdraw_retire_anti(anti);
            }
        }
    }

    fn commit_pending_retires(&self, epoch: u64) {
        let retires: Vec<(RawBlock, Option<RawBlock>)> =
            std::mem::take(&mut *self.pending_retires.borrow_mut());
        for (block, anti) in retires {
            self.sys.commit_retire(self.tid(), block, anti, epoch);
        }
    }

    // ---------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------

    /// Enter a transaction on this thread. Nested transactions are not
    /// supported and panic.
    pub fn tx_begin(&self) {
        let session = &self.session;
        assert!(
            !session.is_inside_txn(),
            "nested transactions are not supported"
        );
        debug_assert!(self.pending_allocs.lock().is_empty());
        debug_assert!(self.pending_retires.borrow().is_empty());
        session.reset_rolling_cas();
        session.set_inside_txn(true);

        self.cleanups.borrow_mut().clear();
        self.undos.borrow_mut().clear();
        self.unlocks.borrow_mut().clear();
        self.allocs.borrow_mut().clear();

        session.descriptor().reinit();
        debug_assert!(session.descriptor().write_set_is_empty());
        debug_assert!(session.descriptor().read_set_is_empty());
        self.sys.tracker.start_op(self.tid());
        // All epoch-related work is deferred to tx_end.
    }

    /// Commit. On conflict the transaction is rolled back and
    /// `Abort::DuringCommit` is returned; the caller retries.
    pub fn tx_end(&self) -> Result<(), Abort> {
        let session = &self.session;
        let desc = session.descriptor();
        let tid = self.tid();
        assert_eq!(session.op_epoch(), NULL_EPOCH);

        if desc.write_set_is_empty() && self.undos.borrow().is_empty() {
            // Read-only transaction: validate reads without acquiring an
            // epoch or publishing the descriptor.
            debug_assert!(self.allocs.borrow().is_empty());
            debug_assert!(self.pending_retires.borrow().is_empty());
            debug_assert!(self.pending_allocs.lock().is_empty());
            debug_assert!(self.cleanups.borrow().is_empty());
            let valid = desc.owner_validate_reads();
            self.run_unlocks();
            self.sys.tracker.check_temp_retire(tid);
            session.set_inside_txn(false);
            self.sys.tracker.end_op(tid);
            return if valid { Ok(()) } else { Err(Abort::DuringCommit) };
        }

        loop {
            let e = self.acquire_epoch();
            session.set_op_epoch(e);

            // Commit phase.
            let observed = desc.status().load();
            if !desc.status().set_ready(observed) {
                // The epoch advancer already aborted this instance.
                debug_assert!(desc.status().load().is_aborted());
                return Err(self.abort_epilogue());
            }
            let d = desc.status().load();
            debug_assert!(!d.is_in_prep());
            if !desc.owner_validate_reads() {
                desc.status().abort(d);
            } else if d.is_in_progress() {
                if session.check_epoch() {
                    desc.status().commit(d);
                } else if desc.status().set_unready(d) {
                    // Epoch slipped between acquisition and commit: release
                    // it and retry the commit under a fresh one.
                    if self.liveness() == Liveness::Blocking {
                        self.sys.trans_tracker.unregister_active(tid, e);
                    }
                    self.sys.advancer().on_end_transaction(e);
                    self.last_epoch.set(e);
                    session.set_op_epoch(NULL_EPOCH);
                    continue;
                }
            }
            break;
        }

        if desc.status().load().is_committed() {
            self.commit_epilogue();
            Ok(())
        } else {
            debug_assert!(desc.status().load().is_aborted());
            Err(self.abort_epilogue())
        }
    }

    /// Abort explicitly. Rolls everything back and returns
    /// `Abort::BeforeCommit` for the caller to propagate.
    pub fn tx_abort(&self) -> Abort {
        let session = &self.session;
        let desc = session.descriptor();
        let tid = self.tid();
        assert_eq!(session.op_epoch(), NULL_EPOCH);
        let d = desc.status().load();
        debug_assert!(d.is_in_prep() || d.is_aborted());

        if desc.write_set_is_empty() && self.undos.borrow().is_empty() {
            // Nothing published; allocations may still exist when the
            // abort fires between an allocation and its first use.
            self.release_allocs();
            debug_assert!(self.pending_retires.borrow().is_empty());
            debug_assert!(self.pending_allocs.lock().is_empty());
            debug_assert!(self.cleanups.borrow().is_empty());
            self.run_unlocks();
            self.sys.tracker.check_temp_retire(tid);
            session.set_inside_txn(false);
            self.sys.tracker.end_op(tid);
            return Abort::BeforeCommit;
        }

        desc.status().abort(d);
        debug_assert!(desc.status().load().is_aborted());
        desc.owner_uninstall();

        self.run_undos();
        self.run_unlocks();
        self.release_allocs();
        self.sys.tracker.abort_op(tid);

        self.clear_pending_retires();
        self.pending_allocs.lock().clear();

        session.set_inside_txn(false);
        self.sys.tracker.end_op(tid);
        Abort::BeforeCommit
    }

    fn commit_epilogue(&self) {
        let session = &self.session;
        let tid = self.tid();
        let e = session.op_epoch();
        session.descriptor().owner_uninstall();
        if self.liveness() == Liveness::Nonblocking {
            self.sys.persist_descriptor(tid, e);
        }

        self.run_unlocks();
        self.commit_pending_retires(e);

        if self.liveness() == Liveness::Blocking {
            self.sys.trans_tracker.unregister_active(tid, e);
        }
        self.sys.advancer().on_end_transaction(e);
        self.last_epoch.set(e);
        session.set_op_epoch(NULL_EPOCH);

        self.pending_allocs.lock().clear();
        session.set_inside_txn(false);

        self.run_cleanups();
        self.sys.tracker.end_op(tid);
    }

    fn abort_epilogue(&self) -> Abort {
        let session = &self.session;
        let tid = self.tid();
        let e = session.op_epoch();
        session.descriptor().owner_uninstall();
        if self.liveness() == Liveness::Nonblocking {
            self.sys.persist_descriptor(tid, e);
        }

        self.run_undos();
        self.run_unlocks();
        self.release_allocs();
        self.sys.tracker.abort_op(tid);

        self.clear_pending_retires();
        self.pending_allocs.lock().clear();

        if self.liveness() == Liveness::Blocking {
            self.sys.trans_tracker.unregister_active(tid, e);
        }
        self.sys.advancer().on_end_transaction(e);
        self.last_epoch.set(e);
        session.set_op_epoch(NULL_EPOCH);

        session.set_inside_txn(false);
        self.sys.tracker.end_op(tid);
        Abort::DuringCommit
    }

    /// Run `body` as a transaction, retrying on abort until it commits.
    pub fn transaction<R>(&self, mut body: impl FnMut(&TxHandle) -> Result<R, Abort>) -> R {
        loop {
            self.tx_begin();
            match body(self) {
                Ok(value) => {
                    if self.tx_end().is_ok() {
                        return value;
                    }
                },
                Err(_) => {
                    // The failing operation already rolled the transaction
                    // back; go around again.
                },
            }
        }
    }

    /// Block until the advancer has persisted through this thread's last
    /// completed epoch.
    pub fn sync(&self) {
        assert_eq!(self.session.op_epoch(), NULL_EPOCH);
        self.sys.advancer().sync(self.last_epoch.get());
    }
}

impl OpLifecycle for TxHandle {
    fn session(&self) -> &TxSession {
        &self.session
    }

    fn begin_op(&self) {
        let session = &self.session;
        assert_eq!(session.op_epoch(), NULL_EPOCH);
        session.reset_rolling_cas();
        self.cleanups.borrow_mut().clear();
        session.descriptor().reinit();
        let e = self.acquire_epoch();
        session.set_op_epoch(e);
    }

    fn end_op(&self) {
        let session = &self.session;
        let tid = self.tid();
        let e = session.op_epoch();
        assert_ne!(e, NULL_EPOCH);

        self.commit_pending_retires(e);
        if self.liveness() == Liveness::Nonblocking {
            // Capture the terminal status in the descriptor image so the
            // operation's writes are recoverable.
            self.sys.persist_descriptor(tid, e);
        }

        if self.liveness() == Liveness::Blocking {
            self.sys.trans_tracker.unregister_active(tid, e);
        }
        self.sys.advancer().on_end_transaction(e);
        self.last_epoch.set(e);
        session.set_op_epoch(NULL_EPOCH);
        self.pending_allocs.lock().clear();

        // Cleanups wrapped by a single operation run here, though single
        // operations usually execute them in place.
        self.run_cleanups();
    }

    fn abort_op(&self) {
        let session = &self.session;
        let tid = self.tid();
        let e = session.op_epoch();
        assert_ne!(e, NULL_EPOCH);

        self.clear_pending_retires();
        // Pending allocations stay queued: a retried operation registers
        // them again under its next epoch.
        for block in self.pending_allocs.lock().iter() {
            self.sys.reset_alloc_block(tid, *block, e);
        }
        if self.liveness() == Liveness::Blocking {
            self.sys.trans_tracker.unregister_active(tid, e);
        }
        self.last_epoch.set(e);
        session.set_op_epoch(NULL_EPOCH);
    }

    fn rollback_txn(&self) -> Abort {
        self.tx_abort()
    }
}

/// RAII separator bracketing one outer container operation.
pub struct OpGuard<'a> {
    handle: &'a TxHandle,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        if !self.handle.session.is_inside_txn() {
            self.handle.sys.tracker.end_op(self.handle.tid());
        }
    }
}

// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::cell::{Annotated, VersionedCell, Word};
use crate::clock::{EpochClock, NULL_EPOCH};
use crate::descriptor::{Descriptor, DescriptorPool};
use crate::error::Abort;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;

/// Owner-thread view of the engine: the thread's descriptor, the epoch
/// clock, and the transient per-operation carriers the cell operations need
/// (flags plus pending reads). One session per registered thread; never
/// shared.
pub struct TxSession {
    tid: usize,
    clock: Arc<EpochClock>,
    pool: Arc<DescriptorPool>,
    op_epoch: Cell<u64>,
    inside_txn: Cell<bool>,
    rolling_cas: Cell<bool>,
    during_abort: Cell<bool>,
    pending_reads: RefCell<HashMap<usize, Annotated>>,
}

impl TxSession {
    pub fn new(pool: Arc<DescriptorPool>, clock: Arc<EpochClock>, tid: usize) -> Self {
        assert!(tid < pool.capacity());
        TxSession {
            tid,
            clock,
            pool,
            op_epoch: Cell::new(NULL_EPOCH),
            inside_txn: Cell::new(false),
            rolling_cas: Cell::new(false),
            during_abort: Cell::new(false),
            pending_reads: RefCell::new(HashMap::new()),
        }
    }

    pub fn tid(&self) -> usize {
        self.tid
    }

    pub fn clock(&self) -> &EpochClock {
        &self.clock
    }

    pub fn descriptor(&self) -> &Descriptor {
        self.pool.descriptor(self.tid)
    }

    pub fn descriptor_addr(&self) -> u64 {
        self.descriptor().addr()
    }

    pub fn is_own_descriptor(&self, addr: u64) -> bool {
        addr == self.descriptor_addr()
    }

    pub fn op_epoch(&self) -> u64 {
        self.op_epoch.get()
    }

    pub fn set_op_epoch(&self, e: u64) {
        self.op_epoch.set(e);
    }

    /// True iff the global epoch still equals this operation's epoch.
    pub fn check_epoch(&self) -> bool {
        self.clock.check(self.op_epoch.get())
    }

    pub fn is_inside_txn(&self) -> bool {
        self.inside_txn.get()
    }

    pub fn set_inside_txn(&self, v: bool) {
        self.inside_txn.set(v);
    }

    pub fn is_rolling_cas(&self) -> bool {
        self.rolling_cas.get()
    }

    pub fn set_rolling_cas(&self) {
        self.rolling_cas.set(true);
    }

    pub fn reset_rolling_cas(&self) {
        self.rolling_cas.set(false);
    }

    pub fn is_during_abort(&self) -> bool {
        self.during_abort.get()
    }

    pub fn set_during_abort(&self, v: bool) {
        self.during_abort.set(v);
    }

    /// Remember the annotation a transactional load (or a successful plain
    /// CAS/store inside a transaction) observed, so a later `record_read`
    /// on the same cell can be promoted into the read set.
    pub fn note_pending_read(&self, addr: usize, observed: Annotated) {
        debug_assert!(self.is_inside_txn());
        self.pending_reads.borrow_mut().insert(addr, observed);
    }

    pub fn pending_read(&self, addr: usize) -> Option<Annotated> {
        self.pending_reads.borrow().get(&addr).copied()
    }

    pub fn clear_pending_reads(&self) {
        self.pending_reads.borrow_mut().clear();
    }
}

/// The operation-lifecycle half the runtime provides to the cell
/// operations: opening/closing single operations (for the auto-wrapped
/// `cas_verify` path) and the full owner abort of an in-flight transaction.
pub trait OpLifecycle {
    fn session(&self) -> &TxSession;

    /// Open a single operation: acquire the current epoch, reinitialize the
    /// descriptor, register pending allocations.
    fn begin_op(&self);

    /// Close a committed single operation.
    fn end_op(&self);

    /// Close a failed single operation, reverting pending registrations.
    fn abort_op(&self);

    /// Owner rollback of the whole in-flight transaction (uninstall, undo,
    /// transient-allocation release). Returns the abort the caller must
    /// propagate.
    fn rollback_txn(&self) -> Abort;

    /// Promote an observation made by an earlier transactional load into
    /// the descriptor's read set. No-op outside transactions. Reads covered
    /// by our own pending writes validate against the write set instead.
    fn record_read<T: Word>(&self, cell: &VersionedCell<T>, observed: T) -> Result<(), Abort> {
        let session = self.session();
        if !session.is_inside_txn() {
            return Ok(());
        }
        let addr = cell.addr();
        let desc = session.descriptor();
        if let Some(w) = desc.write_entry(addr) {
            if w.new_val == observed.into_raw() {
                return Ok(());
            }
        }
        let annotated = session
            .pending_read(addr)
            .expect("record_read without a pending transactional load of the cell");
        debug_assert_eq!(annotated.val, observed.into_raw());
        if !desc.add_to_read_set(addr, annotated) {
            return Err(self.rollback_txn());
        }
        Ok(())
    }
}

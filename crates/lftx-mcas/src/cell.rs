// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::clock::NULL_EPOCH;
use crate::error::Abort;
use crate::session::OpLifecycle;
use crate::slab::EntryValue;
use portable_atomic::{AtomicU128, Ordering};
use std::marker::PhantomData;
use std::sync::atomic::AtomicU64;

/// Counter tag: the cell holds a plain payload word.
pub const TAG_VALUE: u64 = 0b00;
/// Counter tag: the cell holds a pointer to an in-flight descriptor.
pub const TAG_DESCRIPTOR: u64 = 0b01;

const TAG_MASK: u64 = 0b11;

/// A `(value, counter)` pair as read from a versioned cell. The low two bits
/// of `cnt` are the tag; every successful CAS adds 4 so the counter is
/// strictly monotonic per cell.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Annotated {
    pub val: u64,
    pub cnt: u64,
}

impl Annotated {
    pub fn new(val: u64, cnt: u64) -> Self {
        Annotated { val, cnt }
    }

    pub fn tag(self) -> u64 {
        self.cnt & TAG_MASK
    }

    pub fn is_descriptor(self) -> bool {
        self.tag() == TAG_DESCRIPTOR
    }

    fn to_bits(self) -> u128 {
        ((self.cnt as u128) << 64) | self.val as u128
    }

    fn from_bits(bits: u128) -> Self {
        Annotated {
            val: bits as u64,
            cnt: (bits >> 64) as u64,
        }
    }

    /// # Safety
    ///
    /// The tag must be [`TAG_DESCRIPTOR`] and the descriptor pool the value
    /// points into must still be alive. Pools live as long as the runtime,
    /// and a stale instance is detected by the status-word snapshot checks,
    /// so dereferencing here is bounded.
    pub(crate) unsafe fn descriptor<'a>(self) -> &'a crate::descriptor::Descriptor {
        debug_assert!(self.is_descriptor());
        &*(self.val as *const crate::descriptor::Descriptor)
    }
}

impl EntryValue for Annotated {
    fn store_into(&self, slots: &[AtomicU64; 3]) {
        slots[0].store(self.val, std::sync::atomic::Ordering::Relaxed);
        slots[1].store(self.cnt, std::sync::atomic::Ordering::Relaxed);
    }

    fn load_from(slots: &[AtomicU64; 3]) -> Self {
        Annotated {
            val: slots[0].load(std::sync::atomic::Ordering::Relaxed),
            cnt: slots[1].load(std::sync::atomic::Ordering::Relaxed),
        }
    }
}

/// Payload types a cell can carry: anything losslessly convertible to one
/// machine word. Implemented for `u64` and raw pointers.
pub trait Word: Copy {
    fn into_raw(self) -> u64;
    fn from_raw(raw: u64) -> Self;
}

impl Word for u64 {
    fn into_raw(self) -> u64 {
        self
    }

    fn from_raw(raw: u64) -> u64 {
        raw
    }
}

impl<N> Word for *mut N {
    fn into_raw(self) -> u64 {
        self as u64
    }

    fn from_raw(raw: u64) -> *mut N {
        raw as *mut N
    }
}

/// Outcome of a transactional compare-exchange.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CasOutcome {
    /// The comparison failed, or another descriptor was in the way.
    Failed,
    /// The CAS took effect immediately (non-transactional path).
    Committed,
    /// The write was recorded in the descriptor; it becomes visible when the
    /// surrounding transaction commits.
    Speculative,
}

impl CasOutcome {
    pub fn succeeded(self) -> bool {
        self != CasOutcome::Failed
    }

    pub fn is_speculative(self) -> bool {
        self == CasOutcome::Speculative
    }
}

/// Untyped cell state, shared between the typed cell and the descriptor
/// engine (which addresses cells by raw address).
#[repr(transparent)]
pub(crate) struct CellState(AtomicU128);

impl CellState {
    fn new(annotated: Annotated) -> Self {
        CellState(AtomicU128::new(annotated.to_bits()))
    }

    pub(crate) fn load(&self) -> Annotated {
        Annotated::from_bits(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn compare_exchange(&self, expected: Annotated, desired: Annotated) -> bool {
        self.0
            .compare_exchange(
                expected.to_bits(),
                desired.to_bits(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

/// # Safety
///
/// `addr` must be the address of a live [`VersionedCell`]; callers inherit
/// the reclamation contract that cells recorded in a descriptor stay alive
/// for the duration of the operation that recorded them.
pub(crate) unsafe fn state_at<'a>(addr: usize) -> &'a CellState {
    &*(addr as *const CellState)
}

/// A 128-bit versioned cell: one payload word annotated with a monotonic,
/// tagged counter, updated only by double-width CAS.
///
/// Plain operations (`load`, `cas`, `store`) cooperate with in-flight
/// descriptors by helping them complete. The `tx_*` operations additionally
/// consult the calling thread's own descriptor so a transaction observes its
/// own pending writes.
#[repr(transparent)]
pub struct VersionedCell<T: Word> {
    state: CellState,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Word> VersionedCell<T> {
    pub fn new(value: T) -> Self {
        VersionedCell {
            state: CellState::new(Annotated::new(value.into_raw(), 0)),
            _marker: PhantomData,
        }
    }

    /// Address identity used as the read/write-set key.
    pub fn addr(&self) -> usize {
        self as *const Self as usize
    }

    pub(crate) fn state(&self) -> &CellState {
        &self.state
    }

    pub fn plain_load(&self) -> Annotated {
        self.state.load()
    }

    /// Load that never returns a descriptor pointer: any in-flight
    /// transaction found in the cell is helped to completion first.
    pub fn load<H: OpLifecycle>(&self, host: &H) -> T {
        let session = host.session();
        loop {
            let r = self.state.load();
            if r.is_descriptor() {
                debug_assert!(!session.is_own_descriptor(r.val));
                // SAFETY: tag says descriptor; see `Annotated::descriptor`.
                let desc = unsafe { r.descriptor() };
                desc.helper_try_complete(session.clock(), &self.state, r);
                continue;
            }
            return T::from_raw(r.val);
        }
    }

    /// Invisible reads make `load_verify` identical to `load`: the epoch is
    /// not validated until commit.
    pub fn load_verify<H: OpLifecycle>(&self, host: &H) -> T {
        self.load(host)
    }

    /// Unconditional store (counter still advances by 4). Records the new
    /// value as a pending read when called inside a transaction so a later
    /// `record_read` on this cell validates against what we published.
    pub fn store<H: OpLifecycle>(&self, host: &H, desired: T) {
        let session = host.session();
        loop {
            let r = self.state.load();
            if r.is_descriptor() {
                // SAFETY: tag says descriptor.
                let desc = unsafe { r.descriptor() };
                desc.helper_try_complete(session.clock(), &self.state, r);
                continue;
            }
            let new_r = Annotated::new(desired.into_raw(), r.cnt + 4);
            if self.state.compare_exchange(r, new_r) {
                if session.is_inside_txn() {
                    session.note_pending_read(self.addr(), new_r);
                }
                return;
            }
        }
    }

    /// Store that only takes effect while the operation's epoch is current.
    pub fn store_verify<H: OpLifecycle>(&self, host: &H, desired: T) -> Result<(), Abort> {
        let session = host.session();
        loop {
            let r = self.state.load();
            if r.is_descriptor() {
                // SAFETY: tag says descriptor.
                let desc = unsafe { r.descriptor() };
                desc.helper_try_complete(session.clock(), &self.state, r);
                continue;
            }
            if !session.check_epoch() {
                return Err(Abort::DuringCommit);
            }
            let new_r = Annotated::new(desired.into_raw(), r.cnt + 4);
            if self.state.compare_exchange(r, new_r) {
                return Ok(());
            }
        }
    }

    /// Plain CAS: no epoch check, counter advances by 4. A foreign
    /// descriptor is helped and reported as failure so the caller re-reads.
    pub fn cas<H: OpLifecycle>(&self, host: &H, expected: T, desired: T) -> bool {
        let session = host.session();
        let r = self.state.load();
        if r.is_descriptor() {
            debug_assert!(!session.is_own_descriptor(r.val));
            // SAFETY: tag says descriptor.
            let desc = unsafe { r.descriptor() };
            desc.helper_try_complete(session.clock(), &self.state, r);
            return false;
        }
        let old_r = Annotated::new(expected.into_raw(), r.cnt);
        let new_r = Annotated::new(desired.into_raw(), r.cnt + 4);
        if !self.state.compare_exchange(old_r, new_r) {
            return false;
        }
        if session.is_inside_txn() {
            session.note_pending_read(self.addr(), new_r);
        }
        true
    }

    /// Epoch-validated single CAS. Routed through the descriptor so the
    /// "value matches" and "epoch unchanged" checks commit as one atomic
    /// step; opens a fresh operation when called outside one.
    pub fn cas_verify<H: OpLifecycle>(&self, host: &H, expected: T, desired: T) -> bool {
        let session = host.session();
        let mut opened = false;
        if session.op_epoch() == NULL_EPOCH {
            host.begin_op();
            opened = true;
        }
        debug_assert_ne!(session.op_epoch(), NULL_EPOCH);

        let r = self.state.load();
        if r.is_descriptor() {
            // SAFETY: tag says descriptor.
            let desc = unsafe { r.descriptor() };
            desc.helper_try_complete(session.clock(), &self.state, r);
            if opened {
                host.abort_op();
            }
            return false;
        }
        if r.val != expected.into_raw() {
            if opened {
                host.abort_op();
            }
            return false;
        }

        debug_assert_eq!(r.tag(), TAG_VALUE);
        let desc = session.descriptor();
        let added =
            desc.add_to_write_set(self.addr(), r.cnt, expected.into_raw(), desired.into_raw());
        debug_assert!(added, "freshly reinitialized write set rejected an entry");

        // Failure here means the epoch advancer already aborted this
        // instance; install then rolls back through owner_try_complete.
        let observed = desc.status().load();
        desc.status().set_ready(observed);

        let new_r = Annotated::new(session.descriptor_addr(), r.cnt + 1);
        if !self.state.compare_exchange(r, new_r) {
            if opened {
                host.abort_op();
            }
            return false;
        }

        desc.owner_try_complete(session.clock());
        if desc.status().load().is_committed() {
            if opened {
                host.end_op();
            }
            true
        } else {
            if opened {
                host.abort_op();
            }
            false
        }
    }

    /// Transactional load. Outside a transaction this is `load`; inside, an
    /// own-descriptor hit returns the pending write (flagging the read as
    /// speculative and entering rolling-CAS mode), and a plain value is
    /// remembered in the pending-reads carrier for commit-time validation.
    pub fn tx_load_speculative<H: OpLifecycle>(&self, host: &H) -> (T, bool) {
        let session = host.session();
        if !session.is_inside_txn() {
            return (self.load(host), false);
        }
        loop {
            let r = self.state.load();
            if r.is_descriptor() {
                if session.is_own_descriptor(r.val) {
                    session.set_rolling_cas();
                    let entry = session
                        .descriptor()
                        .write_entry(self.addr())
                        .expect("own descriptor installed without a write-set entry");
                    debug_assert_eq!(r.cnt - 1, entry.old_cnt);
                    return (T::from_raw(entry.new_val), true);
                }
                // SAFETY: tag says descriptor.
                let desc = unsafe { r.descriptor() };
                desc.helper_try_complete(session.clock(), &self.state, r);
                continue;
            }
            session.note_pending_read(self.addr(), r);
            return (T::from_raw(r.val), false);
        }
    }

    pub fn tx_load<H: OpLifecycle>(&self, host: &H) -> T {
        self.tx_load_speculative(host).0
    }

    /// Transactional compare-exchange.
    ///
    /// `pub_point` enters rolling-CAS mode: from here on, writes accumulate
    /// in the descriptor instead of publishing individually. `lin_point`
    /// marks the operation's linearization point; when the CAS succeeds
    /// there, rolling-CAS mode ends and the surrounding `tx_end` becomes the
    /// commit point for everything recorded.
    ///
    /// A write-set entry that contradicts an earlier read or write aborts
    /// the whole transaction (`Err`); the caller propagates the abort.
    pub fn tx_compare_exchange<H: OpLifecycle>(
        &self,
        host: &H,
        expected: T,
        desired: T,
        pub_point: bool,
        lin_point: bool,
    ) -> Result<CasOutcome, Abort> {
        let session = host.session();
        if !session.is_inside_txn() {
            let ok = if lin_point {
                self.cas_verify(host, expected, desired)
            } else {
                self.cas(host, expected, desired)
            };
            return Ok(if ok {
                CasOutcome::Committed
            } else {
                CasOutcome::Failed
            });
        }

        if pub_point {
            session.set_rolling_cas();
        }

        let r = self.state.load();
        let mut own_installed = false;
        if r.is_descriptor() {
            if session.is_own_descriptor(r.val) {
                // Usually hit by loads rather than CAS, but legal.
                session.set_rolling_cas();
                own_installed = true;
                debug_assert_eq!(
                    session
                        .descriptor()
                        .write_entry(self.addr())
                        .map(|e| e.new_val),
                    Some(expected.into_raw())
                );
            } else {
                // SAFETY: tag says descriptor.
                let desc = unsafe { r.descriptor() };
                desc.helper_try_complete(session.clock(), &self.state, r);
                return Ok(CasOutcome::Failed);
            }
        } else if r.val != expected.into_raw() {
            return Ok(CasOutcome::Failed);
        }

        if session.is_rolling_cas() {
            let desc = session.descriptor();
            if !desc.add_to_write_set(
                self.addr(),
                r.cnt & !TAG_MASK,
                expected.into_raw(),
                desired.into_raw(),
            ) {
                return Err(host.rollback_txn());
            }
            let mut outcome = CasOutcome::Failed;
            if own_installed {
                outcome = CasOutcome::Speculative;
            } else {
                let new_r = Annotated::new(session.descriptor_addr(), r.cnt + 1);
                if self.state.compare_exchange(r, new_r) {
                    outcome = CasOutcome::Speculative;
                }
            }
            if outcome == CasOutcome::Failed {
                desc.remove_from_write_set(self.addr());
            } else if lin_point {
                session.reset_rolling_cas();
            }
            Ok(outcome)
        } else {
            Ok(if self.cas(host, expected, desired) {
                CasOutcome::Committed
            } else {
                CasOutcome::Failed
            })
        }
    }

    /// Transactional store: updates the pending write in place when our
    /// descriptor already owns the cell, installs it otherwise.
    pub fn tx_store<H: OpLifecycle>(&self, host: &H, desired: T) -> Result<(), Abort> {
        let session = host.session();
        if !session.is_inside_txn() {
            return self.store_verify(host, desired);
        }
        loop {
            let r = self.state.load();
            if r.is_descriptor() {
                if session.is_own_descriptor(r.val) {
                    session.set_rolling_cas();
                    session.descriptor().update_write_set_unchecked(
                        self.addr(),
                        r.cnt & !TAG_MASK,
                        desired.into_raw(),
                    );
                    return Ok(());
                }
                // SAFETY: tag says descriptor.
                let desc = unsafe { r.descriptor() };
                desc.helper_try_complete(session.clock(), &self.state, r);
                continue;
            }
            let desc = session.descriptor();
            if !desc.add_to_write_set(self.addr(), r.cnt, r.val, desired.into_raw()) {
                return Err(host.rollback_txn());
            }
            let new_r = Annotated::new(session.descriptor_addr(), r.cnt + 1);
            if self.state.compare_exchange(r, new_r) {
                return Ok(());
            }
        }
    }
}

impl<T: Word> std::fmt::Debug for VersionedCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let r = self.state.load();
        f.debug_struct("VersionedCell")
            .field("val", &r.val)
            .field("cnt", &r.cnt)
            .finish()
    }
}

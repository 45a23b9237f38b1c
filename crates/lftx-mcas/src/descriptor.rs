// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::cell::{state_at, Annotated, CellState};
use crate::clock::{EpochClock, NULL_EPOCH};
use crate::slab::{EntryValue, SlabMap};
use crate::status::{AtomicStatus, StatusWord, TxState};
use crossbeam::utils::CachePadded;
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// Upper bound on registered threads, dictated by the 14-bit tid field of
/// the packed status word.
pub const MAX_THREADS: usize = 1 << 14;

/// One pending write: the counter and value the cell held when the
/// descriptor was installed, and the value to publish on commit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WriteEntry {
    pub old_cnt: u64,
    pub old_val: u64,
    pub new_val: u64,
}

impl EntryValue for WriteEntry {
    fn store_into(&self, slots: &[AtomicU64; 3]) {
        slots[0].store(self.old_cnt, Ordering::Relaxed);
        slots[1].store(self.old_val, Ordering::Relaxed);
        slots[2].store(self.new_val, Ordering::Relaxed);
    }

    fn load_from(slots: &[AtomicU64; 3]) -> Self {
        WriteEntry {
            old_cnt: slots[0].load(Ordering::Relaxed),
            old_val: slots[1].load(Ordering::Relaxed),
            new_val: slots[2].load(Ordering::Relaxed),
        }
    }
}

const READ_SET_SLAB: usize = 127;
const WRITE_SET_SLAB: usize = 102;

/// Per-thread transaction descriptor.
///
/// Owned by exactly one thread; read concurrently by helpers. Helpers never
/// write anything except the status word and the cells named by the write
/// set, and they revalidate the status-word snapshot before trusting either
/// slab, so a reused (reinitialized) instance makes them walk away.
pub struct Descriptor {
    read_set: SlabMap<Annotated>,
    write_set: SlabMap<WriteEntry>,
    epoch: AtomicU64,
    status: AtomicStatus,
}

impl Descriptor {
    fn new(tid: u64) -> Self {
        Descriptor {
            read_set: SlabMap::with_slab_capacity(READ_SET_SLAB),
            write_set: SlabMap::with_slab_capacity(WRITE_SET_SLAB),
            epoch: AtomicU64::new(NULL_EPOCH),
            status: AtomicStatus::new(StatusWord::pack(tid, 0, TxState::InPrep)),
        }
    }

    pub fn addr(&self) -> u64 {
        self as *const Descriptor as u64
    }

    pub fn status(&self) -> &AtomicStatus {
        &self.status
    }

    pub fn tid(&self) -> u64 {
        self.status.load().tid()
    }

    pub fn sn(&self) -> u64 {
        self.status.load().sn()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Owner-only; stamps the epoch the next commit will validate against.
    pub fn set_epoch(&self, e: u64) {
        self.epoch.store(e, Ordering::SeqCst);
    }

    pub fn read_set_is_empty(&self) -> bool {
        self.read_set.is_empty()
    }

    pub fn write_set_is_empty(&self) -> bool {
        self.write_set.is_empty()
    }

    pub fn write_entry(&self, addr: usize) -> Option<WriteEntry> {
        self.write_set.get(addr)
    }

    pub fn read_entry(&self, addr: usize) -> Option<Annotated> {
        self.read_set.get(addr)
    }

    /// Owner-only. Prepares the descriptor for the next transaction
    /// instance: the sequence number moves forward so any helper still
    /// holding the previous snapshot is fenced out, and the release fence
    /// keeps its reads from leaking into the new instance's slabs.
    pub fn reinit(&self) {
        self.status.increment_sn_reset_state();
        self.read_set.reset();
        self.write_set.reset();
        fence(Ordering::Release);
    }

    /// Record an observed read. Returns false when the observation
    /// contradicts an earlier read or pending write, in which case the
    /// transaction must abort. Reads covered by our own write set are
    /// speculative and not recorded.
    pub fn add_to_read_set(&self, addr: usize, observed: Annotated) -> bool {
        if let Some(w) = self.write_set.get(addr) {
            return observed.cnt == w.old_cnt && observed.val == w.new_val;
        }
        match self.read_set.get(addr) {
            Some(existing) => existing == observed,
            None => {
                self.read_set.put(addr, observed);
                true
            },
        }
    }

    /// Record a pending write. Returns false on inconsistency with an
    /// earlier read- or write-set entry for the same cell.
    pub fn add_to_write_set(&self, addr: usize, old_cnt: u64, old_val: u64, new_val: u64) -> bool {
        if let Some(w) = self.write_set.get(addr) {
            if w.new_val != old_val || w.old_cnt != old_cnt {
                return false;
            }
            debug_assert!(self
                .read_set
                .get(addr)
                .map_or(true, |r| r.cnt == w.old_cnt));
            self.write_set.put(
                addr,
                WriteEntry {
                    old_cnt: w.old_cnt,
                    old_val: w.old_val,
                    new_val,
                },
            );
        } else {
            if let Some(r) = self.read_set.get(addr) {
                if r.val != old_val || r.cnt != old_cnt {
                    return false;
                }
            }
            self.write_set.put(
                addr,
                WriteEntry {
                    old_cnt,
                    old_val,
                    new_val,
                },
            );
        }
        true
    }

    /// Owner-only, used by transactional stores that found their own
    /// descriptor already installed: the entry must exist and only its
    /// new-value moves.
    pub fn update_write_set_unchecked(&self, addr: usize, old_cnt: u64, new_val: u64) {
        let w = self
            .write_set
            .get(addr)
            .expect("own descriptor installed without a write-set entry");
        debug_assert!(w.old_cnt == old_cnt || self.status.load().is_aborted());
        self.write_set.put(
            addr,
            WriteEntry {
                old_cnt: w.old_cnt,
                old_val: w.old_val,
                new_val,
            },
        );
    }

    pub fn remove_from_write_set(&self, addr: usize) {
        self.write_set.remove(addr);
    }

    /// Owner-side read validation. Write-set hits were validated when the
    /// entry was added; everything else must still carry the observed
    /// `(value, counter)`.
    pub fn owner_validate_reads(&self) -> bool {
        for (addr, observed) in self.read_set.iter() {
            if let Some(w) = self.write_set.get(addr) {
                debug_assert!(w.old_val == observed.val && w.old_cnt == observed.cnt);
            } else {
                // SAFETY: read-set addresses reference cells the enclosing
                // operation keeps alive via the reclamation tracker.
                if unsafe { state_at(addr) }.load() != observed {
                    return false;
                }
            }
        }
        true
    }

    /// Helper-side read validation: same comparison, but the status-word
    /// snapshot is re-checked after every iteration so a reinitialized
    /// descriptor cannot fool us into validating the wrong instance.
    fn helper_validate_reads(&self, snapshot: StatusWord) -> bool {
        for (addr, observed) in self.read_set.iter() {
            if self.write_set.iter().any(|(a, _)| a == addr) {
                continue;
            }
            // SAFETY: see owner_validate_reads; staleness is caught by the
            // snapshot check below.
            if unsafe { state_at(addr) }.load() != observed {
                return false;
            }
            if !snapshot.matches(self.status.load()) {
                return false;
            }
        }
        true
    }

    /// Entry point for any thread that found this descriptor installed in
    /// `cell` with annotation `observed`. Drives the transaction to a
    /// terminal state and uninstalls it; loses every race silently.
    pub fn helper_try_complete(&self, clock: &EpochClock, cell: &CellState, observed: Annotated) {
        // Load the snapshot first, then reconfirm the cell: if the cell
        // moved on, the snapshot may describe a different instance.
        let mut snapshot = self.status.load();
        if cell.load() != observed {
            return;
        }

        if snapshot.is_in_prep() {
            // An installed descriptor still in preparation belongs to a
            // transaction that has not reached tx_end; cancel it.
            self.status.abort(snapshot);
            let refreshed = self.status.load();
            if !snapshot.matches(refreshed) {
                return;
            }
            snapshot = refreshed;
        }

        if snapshot.is_in_progress() {
            if self.helper_validate_reads(snapshot) && clock.check(self.epoch()) {
                self.status.commit(snapshot);
            } else {
                self.status.abort(snapshot);
            }
        }

        self.helper_uninstall(snapshot);
    }

    /// Owner path after install: the owner knows its descriptor is in place,
    /// so the cell-still-references-me check is unnecessary.
    pub fn owner_try_complete(&self, clock: &EpochClock) {
        let snapshot = self.status.load();
        debug_assert!(!snapshot.is_in_prep());
        debug_assert!(!self.write_set.is_empty());
        if snapshot.is_in_progress() {
            if self.owner_validate_reads() && clock.check(self.epoch()) {
                self.status.commit(snapshot);
            } else {
                self.status.abort(snapshot);
            }
        }
        self.owner_uninstall();
    }

    /// Used by the epoch advancer to cancel transactions whose epoch is
    /// about to expire. Fails silently when the epoch moved on or the
    /// descriptor is already terminal; the advancer never cleans up cells.
    pub fn try_abort(&self, expected_epoch: u64) {
        let snapshot = self.status.load();
        if self.epoch() == expected_epoch
            && (snapshot.is_in_prep() || snapshot.is_in_progress())
        {
            self.status.abort(snapshot);
        }
    }

    /// Walk the write set and swing every installed cell to its post-state.
    /// Any thread may run this; the snapshot revalidation between the entry
    /// load and each uninstall CAS stops us the moment the owner moves to
    /// the next instance (its uninstall already ran).
    pub(crate) fn helper_uninstall(&self, old_snapshot: StatusWord) {
        let snapshot = self.status.load();
        debug_assert!(
            snapshot.is_committed() || snapshot.is_aborted() || !snapshot.matches(old_snapshot)
        );
        if !old_snapshot.matches(snapshot) {
            return;
        }
        let committed = snapshot.is_committed();
        for (addr, entry) in self.write_set.iter() {
            // The entry load is ordered against the owner's release store
            // of the slot; if the fence-protected snapshot check still
            // matches, the entry data is from this instance.
            fence(Ordering::Acquire);
            if !snapshot.matches(self.status.load()) {
                return;
            }
            let expected = Annotated::new(self.addr(), entry.old_cnt + 1);
            let desired = Annotated::new(
                if committed { entry.new_val } else { entry.old_val },
                entry.old_cnt + 4,
            );
            // SAFETY: write-set addresses reference cells kept alive for
            // the duration of the transaction instance.
            unsafe { state_at(addr) }.compare_exchange(expected, desired);
        }
    }

    /// Owner-only uninstall: no snapshot revalidation needed, nobody else
    /// can reinitialize the descriptor under us.
    pub fn owner_uninstall(&self) {
        let snapshot = self.status.load();
        debug_assert!(!snapshot.is_in_progress());
        let committed = snapshot.is_committed();
        for (addr, entry) in self.write_set.iter() {
            let expected = Annotated::new(self.addr(), entry.old_cnt + 1);
            let desired = Annotated::new(
                if committed { entry.new_val } else { entry.old_val },
                entry.old_cnt + 4,
            );
            // SAFETY: see helper_uninstall.
            unsafe { state_at(addr) }.compare_exchange(expected, desired);
        }
    }
}

/// Fixed arena of descriptors, one per registered thread, allocated once and
/// never freed. Cells reference descriptors by raw address; the pool's
/// stable addresses are what make a helper's bounded stale dereference safe.
pub struct DescriptorPool {
    slots: Box<[CachePadded<Descriptor>]>,
}

impl DescriptorPool {
    pub fn new(threads: usize) -> Self {
        assert!(threads > 0 && threads <= MAX_THREADS);
        DescriptorPool {
            slots: (0..threads)
                .map(|tid| CachePadded::new(Descriptor::new(tid as u64)))
                .collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn descriptor(&self, tid: usize) -> &Descriptor {
        &self.slots[tid]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Descriptor> {
        self.slots.iter().map(|slot| &**slot)
    }
}

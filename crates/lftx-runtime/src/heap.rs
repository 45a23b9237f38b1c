// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

//! Payload blocks and the slab-backed heap that stands in for the
//! persistent allocator.
//!
//! Every block carries a header tagging it with `{epoch, kind, id, tid_sn}`;
//! the runtime's reclaim/persist state machine interprets only the header
//! and treats the payload as opaque. Heaps are registered globally by name
//! so that their contents outlive a runtime instance, which is what makes
//! crash-recovery tests meaningful.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::any::Any;
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use lftx_mcas::NULL_EPOCH;

const CHUNK_SLOTS: usize = 1024;

/// Lifecycle tag of a payload block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockKind {
    Init = 0,
    Alloc = 1,
    Update = 2,
    Delete = 3,
    Epoch = 4,
    Owned = 5,
    Descriptor = 6,
    Reclaimed = 7,
}

impl BlockKind {
    fn from_u64(v: u64) -> BlockKind {
        match v {
            0 => BlockKind::Init,
            1 => BlockKind::Alloc,
            2 => BlockKind::Update,
            3 => BlockKind::Delete,
            4 => BlockKind::Epoch,
            5 => BlockKind::Owned,
            6 => BlockKind::Descriptor,
            7 => BlockKind::Reclaimed,
            other => panic!("wrong type of block discovered: {}", other),
        }
    }
}

const SN_MASK: u64 = 0xffff_ffff_ffff;
const TID_SHIFT: u32 = 50;

/// Header shared by every block in a heap.
#[repr(C)]
pub struct BlockHeader {
    epoch: AtomicU64,
    kind: AtomicU64,
    id: AtomicU64,
    tid_sn: AtomicU64,
    retire: AtomicPtr<BlockHeader>,
}

impl BlockHeader {
    fn reset(&self) {
        self.epoch.store(NULL_EPOCH, Ordering::SeqCst);
        self.kind.store(BlockKind::Init as u64, Ordering::SeqCst);
        self.id.store(0, Ordering::SeqCst);
        self.tid_sn.store(0, Ordering::SeqCst);
        self.retire.store(ptr::null_mut(), Ordering::SeqCst);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn set_epoch(&self, e: u64) {
        self.epoch.store(e, Ordering::SeqCst);
    }

    pub fn kind(&self) -> BlockKind {
        BlockKind::from_u64(self.kind.load(Ordering::SeqCst))
    }

    pub fn set_kind(&self, kind: BlockKind) {
        self.kind.store(kind as u64, Ordering::SeqCst);
    }

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::SeqCst)
    }

    pub fn set_id(&self, id: u64) {
        self.id.store(id, Ordering::SeqCst);
    }

    pub fn tid(&self) -> u64 {
        self.tid_sn.load(Ordering::SeqCst) >> TID_SHIFT
    }

    pub fn sn(&self) -> u64 {
        (self.tid_sn.load(Ordering::SeqCst) >> 2) & SN_MASK
    }

    pub fn set_tid_sn(&self, tid: u64, sn: u64) {
        assert!(tid < (1 << 14) && sn <= SN_MASK);
        self.tid_sn
            .store((tid << TID_SHIFT) | (sn << 2), Ordering::SeqCst);
    }

    pub fn raw_tid_sn(&self) -> u64 {
        self.tid_sn.load(Ordering::SeqCst)
    }

    pub fn set_raw_tid_sn(&self, v: u64) {
        self.tid_sn.store(v, Ordering::SeqCst);
    }

    pub fn retired(&self) -> bool {
        !self.retire.load(Ordering::SeqCst).is_null()
    }

    pub fn retire_marker(&self) -> Option<NonNull<BlockHeader>> {
        NonNull::new(self.retire.load(Ordering::SeqCst))
    }

    pub fn set_retire_marker(&self, anti: Option<NonNull<BlockHeader>>) {
        self.retire.store(
            anti.map_or(ptr::null_mut(), NonNull::as_ptr),
            Ordering::SeqCst,
        );
    }
}

/// Type-erased handle to a heap block: header pointer plus the byte length
/// of the full slot (the range persistence flushes).
///
/// Heaps are retained in the global registry until explicitly destroyed, so
/// handles stay dereferenceable for the life of the process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RawBlock {
    header: NonNull<BlockHeader>,
    len: usize,
}

unsafe impl Send for RawBlock {}
unsafe impl Sync for RawBlock {}

impl RawBlock {
    pub fn header(&self) -> &BlockHeader {
        // SAFETY: see type-level comment on handle validity.
        unsafe { self.header.as_ref() }
    }

    pub fn header_ptr(&self) -> NonNull<BlockHeader> {
        self.header
    }

    pub fn addr(&self) -> usize {
        self.header.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn range(&self) -> (usize, usize) {
        (self.addr(), self.len)
    }
}

/// Typed handle into a `SlabHeap<P>`.
pub struct BlockRef<P> {
    raw: RawBlock,
    _marker: std::marker::PhantomData<fn() -> P>,
}

impl<P> Clone for BlockRef<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for BlockRef<P> {}

impl<P> std::fmt::Debug for BlockRef<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRef").field("raw", &self.raw).finish()
    }
}

impl<P> BlockRef<P> {
    fn new(raw: RawBlock) -> Self {
        BlockRef {
            raw,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn raw(&self) -> RawBlock {
        self.raw
    }

    pub fn header(&self) -> &BlockHeader {
        self.raw.header()
    }
}

#[repr(C)]
struct Slot<P> {
    header: BlockHeader,
    allocated: AtomicBool,
    data: UnsafeCell<MaybeUninit<P>>,
}

unsafe impl<P: Send> Send for Slot<P> {}
unsafe impl<P: Send + Sync> Sync for Slot<P> {}

impl<P> Slot<P> {
    fn empty() -> Self {
        Slot {
            header: BlockHeader {
                epoch: AtomicU64::new(NULL_EPOCH),
                kind: AtomicU64::new(BlockKind::Init as u64),
                id: AtomicU64::new(0),
                tid_sn: AtomicU64::new(0),
                retire: AtomicPtr::new(ptr::null_mut()),
            },
            allocated: AtomicBool::new(false),
            data: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Per-thread id source for payload blocks; ids are unique across the heap
/// for the life of the process.
pub struct UidGenerator {
    counters: Vec<crossbeam::utils::CachePadded<AtomicU64>>,
}

impl UidGenerator {
    pub fn new(threads: usize) -> Self {
        UidGenerator {
            counters: (0..threads)
                .map(|_| crossbeam::utils::CachePadded::new(AtomicU64::new(0)))
                .collect(),
        }
    }

    pub fn next_id(&self, tid: usize) -> u64 {
        let seq = self.counters[tid].fetch_add(1, Ordering::Relaxed) + 1;
        ((tid as u64) << 48) | seq
    }
}

static HEAP_REGISTRY: Lazy<Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Slab allocator for payload blocks with a recover iterator.
///
/// The heap models the persistence domain: contents survive a runtime drop
/// (the registry keeps the heap alive under its name) and a simulated
/// crash; the flush/fence capability is the seam where a real persistent
/// medium would plug in.
pub struct SlabHeap<P> {
    name: String,
    chunks: Mutex<Vec<Box<[Slot<P>]>>>,
    free_list: Mutex<Vec<NonNull<Slot<P>>>>,
    dirty: AtomicBool,
}

unsafe impl<P: Send> Send for SlabHeap<P> {}
unsafe impl<P: Send + Sync> Sync for SlabHeap<P> {}

impl<P: Send + Sync + 'static> SlabHeap<P> {
    /// Open (or create) the named heap. Reopening after a crash or clean
    /// shutdown hands back the same contents.
    pub fn open(name: &str) -> Arc<SlabHeap<P>> {
        let mut registry = HEAP_REGISTRY.lock();
        if let Some(existing) = registry.get(name) {
            return match Arc::clone(existing).downcast::<SlabHeap<P>>() {
                Ok(heap) => heap,
                Err(_) => panic!("heap '{}' reopened with a different payload type", name),
            };
        }
        let heap = Arc::new(SlabHeap {
            name: name.to_string(),
            chunks: Mutex::new(Vec::new()),
            free_list: Mutex::new(Vec::new()),
            dirty: AtomicBool::new(false),
        });
        registry.insert(name.to_string(), heap.clone());
        heap
    }

    /// Drop the named heap image entirely (tests).
    pub fn destroy(name: &str) {
        HEAP_REGISTRY.lock().remove(name);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the last session against this heap exited cleanly.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn mark_clean(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }

    fn grow(&self) {
        let chunk: Box<[Slot<P>]> = (0..CHUNK_SLOTS).map(|_| Slot::empty()).collect();
        let mut free = self.free_list.lock();
        for slot in chunk.iter() {
            free.push(NonNull::from(slot));
        }
        self.chunks.lock().push(chunk);
    }

    /// Allocate a block holding `value`. The header starts at
    /// `{NULL_EPOCH, Init, 0, 0}`; epoch tagging happens when the owning
    /// operation registers the allocation.
    pub fn alloc(&self, value: P) -> BlockRef<P> {
        let slot = loop {
            if let Some(slot) = self.free_list.lock().pop() {
                break slot;
            }
            self.grow();
        };
        // SAFETY: the slot came off the free list, so we have exclusive
        // access until `allocated` is published.
        unsafe {
            let slot_ref = slot.as_ref();
            slot_ref.header.reset();
            (*slot_ref.data.get()).write(value);
            slot_ref.allocated.store(true, Ordering::Release);
        }
        BlockRef::new(RawBlock {
            header: slot.cast::<BlockHeader>(),
            len: std::mem::size_of::<Slot<P>>(),
        })
    }

    fn slot_of(&self, block: RawBlock) -> NonNull<Slot<P>> {
        // Header is the first field of the repr(C) slot.
        block.header.cast::<Slot<P>>()
    }

    /// Rebuild a handle from a header address previously obtained from this
    /// heap (e.g. a retire-marker back-pointer).
    pub fn block_at(&self, header_addr: usize) -> RawBlock {
        RawBlock {
            header: NonNull::new(header_addr as *mut BlockHeader)
                .expect("null block header address"),
            len: std::mem::size_of::<Slot<P>>(),
        }
    }

    /// Return a block to the free list, dropping its payload.
    ///
    /// Double frees are programmer errors against the reclamation contract
    /// and abort the process.
    pub fn dealloc(&self, block: RawBlock) {
        let slot = self.slot_of(block);
        // SAFETY: handle validity per RawBlock contract.
        unsafe {
            let slot_ref = slot.as_ref();
            assert!(
                slot_ref.allocated.swap(false, Ordering::AcqRel),
                "double free of a payload block"
            );
            slot_ref.header.epoch.store(NULL_EPOCH, Ordering::SeqCst);
            (*slot_ref.data.get()).assume_init_drop();
        }
        self.free_list.lock().push(slot);
    }

    /// Read the payload of an allocated block.
    ///
    /// # Safety
    ///
    /// `block` must be a live allocation of this heap; callers inherit the
    /// reclamation contract that keeps it alive for the read.
    pub unsafe fn payload(&self, block: RawBlock) -> &P {
        let slot = self.slot_of(block);
        debug_assert!(slot.as_ref().allocated.load(Ordering::Acquire));
        (*slot.as_ref().data.get()).assume_init_ref()
    }

    pub fn payload_of(&self, block: BlockRef<P>) -> &P {
        // SAFETY: a typed BlockRef is only produced by this heap's alloc.
        unsafe { self.payload(block.raw()) }
    }

    /// Mutable payload access for a block not yet published.
    ///
    /// # Safety
    ///
    /// The calling thread must have exclusive access to the block: either
    /// it was just allocated and no pointer to it has been shared, or the
    /// caller owns it through some external protocol.
    pub unsafe fn payload_mut(&self, block: BlockRef<P>) -> &mut P {
        let slot = self.slot_of(block.raw());
        debug_assert!(slot.as_ref().allocated.load(Ordering::Acquire));
        (*slot.as_ref().data.get()).assume_init_mut()
    }

    /// Attach the payload type to a raw handle known to come from this
    /// heap (e.g. a block returned by recovery).
    pub fn typed(&self, raw: RawBlock) -> BlockRef<P> {
        BlockRef::new(raw)
    }

    /// Recover iterator: every allocated block currently in the heap, in
    /// address order. Used by the two-pass recovery scan.
    pub fn scan(&self) -> Vec<RawBlock> {
        let chunks = self.chunks.lock();
        let mut blocks = Vec::new();
        for chunk in chunks.iter() {
            for slot in chunk.iter() {
                if slot.allocated.load(Ordering::Acquire) {
                    blocks.push(RawBlock {
                        header: NonNull::from(&slot.header),
                        len: std::mem::size_of::<Slot<P>>(),
                    });
                }
            }
        }
        blocks
    }

    /// Number of live blocks (tests).
    pub fn live_blocks(&self) -> usize {
        self.scan().len()
    }
}

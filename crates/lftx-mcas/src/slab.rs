// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

//! Slab-backed map for read/write sets.
//!
//! The backbone is a Michael-style hash map, but nodes are allocated from
//! chained fixed-size slabs so helper threads can traverse every published
//! entry without chasing heap allocations. Each slab carries an `in_use`
//! watermark; the owner fully constructs an entry before advancing the
//! watermark, and helpers only look at slots below it. A mark bit on a
//! node's in-slab chain pointer is the logical "removed" flag, kept so that
//! traversal by helpers stays cheap (removal is rare and seeing a removed
//! item is benign).
//!
//! Single-writer discipline: the owning thread is the only mutator. Helpers
//! are restricted to [`SlabMap::iter`].

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

const BUCKET_COUNT: usize = 128;

/// Default slab size; keeps a slab (40-byte nodes) within a 4 KiB
/// allocation.
pub(crate) const DEFAULT_SLAB_CAPACITY: usize = 102;

/// Values storable in a slab entry: at most three words, written and read
/// through relaxed atomics so concurrent helper traversal is race-free.
pub trait EntryValue: Copy {
    fn store_into(&self, slots: &[AtomicU64; 3]);
    fn load_from(slots: &[AtomicU64; 3]) -> Self;
}

struct Node {
    key: AtomicUsize,
    next: AtomicPtr<Node>,
    slots: [AtomicU64; 3],
}

impl Node {
    fn empty() -> Self {
        Node {
            key: AtomicUsize::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
            slots: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
        }
    }
}

const MARK: usize = 1;

fn marked(p: *mut Node) -> *mut Node {
    (p as usize | MARK) as *mut Node
}

fn unmarked(p: *mut Node) -> *mut Node {
    (p as usize & !MARK) as *mut Node
}

fn is_marked(p: *mut Node) -> bool {
    p as usize & MARK != 0
}

struct Slab {
    in_use: AtomicUsize,
    next: AtomicPtr<Slab>,
    nodes: Box<[Node]>,
}

impl Slab {
    fn new(capacity: usize) -> Box<Slab> {
        Box::new(Slab {
            in_use: AtomicUsize::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
            nodes: (0..capacity).map(|_| Node::empty()).collect(),
        })
    }
}

/// Append-mostly map from cell address to entry, reusable across descriptor
/// instances via [`SlabMap::reset`].
pub struct SlabMap<V: EntryValue> {
    buckets: Box<[AtomicPtr<Node>]>,
    first: AtomicPtr<Slab>,
    // Owner-only cursor; stored in an atomic so the map stays Sync.
    last: AtomicPtr<Slab>,
    capacity: usize,
    _marker: PhantomData<fn() -> V>,
}

// Nodes hold only atomics; the single-writer discipline covers the rest.
unsafe impl<V: EntryValue> Send for SlabMap<V> {}
unsafe impl<V: EntryValue> Sync for SlabMap<V> {}

impl<V: EntryValue> SlabMap<V> {
    pub fn new() -> Self {
        Self::with_slab_capacity(DEFAULT_SLAB_CAPACITY)
    }

    pub fn with_slab_capacity(capacity: usize) -> Self {
        assert!(capacity > 0);
        let first = Box::into_raw(Slab::new(capacity));
        SlabMap {
            buckets: (0..BUCKET_COUNT)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
            first: AtomicPtr::new(first),
            last: AtomicPtr::new(first),
            capacity,
            _marker: PhantomData,
        }
    }

    fn bucket(&self, key: usize) -> &AtomicPtr<Node> {
        let h = key.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        &self.buckets[(h >> 32) as usize % BUCKET_COUNT]
    }

    /// Owner-only. Reserves the next slot of the last slab and fully
    /// constructs the entry in it. The release fence orders entry
    /// construction with the owner's later status-word stores, which is what
    /// the helper-side uninstall guard relies on.
    fn allocate(&self, key: usize, val: V, chain: *mut Node) -> *mut Node {
        let mut last = self.last.load(Ordering::Relaxed);
        // SAFETY: slabs are only appended and freed in Drop, so `last`
        // stays valid for the lifetime of `&self`.
        unsafe {
            if (*last).in_use.load(Ordering::Relaxed) == self.capacity {
                let mut next = (*last).next.load(Ordering::Relaxed);
                if next.is_null() {
                    next = Box::into_raw(Slab::new(self.capacity));
                    (*last).next.store(next, Ordering::Release);
                }
                debug_assert_eq!((*next).in_use.load(Ordering::Relaxed), 0);
                self.last.store(next, Ordering::Relaxed);
                last = next;
            }
            let idx = (*last).in_use.load(Ordering::Relaxed);
            let node = &(*last).nodes[idx];
            node.key.store(key, Ordering::Relaxed);
            node.next.store(chain, Ordering::Relaxed);
            val.store_into(&node.slots);
            fence(Ordering::Release);
            node as *const Node as *mut Node
        }
    }

    /// Owner-only. Publishes the most recently allocated entry to helpers.
    /// Delaying the watermark bump until the entry is linked means a helper
    /// can never observe a half-constructed slot.
    fn allocate_finalize(&self) {
        let last = self.last.load(Ordering::Relaxed);
        // SAFETY: see `allocate`.
        unsafe {
            let in_use = (*last).in_use.load(Ordering::Relaxed);
            debug_assert!(in_use < self.capacity);
            (*last).in_use.store(in_use + 1, Ordering::Release);
        }
    }

    /// Owner-only traversal. Returns the insertion point for `key`:
    /// predecessor link plus the current node (and its successor) when the
    /// key is present.
    fn find(&self, key: usize) -> (&AtomicPtr<Node>, *mut Node, *mut Node, bool) {
        let mut prev: &AtomicPtr<Node> = self.bucket(key);
        let mut curr = unmarked(prev.load(Ordering::Relaxed));
        loop {
            if curr.is_null() {
                return (prev, curr, ptr::null_mut(), false);
            }
            // SAFETY: published nodes live in slabs owned by `self`.
            let (next, ckey) = unsafe {
                (
                    (*curr).next.load(Ordering::Relaxed),
                    (*curr).key.load(Ordering::Relaxed),
                )
            };
            debug_assert!(!is_marked(next), "owner met a detached entry");
            if ckey >= key {
                return (prev, curr, unmarked(next), ckey == key);
            }
            prev = unsafe { &(*curr).next };
            curr = unmarked(next);
        }
    }

    pub fn get(&self, key: usize) -> Option<V> {
        let (_, curr, _, found) = self.find(key);
        if found {
            // SAFETY: `curr` is a published node of this map.
            Some(unsafe { V::load_from(&(*curr).slots) })
        } else {
            None
        }
    }

    /// Owner-only insert-or-replace. Replacement allocates a fresh slot and
    /// detaches the old one; entries are never mutated in place once
    /// published, so helpers always read internally consistent values.
    pub fn put(&self, key: usize, val: V) -> Option<V> {
        let (prev, curr, next, found) = self.find(key);
        let res;
        if found {
            // SAFETY: `curr` is a published node of this map.
            let node = self.allocate(key, val, next);
            unsafe {
                res = Some(V::load_from(&(*curr).slots));
                debug_assert_eq!(unmarked((*curr).next.load(Ordering::Relaxed)), next);
                (*curr).next.store(marked(next), Ordering::Relaxed);
            }
            prev.store(node, Ordering::Relaxed);
        } else {
            let node = self.allocate(key, val, curr);
            res = None;
            prev.store(node, Ordering::Relaxed);
        }
        self.allocate_finalize();
        res
    }

    /// Owner-only removal; the slot is marked for concurrent iterators and
    /// unlinked immediately.
    pub fn remove(&self, key: usize) -> Option<V> {
        let (prev, curr, next, found) = self.find(key);
        if !found {
            return None;
        }
        // SAFETY: `curr` is a published node of this map.
        let res = unsafe {
            let v = V::load_from(&(*curr).slots);
            (*curr).next.store(marked(next), Ordering::Relaxed);
            v
        };
        prev.store(next, Ordering::Relaxed);
        Some(res)
    }

    pub fn is_empty(&self) -> bool {
        let first = self.first.load(Ordering::Relaxed);
        // SAFETY: the first slab exists for the lifetime of the map.
        unsafe { (*first).in_use.load(Ordering::Acquire) == 0 }
    }

    /// Owner-only. Rewinds the watermarks so the map can be reused by the
    /// next descriptor instance. Helpers racing with a reset are fenced off
    /// by the status-word revalidation in the engine, not here.
    pub fn reset(&self) {
        if self.is_empty() {
            return;
        }
        for bucket in self.buckets.iter() {
            bucket.store(ptr::null_mut(), Ordering::Relaxed);
        }
        let mut slab = self.first.load(Ordering::Relaxed);
        self.last.store(slab, Ordering::Relaxed);
        while !slab.is_null() {
            // SAFETY: slab chain is owned by `self`.
            unsafe {
                let in_use = (*slab).in_use.load(Ordering::Relaxed);
                (*slab).in_use.store(0, Ordering::Relaxed);
                if in_use < self.capacity {
                    break;
                }
                slab = (*slab).next.load(Ordering::Relaxed);
            }
        }
    }

    /// Snapshot traversal over published, non-removed entries. Safe to call
    /// from any thread; the watermark observed at slab entry bounds the
    /// walk, so a concurrent append is simply not seen.
    pub fn iter(&self) -> Iter<'_, V> {
        let slab = self.first.load(Ordering::Acquire);
        Iter::new(slab, self.capacity)
    }
}

impl<V: EntryValue> Default for SlabMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: EntryValue> Drop for SlabMap<V> {
    fn drop(&mut self) {
        let mut slab = self.first.load(Ordering::Relaxed);
        while !slab.is_null() {
            // SAFETY: slabs were created by Box::into_raw and are owned
            // exclusively here.
            unsafe {
                let next = (*slab).next.load(Ordering::Relaxed);
                drop(Box::from_raw(slab));
                slab = next;
            }
        }
    }
}

pub struct Iter<'a, V: EntryValue> {
    slab: *const Slab,
    idx: usize,
    watermark: usize,
    capacity: usize,
    _marker: PhantomData<&'a SlabMap<V>>,
}

impl<'a, V: EntryValue> Iter<'a, V> {
    fn new(slab: *const Slab, capacity: usize) -> Self {
        let watermark = if slab.is_null() {
            0
        } else {
            // SAFETY: slabs outlive the borrow held by the iterator.
            unsafe { (*slab).in_use.load(Ordering::Acquire) }
        };
        Iter {
            slab,
            idx: 0,
            watermark,
            capacity,
            _marker: PhantomData,
        }
    }
}

impl<'a, V: EntryValue> Iterator for Iter<'a, V> {
    type Item = (usize, V);

    fn next(&mut self) -> Option<(usize, V)> {
        loop {
            if self.slab.is_null() {
                return None;
            }
            if self.idx == self.watermark {
                if self.watermark < self.capacity {
                    // Partially filled slab: this is the frontier.
                    return None;
                }
                // SAFETY: slabs outlive the borrow held by the iterator.
                self.slab = unsafe { (*self.slab).next.load(Ordering::Acquire) };
                self.idx = 0;
                self.watermark = if self.slab.is_null() {
                    0
                } else {
                    unsafe { (*self.slab).in_use.load(Ordering::Acquire) }
                };
                continue;
            }
            // SAFETY: `idx` is below the published watermark of a live slab.
            let node = unsafe { &(*self.slab).nodes[self.idx] };
            self.idx += 1;
            if is_marked(node.next.load(Ordering::Relaxed)) {
                continue;
            }
            let key = node.key.load(Ordering::Relaxed);
            return Some((key, V::load_from(&node.slots)));
        }
    }
}

// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

//! Lock-free hash map: fixed bucket array of Michael-style ordered lists.
//!
//! Node links are versioned cells, so every link update cooperates with
//! in-flight transaction descriptors. Logical deletion marks a node's
//! `next` pointer; physical detachment is helped by any traversal and, for
//! operations inside a transaction, deferred to the commit cleanups.

use crate::map::ConcurrentMap;
use crossbeam::utils::CachePadded;
use lftx_runtime::{
    Abort, BlockRef, CasOutcome, EpochSystem, OpLifecycle, Retired, SlabHeap, TxHandle,
    VersionedCell,
};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ptr;
use std::sync::Arc;

type Payload<K, V> = (K, V);

struct Node<K, V> {
    key: K,
    next: VersionedCell<*mut Node<K, V>>,
    payload: Option<BlockRef<Payload<K, V>>>,
}

const MARK: usize = 1;

fn marked<K, V>(p: *mut Node<K, V>) -> *mut Node<K, V> {
    (p as usize | MARK) as *mut Node<K, V>
}

fn unmarked<K, V>(p: *mut Node<K, V>) -> *mut Node<K, V> {
    (p as usize & !MARK) as *mut Node<K, V>
}

fn is_marked<K, V>(p: *mut Node<K, V>) -> bool {
    p as usize & MARK != 0
}

struct Position<K, V> {
    prev: *const VersionedCell<*mut Node<K, V>>,
    curr: *mut Node<K, V>,
    next: *mut Node<K, V>,
}

pub struct LfHashMap<K, V> {
    buckets: Box<[CachePadded<VersionedCell<*mut Node<K, V>>>]>,
    heap: Arc<SlabHeap<Payload<K, V>>>,
}

// Nodes are shared through the cells under the reclamation protocol.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for LfHashMap<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for LfHashMap<K, V> {}

impl<K, V> LfHashMap<K, V>
where
    K: Ord + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(index_size: usize, heap_name: &str) -> LfHashMap<K, V> {
        LfHashMap {
            buckets: (0..index_size)
                .map(|_| CachePadded::new(VersionedCell::new(ptr::null_mut())))
                .collect(),
            heap: SlabHeap::open(heap_name),
        }
    }

    pub fn heap(&self) -> &Arc<SlabHeap<Payload<K, V>>> {
        &self.heap
    }

    fn bucket(&self, key: &K) -> &VersionedCell<*mut Node<K, V>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.buckets[(hasher.finish() as usize) % self.buckets.len()]
    }

    fn new_node(&self, handle: &TxHandle, key: K, value: V) -> *mut Node<K, V> {
        let payload = handle.alloc_payload(&self.heap, (key.clone(), value));
        let node = Box::into_raw(Box::new(Node {
            key,
            next: VersionedCell::new(ptr::null_mut()),
            payload: Some(payload),
        }));
        // The abort-path destructor must also withdraw the payload from
        // the pending allocations, which the handle's release closure does.
        let release = handle.deferred_payload_release(&self.heap, payload);
        handle.track_transient(
            node as usize,
            // SAFETY (deferred): run at most once, when unreachable.
            Retired::new(move || {
                unsafe { drop(Box::from_raw(node)) };
                release.run();
            }),
        );
        node
    }

    /// Destructor for a published node (and the payload it owns), run once
    /// no thread can still observe it.
    fn node_destructor(&self, handle: &TxHandle, node: *mut Node<K, V>) -> Retired {
        let sys = Arc::clone(handle.system());
        let heap = Arc::clone(&self.heap);
        Retired::new(move || {
            // SAFETY: run at most once, after the grace period.
            let boxed = unsafe { Box::from_raw(node) };
            if let Some(payload) = boxed.payload {
                EpochSystem::preclaim_deferred(&sys, &heap, payload.raw());
            }
        })
    }

    /// Eagerly destroy a node that was never published.
    fn delete_node(&self, handle: &TxHandle, node: *mut Node<K, V>) {
        if let Some(dealloc) = handle.untrack_transient(node as usize) {
            dealloc.run();
            return;
        }
        // SAFETY: the node never became reachable from the map.
        let boxed = unsafe { Box::from_raw(node) };
        if let Some(payload) = boxed.payload {
            handle.reclaim_payload(&self.heap, payload);
        }
    }

    fn retire_node(&self, handle: &TxHandle, node: *mut Node<K, V>) {
        let cleanup = self.node_destructor(handle, node);
        handle.retire_transient(node as usize, cleanup);
    }

    fn retire_node_tentative(&self, handle: &TxHandle, node: *mut Node<K, V>) {
        let cleanup = self.node_destructor(handle, node);
        handle.retire_transient_tentative(node as usize, cleanup);
    }

    fn payload_value(&self, node: *mut Node<K, V>) -> V {
        // SAFETY: `node` is protected by the enclosing operation; the node
        // was found before the operation acquired its epoch, so the read
        // can never be old-sees-new.
        let payload = unsafe { &*node }.payload.expect("map node without payload");
        self.heap.payload_of(payload).1.clone()
    }

    fn payload_of(&self, node: *mut Node<K, V>) -> BlockRef<Payload<K, V>> {
        // SAFETY: see payload_value.
        unsafe { &*node }.payload.expect("map node without payload")
    }

    /// Harris-style traversal. Marked nodes met on the way are detached
    /// (helping whoever marked them); a lost detach race restarts the
    /// scan.
    fn find_node(
        &self,
        handle: &TxHandle,
        key: &K,
    ) -> Result<(bool, Position<K, V>), Abort> {
        'restart: loop {
            let mut prev: *const VersionedCell<*mut Node<K, V>> =
                self.bucket(key) as *const _;
            // SAFETY: `prev` always points at a bucket cell or at a node
            // kept alive by the tracker op this traversal runs under.
            let mut curr = unsafe { &*prev }.tx_load(handle);
            loop {
                if unmarked(curr).is_null() {
                    return Ok((
                        false,
                        Position {
                            prev,
                            curr: ptr::null_mut(),
                            next: ptr::null_mut(),
                        },
                    ));
                }
                let curr_ref = unsafe { &*unmarked(curr) };
                let next = curr_ref.next.tx_load(handle);
                let cmark = is_marked(next);
                if unsafe { &*prev }.tx_load(handle) != unmarked(curr) {
                    continue 'restart;
                }
                if !cmark {
                    if curr_ref.key >= *key {
                        return Ok((
                            curr_ref.key == *key,
                            Position {
                                prev,
                                curr: unmarked(curr),
                                next: unmarked(next),
                            },
                        ));
                    }
                    prev = &curr_ref.next as *const _;
                } else {
                    match unsafe { &*prev }.tx_compare_exchange(
                        handle,
                        unmarked(curr),
                        unmarked(next),
                        false,
                        false,
                    )? {
                        CasOutcome::Failed => continue 'restart,
                        CasOutcome::Committed => self.retire_node(handle, unmarked(curr)),
                        // Speculative removal: the node really goes away
                        // only if the surrounding transaction commits.
                        CasOutcome::Speculative => {
                            self.retire_node_tentative(handle, unmarked(curr))
                        },
                    }
                    // When the helping CAS removes a marked predecessor,
                    // the linearizing read moves to that CAS; the read to
                    // validate is the prev/curr pair at that moment.
                }
                curr = next;
            }
        }
    }

    /// Rebuild the index from blocks that survived recovery.
    /// Single-session use: call before the map is shared.
    pub fn reindex(&self, handle: &TxHandle, survivors: &[lftx_runtime::RawBlock]) {
        log::info!("re-indexing {} recovered entries", survivors.len());
        for raw in survivors {
            let payload = self.heap.typed(*raw);
            let key = self.heap.payload_of(payload).0.clone();
            let node = Box::into_raw(Box::new(Node {
                key: key.clone(),
                next: VersionedCell::new(ptr::null_mut()),
                payload: Some(payload),
            }));
            loop {
                let (found, pos) = self
                    .find_node(handle, &key)
                    .expect("re-indexing outside any transaction");
                if found {
                    panic!("conflicting keys recovered");
                }
                // SAFETY: `node` is still private.
                unsafe { &*node }.next.store(handle, pos.curr);
                if unsafe { &*pos.prev }.cas(handle, pos.curr, node) {
                    break;
                }
            }
        }
    }
}

impl<K, V> ConcurrentMap<K, V> for LfHashMap<K, V>
where
    K: Ord + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, handle: &TxHandle, key: &K) -> Result<Option<V>, Abort> {
        let _sep = handle.op_guard();
        let (found, pos) = self.find_node(handle, key)?;
        let res = if found {
            Some(self.payload_value(pos.curr))
        } else {
            None
        };
        // SAFETY: `pos.prev` is protected for the duration of the guard.
        handle.record_read(unsafe { &*pos.prev }, pos.curr)?;
        Ok(res)
    }

    fn insert(&self, handle: &TxHandle, key: K, value: V) -> Result<bool, Abort> {
        let _sep = handle.op_guard();
        let node = self.new_node(handle, key.clone(), value);
        loop {
            let (found, pos) = self.find_node(handle, &key)?;
            if found {
                handle.record_read(unsafe { &*pos.prev }, pos.curr)?;
                self.delete_node(handle, node);
                return Ok(false);
            }
            // SAFETY: `node` is still private to this operation.
            unsafe { &*node }.next.store(handle, pos.curr);
            if unsafe { &*pos.prev }
                .tx_compare_exchange(handle, pos.curr, node, true, true)?
                .succeeded()
            {
                return Ok(true);
            }
        }
    }

    fn put(&self, handle: &TxHandle, key: K, value: V) -> Result<Option<V>, Abort> {
        let _sep = handle.op_guard();
        let node = self.new_node(handle, key.clone(), value);
        loop {
            let (found, pos) = self.find_node(handle, &key)?;
            if found {
                let res = self.payload_value(pos.curr);
                // SAFETY: `node` is still private; `pos.curr` is protected.
                unsafe { &*node }.next.store(handle, pos.next);
                if !handle.is_inside_txn() {
                    handle.retire_payload(&self.heap, self.payload_of(pos.curr))?;
                }
                // Insert the new node after curr and mark curr in one CAS.
                let curr_next = &unsafe { &*pos.curr }.next;
                if curr_next
                    .tx_compare_exchange(handle, pos.next, marked(node), true, true)?
                    .succeeded()
                {
                    if handle.is_inside_txn() {
                        // Create the anti-node only once the linearizing
                        // CAS is recorded.
                        handle.retire_payload(&self.heap, self.payload_of(pos.curr))?;
                        self.schedule_detach(handle, pos, node, key);
                    } else {
                        self.detach_in_place(handle, pos, node, &key);
                    }
                    return Ok(Some(res));
                }
            } else {
                unsafe { &*node }.next.store(handle, pos.curr);
                if unsafe { &*pos.prev }
                    .tx_compare_exchange(handle, pos.curr, node, true, true)?
                    .succeeded()
                {
                    return Ok(None);
                }
            }
        }
    }

    fn remove(&self, handle: &TxHandle, key: &K) -> Result<Option<V>, Abort> {
        let _sep = handle.op_guard();
        loop {
            let (found, pos) = self.find_node(handle, key)?;
            if !found {
                handle.record_read(unsafe { &*pos.prev }, pos.curr)?;
                return Ok(None);
            }
            let res = self.payload_value(pos.curr);
            if !handle.is_inside_txn() {
                handle.retire_payload(&self.heap, self.payload_of(pos.curr))?;
            }
            let curr_next = &unsafe { &*pos.curr }.next;
            if !curr_next
                .tx_compare_exchange(handle, pos.next, marked(pos.next), true, true)?
                .succeeded()
            {
                continue;
            }
            if handle.is_inside_txn() {
                handle.retire_payload(&self.heap, self.payload_of(pos.curr))?;
                let map = self as *const Self;
                let (prev, curr, next) = (pos.prev, pos.curr, pos.next);
                let key = key.clone();
                handle.add_cleanup(move |h| {
                    // SAFETY: cleanups run while the map is still alive
                    // (within the operation or its enclosing commit).
                    let map = unsafe { &*map };
                    if unsafe { &*prev }.cas(h, curr, next) {
                        map.retire_node(h, curr);
                    } else {
                        let _ = map.find_node(h, &key);
                    }
                });
            } else {
                if unsafe { &*pos.prev }.cas(handle, pos.curr, pos.next) {
                    self.retire_node(handle, pos.curr);
                } else {
                    let _ = self.find_node(handle, key)?;
                }
            }
            return Ok(Some(res));
        }
    }

    fn replace(&self, handle: &TxHandle, key: K, value: V) -> Result<Option<V>, Abort> {
        let _sep = handle.op_guard();
        let node = self.new_node(handle, key.clone(), value);
        loop {
            let (found, pos) = self.find_node(handle, &key)?;
            if !found {
                handle.record_read(unsafe { &*pos.prev }, pos.curr)?;
                self.delete_node(handle, node);
                return Ok(None);
            }
            let res = self.payload_value(pos.curr);
            unsafe { &*node }.next.store(handle, pos.next);
            if !handle.is_inside_txn() {
                handle.retire_payload(&self.heap, self.payload_of(pos.curr))?;
            }
            let curr_next = &unsafe { &*pos.curr }.next;
            if curr_next
                .tx_compare_exchange(handle, pos.next, marked(node), true, true)?
                .succeeded()
            {
                if handle.is_inside_txn() {
                    handle.retire_payload(&self.heap, self.payload_of(pos.curr))?;
                    self.schedule_detach(handle, pos, node, key);
                } else {
                    self.detach_in_place(handle, pos, node, &key);
                }
                return Ok(Some(res));
            }
        }
    }
}

impl<K, V> LfHashMap<K, V>
where
    K: Ord + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Detach a replaced node: swing its predecessor past it, or let a
    /// fresh traversal finish the job.
    fn detach_in_place(
        &self,
        handle: &TxHandle,
        pos: Position<K, V>,
        node: *mut Node<K, V>,
        key: &K,
    ) {
        // SAFETY: see find_node on cell validity.
        if unsafe { &*pos.prev }.cas(handle, pos.curr, node) {
            self.retire_node(handle, pos.curr);
        } else {
            let _ = self.find_node(handle, key);
        }
    }

    fn schedule_detach(
        &self,
        handle: &TxHandle,
        pos: Position<K, V>,
        node: *mut Node<K, V>,
        key: K,
    ) {
        let map = self as *const Self;
        let (prev, curr) = (pos.prev, pos.curr);
        handle.add_cleanup(move |h| {
            // SAFETY: cleanups run while the map is still alive.
            let map = unsafe { &*map };
            if unsafe { &*prev }.cas(h, curr, node) {
                map.retire_node(h, curr);
            } else {
                let _ = map.find_node(h, &key);
            }
        });
    }
}

impl<K, V> Drop for LfHashMap<K, V> {
    fn drop(&mut self) {
        // Transient nodes die with the map; payload blocks stay in the
        // named heap so a later session can recover them.
        for bucket in self.buckets.iter() {
            let mut curr = unmarked(bucket.plain_load().val as usize as *mut Node<K, V>);
            while !curr.is_null() {
                // SAFETY: exclusive access during drop.
                let boxed = unsafe { Box::from_raw(curr) };
                curr = unmarked(boxed.next.plain_load().val as usize as *mut Node<K, V>);
            }
        }
    }
}

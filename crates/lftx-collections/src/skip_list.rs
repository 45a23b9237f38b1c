// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fraser-style skip list with transactional CAS.
//!
//! Only the ground level is authoritative: a node's bottom `next` link and
//! its payload cell are versioned cells, while the upper levels are plain
//! atomic hints completed lazily. Logical updates happen on the payload
//! cell (replace installs a new payload block, removal CASes it to null),
//! so a node can be modified transactionally without touching its links;
//! insertion linearizes at the bottom-level splice.

use crate::map::ConcurrentMap;
use crossbeam::utils::CachePadded;
use lftx_runtime::{
    Abort, BlockRef, CasOutcome, EpochSystem, OpLifecycle, Retired, SlabHeap, TxHandle,
    VersionedCell,
};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

const NUM_LEVELS: usize = 20;
const LEVEL_MASK: usize = 0x0ff;
const READY_FOR_FREE: usize = 0x100;

type Payload<K, V> = (K, V);
type PayloadPtr = *mut u8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum NodeKind {
    Min,
    Real,
    Max,
}

struct Node<K, V> {
    level: AtomicUsize,
    kind: NodeKind,
    key: Option<K>,
    // Header address of the current payload block; null means logically
    // absent (deletion in progress or completed).
    payload: VersionedCell<PayloadPtr>,
    floor_next: VersionedCell<*mut Node<K, V>>,
    upper: [AtomicPtr<Node<K, V>>; NUM_LEVELS - 1],
    _marker: std::marker::PhantomData<V>,
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

impl<K: Ord, V> Node<K, V> {
    fn sentinel(kind: NodeKind, next: *mut Node<K, V>) -> Node<K, V> {
        Node {
            level: AtomicUsize::new(NUM_LEVELS),
            kind,
            key: None,
            payload: VersionedCell::new(ptr::null_mut()),
            floor_next: VersionedCell::new(next),
            upper: std::array::from_fn(|_| AtomicPtr::new(next)),
            _marker: std::marker::PhantomData,
        }
    }

    /// Search ordering: min sentinel < every key < max sentinel.
    fn at_or_past(&self, key: &K) -> bool {
        match self.kind {
            NodeKind::Min => false,
            NodeKind::Max => true,
            NodeKind::Real => self.key.as_ref().expect("real node without a key") >= key,
        }
    }

    fn is_key(&self, key: &K) -> bool {
        self.kind == NodeKind::Real && self.key.as_ref() == Some(key)
    }
}

enum UpdateMode {
    InsertOnly,
    Upsert,
    ReplaceOnly,
}

pub struct SkipListMap<K, V> {
    head: VersionedCell<*mut Node<K, V>>,
    heap: Arc<SlabHeap<Payload<K, V>>>,
    rngs: Vec<CachePadded<Mutex<SmallRng>>>,
}

unsafe impl<K: Send + Sync, V: Send + Sync> Send for SkipListMap<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for SkipListMap<K, V> {}

type Levels<K, V> = [*mut Node<K, V>; NUM_LEVELS];

impl<K, V> SkipListMap<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_threads: usize, heap_name: &str) -> SkipListMap<K, V> {
        let tail = Box::into_raw(Box::new(Node::sentinel(NodeKind::Max, ptr::null_mut())));
        let head = Box::into_raw(Box::new(Node::sentinel(NodeKind::Min, tail)));
        SkipListMap {
            head: VersionedCell::new(head),
            heap: SlabHeap::open(heap_name),
            rngs: (0..max_threads)
                .map(|tid| CachePadded::new(Mutex::new(SmallRng::seed_from_u64(tid as u64))))
                .collect(),
        }
    }

    pub fn heap(&self) -> &Arc<SlabHeap<Payload<K, V>>> {
        &self.heap
    }

    fn random_level(&self, handle: &TxHandle) -> usize {
        let mut r: u64 = self.rngs[handle.tid()].lock().gen();
        let mut level = 1;
        r = (r >> 4) & ((1 << (NUM_LEVELS - 1)) - 1);
        while r & 1 == 1 {
            level += 1;
            r >>= 1;
        }
        level
    }

    fn payload_ref(&self, p: PayloadPtr) -> BlockRef<Payload<K, V>> {
        self.heap.typed(self.heap.block_at(p as usize))
    }

    fn payload_value(&self, p: PayloadPtr) -> V {
        self.heap.payload_of(self.payload_ref(p)).1.clone()
    }

    fn link_load(
        &self,
        handle: &TxHandle,
        node: *mut Node<K, V>,
        level: usize,
    ) -> Result<*mut Node<K, V>, Abort> {
        // SAFETY: traversal nodes are protected by the tracker op.
        let node = unsafe { &*node };
        Ok(if level == 0 {
            node.floor_next.tx_load(handle)
        } else {
            node.upper[level - 1].load(Ordering::SeqCst)
        })
    }

    /// Search that also repairs: forward pointers are swung over marked
    /// sequences, restarting on any lost race. Fills predecessor/successor
    /// arrays when provided and returns the bottom-level successor.
    fn strong_search(
        &self,
        handle: &TxHandle,
        key: &K,
        mut pa: Option<&mut Levels<K, V>>,
        mut na: Option<&mut Levels<K, V>>,
    ) -> Result<*mut Node<K, V>, Abort> {
        'retry: loop {
            let mut x = self.head.tx_load(handle);
            let mut y = ptr::null_mut();
            for i in (0..NUM_LEVELS).rev() {
                let mut x_next = self.link_load(handle, x, i)?;
                // If this pointer is marked, so is the predecessor above;
                // may as well retry.
                if is_marked(x_next) {
                    continue 'retry;
                }
                y = x_next;
                loop {
                    // Shift over a sequence of marked nodes.
                    let mut y_next;
                    loop {
                        y_next = self.link_load(handle, unmarked(y), i)?;
                        if !is_marked(y_next) {
                            break;
                        }
                        y = unmarked(y_next);
                    }
                    // SAFETY: see link_load.
                    if unsafe { &*unmarked(y) }.at_or_past(key) {
                        break;
                    }
                    // Update the estimate of the predecessor at this level.
                    x = unmarked(y);
                    x_next = y_next;
                    y = y_next;
                }
                // Swing the forward pointer over any marked nodes.
                if x_next != y {
                    // SAFETY: see link_load.
                    let x_ref = unsafe { &*x };
                    if i == 0 {
                        if !x_ref
                            .floor_next
                            .tx_compare_exchange(handle, x_next, y, false, false)?
                            .succeeded()
                        {
                            continue 'retry;
                        }
                    } else if x_ref.upper[i - 1]
                        .compare_exchange(x_next, y, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                    {
                        continue 'retry;
                    }
                }
                if let Some(pa) = pa.as_deref_mut() {
                    pa[i] = x;
                }
                if let Some(na) = na.as_deref_mut() {
                    na[i] = unmarked(y);
                }
            }
            return Ok(unmarked(y));
        }
    }

    /// Read-only search: never repairs, tolerates marked links.
    /// Returns the raw (possibly marked) bottom-level successor pointer.
    fn weak_search(
        &self,
        handle: &TxHandle,
        key: &K,
        mut pa: Option<&mut Levels<K, V>>,
        mut na: Option<&mut Levels<K, V>>,
    ) -> Result<*mut Node<K, V>, Abort> {
        let mut x = self.head.tx_load(handle);
        let mut ox_next = ptr::null_mut();
        for i in (0..NUM_LEVELS).rev() {
            let mut x_next;
            loop {
                ox_next = self.link_load(handle, x, i)?;
                x_next = unmarked(ox_next);
                // SAFETY: see link_load.
                if unsafe { &*x_next }.at_or_past(key) {
                    break;
                }
                x = x_next;
            }
            if let Some(pa) = pa.as_deref_mut() {
                pa[i] = x;
            }
            if let Some(na) = na.as_deref_mut() {
                na[i] = x_next;
            }
        }
        Ok(ox_next)
    }

    fn mark_deleted(&self, handle: &TxHandle, x: *mut Node<K, V>, level: usize) -> Result<(), Abort> {
        for i in (0..level).rev() {
            let mut x_next = self.link_load(handle, x, i)?;
            while !is_marked(x_next) {
                // SAFETY: see link_load.
                let x_ref = unsafe { &*x };
                if i == 0 {
                    if x_ref
                        .floor_next
                        .tx_compare_exchange(handle, x_next, marked(x_next), false, false)?
                        .succeeded()
                    {
                        break;
                    }
                } else if x_ref.upper[i - 1]
                    .compare_exchange(x_next, marked(x_next), Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    break;
                }
                x_next = self.link_load(handle, x, i)?;
            }
        }
        Ok(())
    }

    /// Inserter/deleter handshake on a node both are racing over: whoever
    /// arrives second performs the full unlink.
    fn check_for_full_delete(&self, x: *mut Node<K, V>) -> bool {
        // SAFETY: the node is protected by the caller's operation.
        let level = unsafe { &*x }.level.load(Ordering::SeqCst);
        level & READY_FOR_FREE != 0
            || unsafe { &*x }
                .level
                .compare_exchange(
                    level,
                    level | READY_FOR_FREE,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_err()
    }

    fn do_full_delete(&self, handle: &TxHandle, x: *mut Node<K, V>) {
        // SAFETY: see check_for_full_delete.
        let key = unsafe { &*x }
            .key
            .clone()
            .expect("full delete of a sentinel");
        let _ = self.strong_search(handle, &key, None, None);
        self.retire_node(handle, x);
    }

    fn new_node(
        &self,
        handle: &TxHandle,
        key: K,
        payload: PayloadPtr,
        level: usize,
    ) -> *mut Node<K, V> {
        let node = Box::into_raw(Box::new(Node {
            level: AtomicUsize::new(level),
            kind: NodeKind::Real,
            key: Some(key),
            payload: VersionedCell::new(payload),
            floor_next: VersionedCell::new(ptr::null_mut()),
            upper: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            _marker: std::marker::PhantomData,
        }));
        handle.track_transient(
            node as usize,
            // SAFETY (deferred): run at most once, when unreachable.
            Retired::new(move || unsafe { drop(Box::from_raw(node)) }),
        );
        node
    }

    fn delete_node(&self, handle: &TxHandle, node: *mut Node<K, V>) {
        if let Some(dealloc) = handle.untrack_transient(node as usize) {
            dealloc.run();
            return;
        }
        // SAFETY: the node never became reachable.
        unsafe { drop(Box::from_raw(node)) };
    }

    fn retire_node(&self, handle: &TxHandle, node: *mut Node<K, V>) {
        handle.retire_transient(
            node as usize,
            // SAFETY (deferred): run after the grace period.
            Retired::new(move || unsafe { drop(Box::from_raw(node)) }),
        );
    }

    fn retire_payload_block(&self, handle: &TxHandle, p: PayloadPtr, tentative: bool) {
        let sys = Arc::clone(handle.system());
        let heap = Arc::clone(&self.heap);
        let raw = self.heap.block_at(p as usize);
        let cleanup = Retired::new(move || EpochSystem::preclaim_deferred(&sys, &heap, raw));
        if tentative {
            handle.retire_transient_tentative(p as usize, cleanup);
        } else {
            handle.retire_transient(p as usize, cleanup);
        }
    }

    fn delete_payload(&self, handle: &TxHandle, payload: BlockRef<Payload<K, V>>) {
        if let Some(dealloc) = handle.untrack_transient(payload.raw().addr()) {
            dealloc.run();
            return;
        }
        handle.reclaim_payload(&self.heap, payload);
    }

    /// Shared body of insert/put/replace: find the key and either update
    /// its payload cell or splice in a fresh node at the drawn level.
    fn do_update(
        &self,
        handle: &TxHandle,
        key: &K,
        val_block: BlockRef<Payload<K, V>>,
        mode: UpdateMode,
    ) -> Result<(bool, Option<V>), Abort> {
        let val_ptr = val_block.raw().addr() as PayloadPtr;
        let mut preds: Levels<K, V> = [ptr::null_mut(); NUM_LEVELS];
        let mut succs: Levels<K, V> = [ptr::null_mut(); NUM_LEVELS];
        let mut new_node: *mut Node<K, V> = ptr::null_mut();

        let osucc = self.weak_search(handle, key, Some(&mut preds), Some(&mut succs))?;
        let mut succ = unmarked(osucc);
        // The raw value the ground-level predecessor link was last seen
        // holding, for validating an absence.
        let mut bottom_observed = osucc;
        loop {
            // SAFETY: nodes reached by the search are protected by the
            // tracker op.
            if unsafe { &*succ }.is_key(key) {
                // Key present: update its payload mapping.
                let overwrite = !matches!(mode, UpdateMode::InsertOnly);
                let mut cas_ret = CasOutcome::Failed;
                let mut ov;
                loop {
                    let succ_ref = unsafe { &*succ };
                    ov = succ_ref.payload.tx_load(handle);
                    if ov.is_null() {
                        // Finish deleting the node, then retry.
                        let level = succ_ref.level.load(Ordering::SeqCst) & LEVEL_MASK;
                        self.mark_deleted(handle, succ, level)?;
                        succ = self.strong_search(
                            handle,
                            key,
                            Some(&mut preds),
                            Some(&mut succs),
                        )?;
                        bottom_observed = succ;
                        if !unsafe { &*succ }.is_key(key) {
                            // The key vanished entirely; take the absent
                            // path on the next loop turn.
                            break;
                        }
                        continue;
                    }
                    if overwrite {
                        if !handle.is_inside_txn() {
                            handle.retire_payload(&self.heap, self.payload_ref(ov))?;
                        }
                        cas_ret = succ_ref
                            .payload
                            .tx_compare_exchange(handle, ov, val_ptr, true, true)?;
                    }
                    if !overwrite || cas_ret.succeeded() {
                        break;
                    }
                }
                if ov.is_null() {
                    continue;
                }
                if !new_node.is_null() {
                    self.delete_node(handle, new_node);
                }
                let res = self.payload_value(ov);
                if overwrite {
                    if handle.is_inside_txn() {
                        handle.retire_payload(&self.heap, self.payload_ref(ov))?;
                    }
                    self.retire_payload_block(handle, ov, cas_ret.is_speculative());
                    return Ok((true, Some(res)));
                }
                let succ_ref = unsafe { &*succ };
                handle.record_read(&succ_ref.payload, ov)?;
                return Ok((false, Some(res)));
            }

            // Key absent.
            if matches!(mode, UpdateMode::ReplaceOnly) {
                debug_assert!(new_node.is_null());
                // SAFETY: preds[0] was filled by the search.
                let pred = unsafe { &*preds[0] };
                handle.record_read(&pred.floor_next, bottom_observed)?;
                return Ok((false, None));
            }
            if new_node.is_null() {
                new_node = self.new_node(
                    handle,
                    key.clone(),
                    val_ptr,
                    self.random_level(handle),
                );
            }
            let level = unsafe { &*new_node }.level.load(Ordering::SeqCst) & LEVEL_MASK;

            // If the successors don't change, this saves CAS operations.
            let node_ref = unsafe { &*new_node };
            node_ref.floor_next.store(handle, succs[0]);
            for i in 0..level.saturating_sub(1) {
                node_ref.upper[i].store(succs[i + 1], Ordering::SeqCst);
            }

            // Committed once inserted at the ground level.
            let pred = unsafe { &*preds[0] };
            if !pred
                .floor_next
                .tx_compare_exchange(handle, succ, new_node, true, true)?
                .succeeded()
            {
                succ = self.strong_search(handle, key, Some(&mut preds), Some(&mut succs))?;
                continue;
            }

            // Insert at the remaining levels in turn.
            let map = self as *const Self;
            let key_owned = key.clone();
            let node = new_node;
            let cleanup = move |h: &TxHandle| {
                // SAFETY: cleanups run while the map is alive.
                let map = unsafe { &*map };
                map.complete_tower(h, node, level, preds, succs, &key_owned);
            };
            if handle.is_inside_txn() {
                handle.add_cleanup(cleanup);
            } else {
                cleanup(handle);
            }
            return Ok((true, None));
        }
    }

    /// Finish publishing a freshly inserted node at its upper levels.
    /// Best-effort: a concurrent delete that marks the node first wins and
    /// the remaining levels are abandoned to lazy cleanup.
    fn complete_tower(
        &self,
        handle: &TxHandle,
        node: *mut Node<K, V>,
        level: usize,
        mut preds: Levels<K, V>,
        mut succs: Levels<K, V>,
        key: &K,
    ) {
        let mut i = 1;
        while i < level {
            let pred = preds[i];
            let succ = succs[i];

            // The node can be deleted under our feet.
            // SAFETY: `node` stays alive until retired via the tracker.
            let node_ref = unsafe { &*node };
            let new_next = node_ref.upper[i - 1].load(Ordering::SeqCst);
            if is_marked(new_next) {
                break;
            }

            // Ensure the node's forward pointer is up to date.
            if new_next != succ {
                let old = node_ref.upper[i - 1].compare_exchange(
                    new_next,
                    succ,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                if let Err(observed) = old {
                    if is_marked(observed) {
                        break;
                    }
                }
            }

            // Unique keys at every level.
            // SAFETY: see above.
            if unsafe { &*succ }.is_key(key) {
                if self
                    .strong_search(handle, key, Some(&mut preds), Some(&mut succs))
                    .is_err()
                {
                    break;
                }
                continue;
            }

            // Replumb the predecessor's forward pointer.
            // SAFETY: see above.
            if unsafe { &*pred }.upper[i - 1]
                .compare_exchange(succ, node, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                if self
                    .strong_search(handle, key, Some(&mut preds), Some(&mut succs))
                    .is_err()
                {
                    break;
                }
                continue;
            }

            i += 1;
        }

        // Visible at every level; settle the race with a concurrent
        // deleter.
        if self.check_for_full_delete(node) {
            self.do_full_delete(handle, node);
        }
    }
}

impl<K, V> ConcurrentMap<K, V> for SkipListMap<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, handle: &TxHandle, key: &K) -> Result<Option<V>, Abort> {
        let _sep = handle.op_guard();
        let mut preds: Levels<K, V> = [ptr::null_mut(); NUM_LEVELS];
        let ox = self.weak_search(handle, key, Some(&mut preds), None)?;
        let x = unmarked(ox);
        // SAFETY: search results are protected by the tracker op.
        if unsafe { &*x }.is_key(key) {
            let x_ref = unsafe { &*x };
            let v = x_ref.payload.tx_load(handle);
            handle.record_read(&x_ref.payload, v)?;
            if v.is_null() {
                return Ok(None);
            }
            return Ok(Some(self.payload_value(v)));
        }
        let pred = unsafe { &*preds[0] };
        handle.record_read(&pred.floor_next, ox)?;
        Ok(None)
    }

    fn insert(&self, handle: &TxHandle, key: K, value: V) -> Result<bool, Abort> {
        let _sep = handle.op_guard();
        let block = handle.alloc_payload_tracked(&self.heap, (key.clone(), value));
        let (inserted, _) = self.do_update(handle, &key, block, UpdateMode::InsertOnly)?;
        if !inserted {
            self.delete_payload(handle, block);
        }
        Ok(inserted)
    }

    fn put(&self, handle: &TxHandle, key: K, value: V) -> Result<Option<V>, Abort> {
        let _sep = handle.op_guard();
        let block = handle.alloc_payload_tracked(&self.heap, (key.clone(), value));
        let (_, previous) = self.do_update(handle, &key, block, UpdateMode::Upsert)?;
        Ok(previous)
    }

    fn remove(&self, handle: &TxHandle, key: &K) -> Result<Option<V>, Abort> {
        let _sep = handle.op_guard();
        let mut preds: Levels<K, V> = [ptr::null_mut(); NUM_LEVELS];
        let ox = self.weak_search(handle, key, Some(&mut preds), None)?;
        let x = unmarked(ox);
        // SAFETY: search results are protected by the tracker op.
        if !unsafe { &*x }.is_key(key) {
            return Ok(None);
        }
        let level = unsafe { &*x }.level.load(Ordering::SeqCst) & LEVEL_MASK;

        // Once the payload cell is nulled, the node is effectively
        // deleted.
        let v = loop {
            let x_ref = unsafe { &*x };
            let v = x_ref.payload.tx_load(handle);
            if v.is_null() {
                // Absent; the load above is the linearizing read.
                handle.record_read(&x_ref.payload, v)?;
                return Ok(None);
            }
            if x_ref
                .payload
                .tx_compare_exchange(handle, v, ptr::null_mut(), true, true)?
                .succeeded()
            {
                break v;
            }
        };
        let res = self.payload_value(v);
        // Durability of the deletion rides on the payload reclamation: the
        // deferred preclaim writes the delete marker.

        let map = self as *const Self;
        let cleanup = move |h: &TxHandle| {
            // SAFETY: cleanups run while the map is alive.
            let map = unsafe { &*map };
            map.retire_payload_block(h, v, false);
            // Committed to x: mark the lower-level forward pointers.
            let _ = map.mark_deleted(h, x, level);

            // Swing the predecessors' pointers to bound the number of
            // marked but not fully deleted nodes, then retire the node
            // once it is detached from the ground level.
            let mut detached_all = true;
            for i in (0..level).rev() {
                // SAFETY: see above.
                let pred = unsafe { &*preds[i] };
                let swung = if i == 0 {
                    let target = unmarked(unsafe { &*x }.floor_next.load(h));
                    pred.floor_next.cas(h, x, target)
                } else {
                    let target = unmarked(
                        unsafe { &*x }.upper[i - 1].load(Ordering::SeqCst),
                    );
                    pred.upper[i - 1]
                        .compare_exchange(x, target, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                };
                if !swung {
                    detached_all = false;
                    if i != level - 1 || map.check_for_full_delete(x) {
                        map.do_full_delete(h, x);
                    }
                    break;
                }
            }
            if detached_all {
                map.retire_node(h, x);
            }
        };
        if handle.is_inside_txn() {
            handle.add_cleanup(cleanup);
        } else {
            cleanup(handle);
        }
        Ok(Some(res))
    }

    fn replace(&self, handle: &TxHandle, key: K, value: V) -> Result<Option<V>, Abort> {
        let _sep = handle.op_guard();
        let block = handle.alloc_payload_tracked(&self.heap, (key.clone(), value));
        let (replaced, previous) =
            self.do_update(handle, &key, block, UpdateMode::ReplaceOnly)?;
        if !replaced {
            self.delete_payload(handle, block);
        }
        Ok(previous)
    }
}

impl<K, V> Drop for SkipListMap<K, V> {
    fn drop(&mut self) {
        // Free transient nodes; payload blocks stay in the named heap.
        let mut curr = unmarked(self.head.plain_load().val as usize as *mut Node<K, V>);
        while !curr.is_null() {
            // SAFETY: exclusive access during drop.
            let boxed = unsafe { Box::from_raw(curr) };
            curr = unmarked(boxed.floor_next.plain_load().val as usize as *mut Node<K, V>);
        }
    }
}

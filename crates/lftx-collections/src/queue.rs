// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

//! Michael-Scott queue with transactional composition.
//!
//! The head is a versioned cell so a dequeue can linearize inside a
//! transaction; the tail is a plain atomic hint. The tail is only swung
//! past a `next` pointer that was *not* read speculatively: chasing a
//! speculative link would publish a node whose insertion might still
//! abort.

use crate::map::ConcurrentQueue;
use lftx_runtime::{
    Abort, BlockRef, EpochSystem, OpLifecycle, Retired, SlabHeap, TxHandle, VersionedCell,
};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Value plus its global sequence number.
type Payload<T> = (T, u64);

struct Node<T> {
    next: VersionedCell<*mut Node<T>>,
    // Header address of the payload block; 0 for a dummy. Rewritten by the
    // dequeuer that turns the successor into the new dummy.
    payload: AtomicUsize,
}

impl<T> Node<T> {
    fn dummy() -> Node<T> {
        Node {
            next: VersionedCell::new(ptr::null_mut()),
            payload: AtomicUsize::new(0),
        }
    }
}

pub struct MsQueue<T> {
    heap: Arc<SlabHeap<Payload<T>>>,
    head: VersionedCell<*mut Node<T>>,
    tail: AtomicPtr<Node<T>>,
    global_sn: AtomicU64,
}

unsafe impl<T: Send + Sync> Send for MsQueue<T> {}
unsafe impl<T: Send + Sync> Sync for MsQueue<T> {}

impl<T> MsQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(heap_name: &str) -> MsQueue<T> {
        let dummy = Box::into_raw(Box::new(Node::dummy()));
        MsQueue {
            heap: SlabHeap::open(heap_name),
            head: VersionedCell::new(dummy),
            tail: AtomicPtr::new(dummy),
            global_sn: AtomicU64::new(0),
        }
    }

    pub fn heap(&self) -> &Arc<SlabHeap<Payload<T>>> {
        &self.heap
    }

    fn payload_block(&self, addr: usize) -> BlockRef<Payload<T>> {
        self.heap.typed(self.heap.block_at(addr))
    }

    fn node_destructor(&self, handle: &TxHandle, node: *mut Node<T>) -> Retired {
        let sys = Arc::clone(handle.system());
        let heap = Arc::clone(&self.heap);
        Retired::new(move || {
            // SAFETY: runs at most once, after the node is unreachable.
            let boxed = unsafe { Box::from_raw(node) };
            let payload = boxed.payload.load(Ordering::Relaxed);
            if payload != 0 {
                EpochSystem::preclaim_deferred(&sys, &heap, heap.block_at(payload));
            }
        })
    }
}

impl<T> ConcurrentQueue<T> for MsQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn enqueue(&self, handle: &TxHandle, value: T) -> Result<(), Abort> {
        let _sep = handle.op_guard();
        let payload = handle.alloc_payload(&self.heap, (value, 0));
        let node = Box::into_raw(Box::new(Node {
            next: VersionedCell::new(ptr::null_mut()),
            payload: AtomicUsize::new(payload.raw().addr()),
        }));
        // Abort-path destructor: the payload is still this node's own, and
        // must be withdrawn from the pending allocations as it goes.
        let release = handle.deferred_payload_release(&self.heap, payload);
        handle.track_transient(
            node as usize,
            // SAFETY (deferred): run at most once, when unreachable.
            Retired::new(move || {
                unsafe { drop(Box::from_raw(node)) };
                release.run();
            }),
        );

        let mut cur_tail;
        loop {
            cur_tail = self.tail.load(Ordering::SeqCst);
            let sn = self.global_sn.fetch_add(1, Ordering::SeqCst);
            // SAFETY: the tail hint always references a node kept alive by
            // the tracker op this operation runs under.
            let tail_next = &unsafe { &*cur_tail }.next;
            let (next, speculative) = tail_next.tx_load_speculative(handle);
            if cur_tail != self.tail.load(Ordering::SeqCst) {
                continue;
            }
            if next.is_null() {
                // Stamp the sequence number while the payload is still
                // private; the registration at epoch acquisition flushes
                // it together with the value.
                unsafe {
                    self.heap.payload_mut(payload).1 = sn;
                }
                if tail_next
                    .tx_compare_exchange(handle, next, node, true, true)?
                    .succeeded()
                {
                    break;
                }
            } else if !speculative {
                // Tail is falling behind; help swing it.
                let _ = self.tail.compare_exchange(
                    cur_tail,
                    next,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
        }

        let tail = &self.tail as *const AtomicPtr<Node<T>>;
        let swing = move |_h: &TxHandle| {
            // SAFETY: the queue outlives its operations and their commit
            // cleanups.
            let tail = unsafe { &*tail };
            let _ = tail.compare_exchange(cur_tail, node, Ordering::SeqCst, Ordering::SeqCst);
        };
        if handle.is_inside_txn() {
            handle.add_cleanup(swing);
        } else {
            swing(handle);
        }
        Ok(())
    }

    fn dequeue(&self, handle: &TxHandle) -> Result<Option<T>, Abort> {
        let _sep = handle.op_guard();
        loop {
            let cur_head = self.head.tx_load(handle);
            let cur_tail = self.tail.load(Ordering::SeqCst);
            // SAFETY: head nodes are protected by the tracker op.
            let head_next = &unsafe { &*cur_head }.next;
            let (next, speculative) = head_next.tx_load_speculative(handle);

            if cur_head != self.head.tx_load(handle) {
                continue;
            }
            if cur_head == cur_tail {
                if next.is_null() {
                    // Empty queue; validate emptiness at commit.
                    handle.record_read(head_next, next)?;
                    return Ok(None);
                }
                if !speculative {
                    let _ = self.tail.compare_exchange(
                        cur_tail,
                        next,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                }
                continue;
            }

            let payload_addr = unsafe { &*next }.payload.load(Ordering::SeqCst);
            let payload = self.payload_block(payload_addr);
            if !handle.is_inside_txn() {
                // Tentatively removing `next` from the queue.
                handle.retire_payload(&self.heap, payload)?;
            }
            if self
                .head
                .tx_compare_exchange(handle, cur_head, next, true, true)?
                .succeeded()
            {
                let res = self.heap.payload_of(payload).0.clone();
                let map = self as *const Self;
                let cleanup = move |h: &TxHandle| {
                    // The payload moves to the outgoing dummy so both are
                    // reclaimed together.
                    // SAFETY: the queue outlives its cleanups; `cur_head`
                    // is unreachable once the head CAS committed.
                    let queue = unsafe { &*map };
                    unsafe { &*cur_head }
                        .payload
                        .store(payload_addr, Ordering::SeqCst);
                    unsafe { &*next }.payload.store(0, Ordering::SeqCst);
                    let destructor = queue.node_destructor(h, cur_head);
                    h.retire_transient(cur_head as usize, destructor);
                };
                if handle.is_inside_txn() {
                    handle.retire_payload(&self.heap, payload)?;
                    handle.add_cleanup(cleanup);
                } else {
                    cleanup(handle);
                }
                return Ok(Some(res));
            }
        }
    }
}

impl<T> Drop for MsQueue<T> {
    fn drop(&mut self) {
        // Free the transient nodes only; payload blocks belong to the
        // named heap.
        let mut curr = self.head.plain_load().val as usize as *mut Node<T>;
        while !curr.is_null() {
            // SAFETY: exclusive access during drop.
            let boxed = unsafe { Box::from_raw(curr) };
            curr = boxed.next.plain_load().val as usize as *mut Node<T>;
        }
    }
}

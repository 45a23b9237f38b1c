// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

//! Crash recovery: a two-pass scan over the surviving heaps.
//!
//! Pass 1 locates the epoch container, the descriptor images, and the
//! delete markers (anti-nodes). Between the passes, anti-nodes whose
//! deletion did not durably commit are discarded. Pass 2 classifies every
//! payload block, dropping those that are premature (epoch too new),
//! deleted, or written by a transaction that never committed; survivors are
//! handed back for re-indexing.

use crate::heap::{BlockKind, RawBlock, SlabHeap};
use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use lftx_mcas::NULL_EPOCH;

const STATE_COMMITTED: u64 = 2;

pub struct RecoveryOutcome {
    /// Highest epoch found on any block; the clock restarts above it.
    pub max_epoch: u64,
    /// Blocks whose writes durably committed. Containers re-index these in
    /// place rather than copying the payloads.
    pub survivors: Vec<RawBlock>,
}

/// Recover the payload heap named by `heap` against its sibling meta heap.
///
/// `clean_start` asserts the previous session exited cleanly; finding
/// delete markers or duplicate ids then is a fatal recovery inconsistency.
pub fn recover_heap<P: Send + Sync + 'static>(
    heap: &Arc<SlabHeap<P>>,
    meta: &Arc<SlabHeap<()>>,
    clean_start: bool,
) -> Result<RecoveryOutcome> {
    let begin = Instant::now();

    // Pass 1: epoch container, descriptor images, anti-nodes.
    let mut max_epoch = 0u64;
    let mut descs: HashMap<u64, u64> = HashMap::new();
    let mut anti_nodes: Vec<RawBlock> = Vec::new();
    let mut deleted_ids: HashSet<u64> = HashSet::new();
    let mut epoch_container_found = false;

    let meta_blocks = meta.scan();
    let payload_blocks = heap.scan();
    for block in meta_blocks.iter().chain(payload_blocks.iter()) {
        let header = block.header();
        match header.kind() {
            BlockKind::Epoch => {
                epoch_container_found = true;
                max_epoch = max_epoch.max(header.epoch());
            },
            BlockKind::Descriptor => {
                descs.insert(header.tid(), header.raw_tid_sn());
            },
            BlockKind::Delete => {
                if clean_start {
                    bail!("delete node appears after a clean exit");
                }
                anti_nodes.push(*block);
                if header.epoch() != NULL_EPOCH {
                    deleted_ids.insert(header.id());
                }
            },
            _ => {},
        }
        max_epoch = max_epoch.max(header.epoch());
    }
    if !epoch_container_found {
        bail!("epoch container not found during recovery");
    }
    log::info!("recovery first pass took {:?}", begin.elapsed());

    let epoch_cap = max_epoch.saturating_sub(2);
    // Descriptor images only exist for nonblocking sessions; without them
    // the sequence-number filters do not apply.
    let use_desc_filter = !descs.is_empty();
    let committed = |tid: u64, sn: u64| -> bool {
        match descs.get(&tid) {
            Some(&raw) => {
                let desc_sn = (raw >> 2) & 0xffff_ffff_ffff;
                sn < desc_sn || (sn == desc_sn && raw & 0x3 == STATE_COMMITTED)
            },
            // Writer never persisted a descriptor image: nothing it wrote
            // durably committed.
            None => false,
        }
    };

    // Discard anti-nodes whose deletion did not durably commit, so the
    // payloads they name stay live.
    for anti in &anti_nodes {
        let header = anti.header();
        if header.epoch() > epoch_cap
            || (use_desc_filter && !committed(header.tid(), header.sn()))
        {
            deleted_ids.remove(&header.id());
        }
    }

    // Pass 2: classify payload blocks.
    let second = Instant::now();
    let mut in_use: HashMap<u64, RawBlock> = HashMap::new();
    let mut not_in_use: Vec<RawBlock> = Vec::new();
    for block in payload_blocks {
        let header = block.header();
        match header.kind() {
            BlockKind::Delete | BlockKind::Epoch | BlockKind::Descriptor => continue,
            BlockKind::Owned => bail!("OWNED is not a valid block kind in this version"),
            _ => {},
        }
        let premature = header.epoch() == NULL_EPOCH
            || header.epoch() > epoch_cap
            || deleted_ids.contains(&header.id())
            || (use_desc_filter && !committed(header.tid(), header.sn()));
        if premature {
            not_in_use.push(block);
            continue;
        }
        match header.kind() {
            BlockKind::Alloc | BlockKind::Update => match in_use.get(&header.id()).copied() {
                Some(existing) => {
                    if clean_start {
                        bail!("more than one record with the same id after a clean exit");
                    }
                    if header.epoch() > existing.header().epoch() {
                        not_in_use.push(existing);
                        in_use.insert(header.id(), block);
                    } else {
                        not_in_use.push(block);
                    }
                },
                None => {
                    in_use.insert(header.id(), block);
                },
            },
            other => bail!("wrong type of block discovered: {:?}", other),
        }
    }
    log::info!("recovery second pass took {:?}", second.elapsed());

    let survivors: Vec<RawBlock> = in_use.into_values().collect();

    // Clean up everything recovery decided against, plus the consumed
    // anti-nodes and stale descriptor images.
    for block in not_in_use {
        block.header().set_epoch(NULL_EPOCH);
        heap.dealloc(block);
    }
    for anti in anti_nodes {
        anti.header().set_epoch(NULL_EPOCH);
        meta.dealloc(anti);
    }
    for block in meta.scan() {
        if block.header().kind() == BlockKind::Descriptor {
            meta.dealloc(block);
        }
    }

    log::info!(
        "recovery done: {} survivors, max epoch {}",
        survivors.len(),
        max_epoch
    );
    Ok(RecoveryOutcome {
        max_epoch,
        survivors,
    })
}

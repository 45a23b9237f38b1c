// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};

/// Epoch value meaning "no epoch": threads outside an operation, blocks not
/// yet tagged.
pub const NULL_EPOCH: u64 = 0;

/// First epoch the clock starts in. Leaves room below so that `e - 2`
/// arithmetic in the reclamation and recovery paths never wraps.
pub const INIT_EPOCH: u64 = 3;

/// The global epoch counter.
///
/// Written only by the epoch advancer, read by everyone. A transaction's
/// commit is valid only while the clock still shows the epoch the
/// transaction registered with, which is what makes per-epoch persistence
/// and reclamation sound.
#[derive(Debug)]
pub struct EpochClock {
    global: AtomicU64,
}

impl EpochClock {
    pub fn new() -> Self {
        Self {
            global: AtomicU64::new(INIT_EPOCH),
        }
    }

    pub fn starting_at(epoch: u64) -> Self {
        Self {
            global: AtomicU64::new(epoch),
        }
    }

    pub fn read(&self) -> u64 {
        self.global.load(Ordering::SeqCst)
    }

    /// True iff the global epoch still equals `c`.
    pub fn check(&self, c: u64) -> bool {
        c == self.global.load(Ordering::SeqCst)
    }

    /// Only the advancer stores; everyone else observes.
    pub fn store(&self, c: u64) {
        self.global.store(c, Ordering::SeqCst);
    }

    pub fn compare_exchange(&self, expected: u64, desired: u64) -> bool {
        self.global
            .compare_exchange(expected, desired, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Default for EpochClock {
    fn default() -> Self {
        Self::new()
    }
}

// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

//! Multi-word compare-and-swap descriptor engine.
//!
//! The engine lets an owner thread accumulate reads and writes against
//! 128-bit versioned cells into a per-thread [`Descriptor`], then flip all of
//! them to their new values at a single linearization point (the status CAS
//! that moves the descriptor to committed). Any thread that encounters an
//! installed descriptor helps the transaction finish instead of blocking on
//! it, so individual cell operations stay non-blocking.
//!
//! Layering: this crate knows about cells, descriptors, the read/write-set
//! slabs and the global epoch clock. Operation lifecycles (epoch
//! registration, reclamation, persistence) are the runtime's concern and
//! reach the engine through the [`OpLifecycle`] trait.

mod cell;
mod clock;
mod descriptor;
mod error;
mod session;
mod slab;
mod status;

pub use cell::{Annotated, CasOutcome, VersionedCell, Word, TAG_DESCRIPTOR, TAG_VALUE};
pub use clock::{EpochClock, INIT_EPOCH, NULL_EPOCH};
pub use descriptor::{Descriptor, DescriptorPool, WriteEntry, MAX_THREADS};
pub use error::Abort;
pub use session::{OpLifecycle, TxSession};
pub use slab::{EntryValue, SlabMap};
pub use status::{AtomicStatus, StatusWord, TxState};

#[cfg(test)]
mod unit_tests;

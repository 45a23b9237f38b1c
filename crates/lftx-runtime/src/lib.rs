// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

//! Epoch-based transactional runtime.
//!
//! Wraps the MCAS descriptor engine with everything a transaction's
//! lifetime needs: a global epoch clock driven by a dedicated advancer
//! thread, per-epoch reclamation and (optional) persistence of payload
//! blocks, and the per-thread recoverable facade (`TxHandle`) carrying the
//! transaction API plus the cleanup/undo/unlock queues.
//!
//! ```no_run
//! use lftx_runtime::{Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig::new(8));
//! let handle = runtime.register_thread();
//! handle.tx_begin();
//! // ... transactional container operations through `handle` ...
//! handle.tx_end().expect("commit conflict, retry");
//! ```

pub mod advancer;
pub mod config;
pub mod context;
pub mod frontier;
pub mod heap;
pub mod persist;
pub mod reclaim;
pub mod recovery;
pub mod runtime;
pub mod system;
pub mod tracker;

pub use config::{
    EpochLengthUnit, FreePolicy, Liveness, PersistStrategy, PersistTrackerKind, RuntimeConfig,
    TransTrackerKind,
};
pub use context::{OpGuard, TxHandle};
pub use heap::{BlockKind, BlockRef, RawBlock, SlabHeap};
pub use persist::{CountingFlush, FlushFence, NoopFlush};
pub use reclaim::Retired;
pub use recovery::{recover_heap, RecoveryOutcome};
pub use runtime::Runtime;
pub use system::EpochSystem;

// Re-export the engine surface that container implementations use.
pub use lftx_mcas::{
    Abort, Annotated, CasOutcome, EpochClock, OpLifecycle, VersionedCell, Word, INIT_EPOCH,
    NULL_EPOCH,
};

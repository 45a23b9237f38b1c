// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::advancer::{DedicatedAdvancer, EpochAdvancer, NoAdvancer};
use crate::config::{PersistStrategy, RuntimeConfig};
use crate::context::TxHandle;
use crate::persist::{FlushFence, NoopFlush};
use crate::system::EpochSystem;
use std::sync::Arc;

/// The transactional runtime: owns the epoch system and the advancer
/// thread. Threads register to obtain a [`TxHandle`]; dropping the runtime
/// shuts the advancer down and flushes pending epochs (a clean exit).
pub struct Runtime {
    sys: Arc<EpochSystem>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Runtime {
        Self::with_flush(config, Arc::new(NoopFlush))
    }

    pub fn with_flush(config: RuntimeConfig, flush: Arc<dyn FlushFence>) -> Runtime {
        config.validate();
        let persist = config.persist;
        let interval = config.epoch_interval();
        let sys = Arc::new(EpochSystem::new(config, flush));
        let advancer: Arc<dyn EpochAdvancer> = if persist == PersistStrategy::No {
            Arc::new(NoAdvancer::new())
        } else {
            Arc::new(DedicatedAdvancer::spawn(Arc::downgrade(&sys), interval))
        };
        sys.set_advancer(advancer);
        log::debug!(
            "runtime up: heap={} liveness={:?} persist={:?}",
            sys.config().heap_name,
            sys.config().liveness,
            sys.config().persist
        );
        Runtime { sys }
    }

    /// Register the calling thread with the runtime. Each thread registers
    /// exactly once and keeps its handle for the life of the runtime.
    pub fn register_thread(&self) -> TxHandle {
        TxHandle::new(Arc::clone(&self.sys))
    }

    pub fn system(&self) -> &Arc<EpochSystem> {
        &self.sys
    }

    pub fn epoch(&self) -> u64 {
        self.sys.clock().read()
    }

    /// Drive one epoch transition by hand; used by tests and by
    /// configurations without an advancer thread.
    pub fn advance_epoch(&self) {
        self.sys.advance_epoch();
    }

    /// Simulate a crash: the advancer is stopped, no clean-exit mark is
    /// written, and the runtime's transient memory is deliberately leaked.
    /// Only the named heaps survive meaningfully.
    pub fn simulate_crash(self) {
        self.sys.advancer().shutdown();
        std::mem::forget(self);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.sys.advancer().shutdown();
        self.sys.tracker.drain_all();
        self.sys.meta_heap().mark_clean();
        log::debug!(
            "runtime down: heap={} final epoch {}",
            self.sys.config().heap_name,
            self.sys.clock().read()
        );
    }
}

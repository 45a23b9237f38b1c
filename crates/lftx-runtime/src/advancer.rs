// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

//! The dedicated epoch-advancer thread.
//!
//! One background thread bumps the global epoch on a fixed interval,
//! running the per-epoch callbacks (reclaim two behind, drain/persist one
//! behind) around each bump. `sync` lets application threads rendezvous
//! with the advancer: it blocks until a requested epoch has been fully
//! processed.

use crate::system::EpochSystem;
use lftx_mcas::{INIT_EPOCH, NULL_EPOCH};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

pub trait EpochAdvancer: Send + Sync {
    /// Notification hook at the end of every operation/transaction.
    fn on_end_transaction(&self, epoch: u64);

    /// The epoch the ongoing (or next) advance is moving toward.
    fn ongoing_target(&self) -> u64;

    /// Block until `epoch` (or the current epoch for `NULL_EPOCH`) has
    /// been drained and persisted.
    fn sync(&self, epoch: u64);

    /// Stop and join the background thread; pending epochs are flushed.
    fn shutdown(&self);
}

/// Advancer for persistence-free configurations: the epoch only moves when
/// a test drives it manually.
pub struct NoAdvancer {
    target: AtomicU64,
}

impl NoAdvancer {
    pub fn new() -> Self {
        NoAdvancer {
            target: AtomicU64::new(INIT_EPOCH + 1),
        }
    }
}

impl Default for NoAdvancer {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochAdvancer for NoAdvancer {
    fn on_end_transaction(&self, _epoch: u64) {}

    fn ongoing_target(&self) -> u64 {
        self.target.load(Ordering::SeqCst)
    }

    fn sync(&self, _epoch: u64) {}

    fn shutdown(&self) {}
}

struct WakeFlags {
    requested: bool,
    shutdown: bool,
}

struct AdvancerState {
    sys: Weak<EpochSystem>,
    interval: Duration,
    target: AtomicU64,
    // Highest epoch fully drained and persisted.
    progress: Mutex<u64>,
    progress_cv: Condvar,
    wake: Mutex<WakeFlags>,
    wake_cv: Condvar,
}

impl AdvancerState {
    fn run(&self) {
        loop {
            {
                let mut wake = self.wake.lock();
                if !wake.shutdown && !wake.requested {
                    let _ = self.wake_cv.wait_for(&mut wake, self.interval);
                }
                if wake.shutdown {
                    break;
                }
                wake.requested = false;
            }
            if !self.advance_once() {
                return;
            }
        }
        // Final rounds: everything registered before shutdown reaches the
        // flush capability.
        self.advance_once();
        self.advance_once();
    }

    fn advance_once(&self) -> bool {
        let sys = match self.sys.upgrade() {
            Some(sys) => sys,
            None => return false,
        };
        let c = sys.clock().read();
        self.target.store(c + 1, Ordering::SeqCst);
        sys.advance_epoch();
        log::trace!("epoch advanced to {}", c + 1);
        let mut progress = self.progress.lock();
        *progress = c.saturating_sub(1);
        self.progress_cv.notify_all();
        true
    }
}

/// Background thread driving the epoch clock.
pub struct DedicatedAdvancer {
    state: Arc<AdvancerState>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DedicatedAdvancer {
    pub fn spawn(sys: Weak<EpochSystem>, interval: Duration) -> DedicatedAdvancer {
        let state = Arc::new(AdvancerState {
            sys,
            interval,
            target: AtomicU64::new(INIT_EPOCH + 1),
            progress: Mutex::new(INIT_EPOCH - 1),
            progress_cv: Condvar::new(),
            wake: Mutex::new(WakeFlags {
                requested: false,
                shutdown: false,
            }),
            wake_cv: Condvar::new(),
        });
        let thread = {
            let state = Arc::clone(&state);
            std::thread::Builder::new()
                .name("lftx-epoch-advancer".to_string())
                .spawn(move || state.run())
                .expect("failed to spawn the epoch advancer")
        };
        DedicatedAdvancer {
            state,
            thread: Mutex::new(Some(thread)),
        }
    }
}

impl EpochAdvancer for DedicatedAdvancer {
    fn on_end_transaction(&self, _epoch: u64) {}

    fn ongoing_target(&self) -> u64 {
        self.state.target.load(Ordering::SeqCst)
    }

    fn sync(&self, epoch: u64) {
        let target = if epoch == NULL_EPOCH {
            match self.state.sys.upgrade() {
                Some(sys) => sys.clock().read(),
                None => return,
            }
        } else {
            epoch
        };
        loop {
            {
                let progress = self.state.progress.lock();
                if *progress >= target {
                    return;
                }
            }
            {
                let mut wake = self.state.wake.lock();
                wake.requested = true;
            }
            self.wake_now();
            let mut progress = self.state.progress.lock();
            if *progress >= target {
                return;
            }
            let _ = self
                .state
                .progress_cv
                .wait_for(&mut progress, Duration::from_millis(1));
        }
    }

    fn shutdown(&self) {
        {
            let mut wake = self.state.wake.lock();
            wake.shutdown = true;
        }
        self.wake_now();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl DedicatedAdvancer {
    fn wake_now(&self) {
        self.state.wake_cv.notify_one();
    }
}

impl Drop for DedicatedAdvancer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Blocking or nonblocking epoch semantics. Blocking mode drains epochs by
/// waiting for stragglers; nonblocking mode lazily aborts transactions whose
/// epoch is expiring.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Liveness {
    Blocking,
    Nonblocking,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PersistStrategy {
    /// Persistence disabled entirely (also disables the advancer thread).
    No,
    /// Direct write-back: flush every registered range immediately.
    DirWB,
    /// Buffered write-back: per-thread, per-epoch buffers drained at epoch
    /// end or on overflow.
    BufferedWB,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FreePolicy {
    /// Free retired blocks immediately. Only safe when nothing else can
    /// observe them.
    No,
    /// Per-epoch buckets, drained once the epoch is two behind.
    PerEpoch,
    /// Thread-local buckets, drained by each thread as it crosses epochs.
    ThreadLocal,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransTrackerKind {
    /// Per-epoch global counters.
    AtomicCounter,
    /// Per-thread registration with an explicit fence on entry.
    ActiveThread,
    /// Per-thread current-epoch slots.
    CurrEpoch,
    /// No tracking (persistence off).
    None,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PersistTrackerKind {
    /// Monotonic per-thread persisted-epoch frontier.
    IncreasingMindicator,
    /// Frontier without the monotonicity constraint.
    Mindicator,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EpochLengthUnit {
    Second,
    Millisecond,
    Microsecond,
}

static HEAP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Runtime construction options. `from_env` recognizes the documented
/// environment settings; unrecognized values are programmer errors and
/// panic, matching the fatal-error contract.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub max_threads: usize,
    pub liveness: Liveness,
    pub persist: PersistStrategy,
    pub free: FreePolicy,
    pub trans_tracker: TransTrackerKind,
    pub persist_tracker: PersistTrackerKind,
    pub epoch_length: u64,
    pub epoch_length_unit: EpochLengthUnit,
    pub buffer_size: usize,
    pub heap_name: String,
}

impl RuntimeConfig {
    pub fn new(max_threads: usize) -> Self {
        RuntimeConfig {
            max_threads,
            liveness: Liveness::Nonblocking,
            persist: PersistStrategy::BufferedWB,
            free: FreePolicy::PerEpoch,
            trans_tracker: TransTrackerKind::CurrEpoch,
            persist_tracker: PersistTrackerKind::IncreasingMindicator,
            epoch_length: 50,
            epoch_length_unit: EpochLengthUnit::Millisecond,
            buffer_size: 64,
            heap_name: format!("lftx_heap_{:06x}", HEAP_COUNTER.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// Read the recognized environment settings on top of the defaults.
    pub fn from_env(max_threads: usize) -> Self {
        let mut config = Self::new(max_threads);
        if let Ok(v) = env::var("Liveness") {
            config.liveness = match v.as_str() {
                "Blocking" => Liveness::Blocking,
                "Nonblocking" => Liveness::Nonblocking,
                other => panic!("unrecognized 'Liveness' environment: {}", other),
            };
        }
        if let Ok(v) = env::var("PersistStrat") {
            config.persist = match v.as_str() {
                "No" => PersistStrategy::No,
                "DirWB" => PersistStrategy::DirWB,
                "BufferedWB" => PersistStrategy::BufferedWB,
                other => panic!("unrecognized 'PersistStrat' environment: {}", other),
            };
        }
        if let Ok(v) = env::var("Free") {
            config.free = match v.as_str() {
                "No" => FreePolicy::No,
                "PerEpoch" => FreePolicy::PerEpoch,
                "ThreadLocal" => FreePolicy::ThreadLocal,
                other => panic!("unrecognized 'Free' environment: {}", other),
            };
        }
        if let Ok(v) = env::var("TransTracker") {
            config.trans_tracker = match v.as_str() {
                "AtomicCounter" => TransTrackerKind::AtomicCounter,
                "ActiveThread" => TransTrackerKind::ActiveThread,
                "CurrEpoch" => TransTrackerKind::CurrEpoch,
                other => panic!("unrecognized 'TransTracker' environment: {}", other),
            };
        }
        if let Ok(v) = env::var("PersistTracker") {
            config.persist_tracker = match v.as_str() {
                "IncreasingMindicator" => PersistTrackerKind::IncreasingMindicator,
                "Mindicator" => PersistTrackerKind::Mindicator,
                other => panic!("unrecognized 'PersistTracker' environment: {}", other),
            };
        }
        if let Ok(v) = env::var("EpochLength") {
            config.epoch_length = v
                .parse()
                .unwrap_or_else(|_| panic!("invalid 'EpochLength' environment: {}", v));
        }
        if let Ok(v) = env::var("EpochLengthUnit") {
            config.epoch_length_unit = match v.as_str() {
                "Second" => EpochLengthUnit::Second,
                "Millisecond" => EpochLengthUnit::Millisecond,
                "Microsecond" => EpochLengthUnit::Microsecond,
                other => panic!("unrecognized 'EpochLengthUnit' environment: {}", other),
            };
        }
        if let Ok(v) = env::var("BufferSize") {
            config.buffer_size = v
                .parse()
                .unwrap_or_else(|_| panic!("invalid 'BufferSize' environment: {}", v));
        }
        if let Ok(v) = env::var("HeapName") {
            config.heap_name = v;
        }
        config.validate();
        config
    }

    pub fn with_liveness(mut self, liveness: Liveness) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn with_persist(mut self, persist: PersistStrategy) -> Self {
        self.persist = persist;
        if persist == PersistStrategy::No {
            self.trans_tracker = TransTrackerKind::None;
        }
        self
    }

    pub fn with_free(mut self, free: FreePolicy) -> Self {
        self.free = free;
        self
    }

    pub fn with_trans_tracker(mut self, kind: TransTrackerKind) -> Self {
        self.trans_tracker = kind;
        self
    }

    pub fn with_persist_tracker(mut self, kind: PersistTrackerKind) -> Self {
        self.persist_tracker = kind;
        self
    }

    pub fn with_epoch_length(mut self, length: u64, unit: EpochLengthUnit) -> Self {
        self.epoch_length = length;
        self.epoch_length_unit = unit;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_heap_name(mut self, name: impl Into<String>) -> Self {
        self.heap_name = name.into();
        self
    }

    pub fn epoch_interval(&self) -> Duration {
        match self.epoch_length_unit {
            EpochLengthUnit::Second => Duration::from_secs(self.epoch_length),
            EpochLengthUnit::Millisecond => Duration::from_millis(self.epoch_length),
            EpochLengthUnit::Microsecond => Duration::from_micros(self.epoch_length),
        }
    }

    pub fn validate(&self) {
        assert!(self.max_threads > 0);
        if self.liveness == Liveness::Nonblocking {
            // Nonblocking reclamation is driven through the per-epoch
            // buckets; thread-local draining belongs to blocking mode.
            assert_ne!(
                self.free,
                FreePolicy::ThreadLocal,
                "nonblocking liveness is incompatible with Free=ThreadLocal"
            );
        }
    }
}

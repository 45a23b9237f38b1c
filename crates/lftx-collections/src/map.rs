// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

use lftx_runtime::{Abort, TxHandle};

/// Linearizable map interface. Return values follow the usual "previous
/// value" convention: `None` means the key was absent.
///
/// Outside a transaction every operation retries internally until it makes
/// progress and never returns `Err`. Inside a transaction, an `Err` means
/// the transaction was rolled back; the caller propagates it and retries
/// the whole transaction.
pub trait ConcurrentMap<K, V> {
    fn get(&self, handle: &TxHandle, key: &K) -> Result<Option<V>, Abort>;

    /// Insert only if absent; `Ok(false)` when the key already exists.
    fn insert(&self, handle: &TxHandle, key: K, value: V) -> Result<bool, Abort>;

    /// Insert or overwrite; returns the previous value.
    fn put(&self, handle: &TxHandle, key: K, value: V) -> Result<Option<V>, Abort>;

    fn remove(&self, handle: &TxHandle, key: &K) -> Result<Option<V>, Abort>;

    /// Overwrite only if present; returns the previous value.
    fn replace(&self, handle: &TxHandle, key: K, value: V) -> Result<Option<V>, Abort>;
}

/// Linearizable FIFO queue interface.
pub trait ConcurrentQueue<T> {
    fn enqueue(&self, handle: &TxHandle, value: T) -> Result<(), Abort>;

    fn dequeue(&self, handle: &TxHandle) -> Result<Option<T>, Abort>;
}

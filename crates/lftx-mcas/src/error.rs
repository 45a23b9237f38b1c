// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Recoverable transaction failures. Callers are expected to retry the
/// enclosing transaction; none of these variants indicate corruption.
///
/// Programmer errors against the engine contracts (double retire, nested
/// `tx_begin`) panic instead of surfacing here.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum Abort {
    /// The transaction was aborted before reaching its commit point, either
    /// explicitly or because a read/write-set inconsistency was detected
    /// mid-transaction.
    #[error("transaction aborted before commit")]
    BeforeCommit,
    /// Read-set validation or the epoch check failed during commit.
    #[error("transaction aborted during commit")]
    DuringCommit,
    /// A payload block from a newer epoch was opened by a thread whose
    /// active epoch is older. The outer transaction must restart.
    #[error("operation observed a block from a newer epoch")]
    OldSeesNew,
}

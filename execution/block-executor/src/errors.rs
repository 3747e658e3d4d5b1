// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

use meridian_dep_graph::GraphError;
use meridian_types::error::PanicError;
use thiserror::Error;

/// Batch-fatal errors, surfaced to the caller before any state is
/// persisted. Validation aborts and per-transaction execution failures are
/// contained within the engine and never appear here.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BlockExecutionError {
    /// Static modeling defect: a malformed access declaration or a cyclic
    /// dependency graph. Deterministic, so it would recur on every node;
    /// the whole batch is rejected and the base store left untouched.
    #[error(transparent)]
    Rejected(#[from] GraphError),
    /// Unrecoverable invariant violation inside the engine.
    #[error(transparent)]
    Fatal(#[from] PanicError),
}

pub type BlockExecutionResult<T> = Result<T, BlockExecutionError>;

/// Final per-transaction outcome of a completed batch, in original batch
/// order.
#[derive(Debug, PartialEq, Eq)]
pub enum TransactionStatus<O, E> {
    /// Committed; the output carries the write-set and ordered events.
    Committed(O),
    /// The transaction's own logic failed; nothing was written.
    Failed(E),
    /// Aborted more times than the configured bound allows.
    RetriesExhausted,
}

impl<O, E> TransactionStatus<O, E> {
    pub fn is_committed(&self) -> bool {
        matches!(self, TransactionStatus::Committed(_))
    }

    pub fn as_committed(&self) -> Option<&O> {
        match self {
            TransactionStatus::Committed(output) => Some(output),
            _ => None,
        }
    }
}

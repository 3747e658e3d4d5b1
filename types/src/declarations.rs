// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{
    access::{AccessModelError, AccessOperation},
    transaction::Transaction,
};

/// The declared access operations of one transaction: envelope-level
/// operations contributed by processing outside any message (fee deduction,
/// sequence bumps), followed by one operation list per decoded message.
///
/// The terminal commit anchor is not part of the declaration; the graph
/// builder appends exactly one per transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransactionAccesses {
    pub envelope: Vec<AccessOperation>,
    pub messages: Vec<Vec<AccessOperation>>,
}

impl TransactionAccesses {
    /// Flattened view pairing each operation with its message index.
    /// Envelope operations carry index 0; message `i` operations carry
    /// `i + 1`.
    pub fn indexed_ops(&self) -> impl Iterator<Item = (usize, &AccessOperation)> {
        self.envelope.iter().map(|op| (0, op)).chain(
            self.messages
                .iter()
                .enumerate()
                .flat_map(|(i, ops)| ops.iter().map(move |op| (i + 1, op))),
        )
    }
}

/// Collaborator interface: application modules declare, per transaction,
/// what state each of its units will touch. Implementations typically
/// expand [`crate::registry::DependencyRegistry`] templates against the
/// decoded messages.
///
/// Returned operations are NOT trusted: the engine validates every
/// operation centrally before graph construction, so a declaration source
/// cannot bypass the non-leaf/wildcard invariant.
pub trait AccessDeclarations<T: Transaction>: Sync {
    fn declared_accesses(&self, txn: &T) -> Result<TransactionAccesses, AccessModelError>;

    /// Concrete keys this transaction is expected to write, used to
    /// pre-publish estimates before its first execution. Purely an
    /// optimization hint; an empty answer is always correct.
    fn write_hints(&self, _txn: &T) -> Vec<T::Key> {
        Vec::new()
    }
}

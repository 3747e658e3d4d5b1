// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::view::SpeculativeView;
use meridian_mvstore::types::TxnIndex;
use meridian_types::{state_store::TStateStore, transaction::Transaction};
use std::fmt::Debug;

/// The execution result of a single transaction.
#[derive(Debug)]
pub enum ExecutionStatus<T, E> {
    /// Transaction was executed successfully.
    Success(T),
    /// The transaction's own logic failed (e.g. insufficient balance).
    /// This is a normal per-transaction outcome, not a scheduler fault: the
    /// write-set is discarded and the batch continues.
    Failure(E),
    /// The transaction exceeded the re-execution bound after repeated
    /// validation aborts and is reported failed instead of retried forever.
    RetriesExhausted,
}

/// Trait for the single-threaded transaction executor instantiated on each
/// worker. Reads and range iterations go through the provided view, which
/// resolves them against the multi-version store and captures them for
/// validation.
pub trait ExecutorTask: Sync {
    /// Type of transaction and its associated key and value.
    type Txn: Transaction;

    /// The output of a transaction, carrying its write-set and events.
    type Output: TransactionOutput<Txn = Self::Txn> + 'static;

    /// Type of error when the transaction's own logic fails.
    type Error: Clone + Send + Sync + Debug + 'static;

    /// Type used to initialize the executor; one instance is created per
    /// worker thread.
    type Argument: Sync + Copy;

    fn init(args: Self::Argument) -> Self;

    fn execute_transaction<S>(
        &self,
        view: &SpeculativeView<'_, Self::Txn, S>,
        txn: &Self::Txn,
        txn_idx: TxnIndex,
    ) -> ExecutionStatus<Self::Output, Self::Error>
    where
        S: TStateStore<
                Key = <Self::Txn as Transaction>::Key,
                Value = <Self::Txn as Transaction>::Value,
            >;
}

/// Trait for the execution result of a single transaction.
pub trait TransactionOutput: Send + Sync {
    type Txn: Transaction;

    /// The writes of the transaction, in application order.
    fn get_writes(
        &self,
    ) -> Vec<(
        <Self::Txn as Transaction>::Key,
        <Self::Txn as Transaction>::Value,
    )>;

    /// The events emitted by the transaction, in emission order.
    fn get_events(&self) -> Vec<<Self::Txn as Transaction>::Event>;
}

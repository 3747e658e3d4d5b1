// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::task::ExecutionStatus;
use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use meridian_mvstore::{execution_record::ExecutionRecord, types::TxnIndex};
use meridian_types::{
    error::{PanicError, code_invariant_error},
    transaction::Transaction,
};
use std::{fmt::Debug, sync::Arc};

/// Per-transaction slots for the latest captured execution record (input)
/// and the latest execution status (output). Records are swapped in whole
/// on every incarnation, so readers never observe a partially updated
/// record.
pub struct TxnLastInputOutput<T: Transaction, O, E> {
    inputs: Vec<CachePadded<ArcSwapOption<ExecutionRecord<T::Key>>>>, // txn_idx -> input.
    outputs: Vec<CachePadded<ArcSwapOption<ExecutionStatus<O, E>>>>,  // txn_idx -> output.
}

impl<T, O, E> TxnLastInputOutput<T, O, E>
where
    T: Transaction,
    O: Send + Sync,
    E: Send + Sync + Debug,
{
    pub fn new(num_txns: usize) -> Self {
        Self {
            inputs: (0..num_txns)
                .map(|_| CachePadded::new(ArcSwapOption::empty()))
                .collect(),
            outputs: (0..num_txns)
                .map(|_| CachePadded::new(ArcSwapOption::empty()))
                .collect(),
        }
    }

    pub(crate) fn record(
        &self,
        txn_idx: TxnIndex,
        input: ExecutionRecord<T::Key>,
        output: ExecutionStatus<O, E>,
    ) {
        self.inputs[txn_idx as usize].store(Some(Arc::new(input)));
        self.outputs[txn_idx as usize].store(Some(Arc::new(output)));
    }

    pub(crate) fn read_record(&self, txn_idx: TxnIndex) -> Option<Arc<ExecutionRecord<T::Key>>> {
        self.inputs[txn_idx as usize].load_full()
    }

    /// Must be called after parallel execution is done; grabs the output.
    /// Returns an error if other outstanding references to the recorded
    /// output exist.
    pub(crate) fn take_output(&self, txn_idx: TxnIndex) -> Result<ExecutionStatus<O, E>, PanicError> {
        let owning_ptr = self.outputs[txn_idx as usize].swap(None).ok_or_else(|| {
            code_invariant_error(format!(
                "Output for txn {txn_idx} must be recorded after execution"
            ))
        })?;

        Arc::try_unwrap(owning_ptr).map_err(|_| {
            code_invariant_error(format!(
                "Output for txn {txn_idx} must be uniquely owned after execution"
            ))
        })
    }
}

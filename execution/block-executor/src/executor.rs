// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::BlockExecutorConfig,
    errors::{BlockExecutionResult, TransactionStatus},
    scheduler::{Scheduler, SchedulerTask, Wave},
    task::{ExecutionStatus, ExecutorTask, TransactionOutput},
    txn_last_input_output::TxnLastInputOutput,
    view::SpeculativeView,
};
use meridian_dep_graph::{GraphError, build_dependency_graph};
use meridian_mvstore::{
    VersionedData,
    execution_record::ExecutionRecord,
    types::{TxnIndex, Version},
    validation::{ValidationOutcome, validate_record},
};
use meridian_types::{
    declarations::AccessDeclarations, state_store::TStateStore, transaction::Transaction,
};
use std::{collections::BTreeSet, marker::PhantomData};
use tracing::{debug, info, warn};

pub struct BlockExecutor<T, E, S, D> {
    config: BlockExecutorConfig,
    phantom: PhantomData<(T, E, S, D)>,
}

impl<T, E, S, D> BlockExecutor<T, E, S, D>
where
    T: Transaction,
    E: ExecutorTask<Txn = T>,
    S: TStateStore<Key = T::Key, Value = T::Value>,
    D: AccessDeclarations<T>,
{
    pub fn new(config: BlockExecutorConfig) -> Self {
        Self {
            config,
            phantom: PhantomData,
        }
    }

    /// Keys at which the transaction currently holds cells: the write-set of
    /// its last completed execution, or, before any execution completed, the
    /// estimate placeholders pre-published from its write hints.
    fn modified_keys(
        txn_idx: TxnIndex,
        write_hints: &[Vec<T::Key>],
        last_input_output: &TxnLastInputOutput<T, E::Output, E::Error>,
    ) -> BTreeSet<T::Key> {
        match last_input_output.read_record(txn_idx) {
            Some(prev_record) => prev_record.writes().clone(),
            None => write_hints[txn_idx as usize].iter().cloned().collect(),
        }
    }

    fn execute(
        &self,
        version_to_execute: Version,
        block: &[T],
        write_hints: &[Vec<T::Key>],
        last_input_output: &TxnLastInputOutput<T, E::Output, E::Error>,
        versioned_data: &VersionedData<T::Key, T::Value>,
        scheduler: &Scheduler,
        executor: &E,
        base: &S,
    ) -> SchedulerTask {
        let (txn_idx, incarnation) = version_to_execute;

        if incarnation > self.config.max_retries_per_txn {
            // Retry bound exceeded: report the transaction as failed rather
            // than retrying indefinitely, and clear its remaining cells so
            // no reader stays blocked on its estimates.
            warn!(txn_idx, incarnation, "retry bound exceeded, reporting transaction failed");
            for key in Self::modified_keys(txn_idx, write_hints, last_input_output) {
                versioned_data.delete(&key, txn_idx);
            }
            last_input_output.record(txn_idx, ExecutionRecord::new(), ExecutionStatus::RetriesExhausted);
            return scheduler.finish_execution(txn_idx, incarnation, true);
        }

        let txn = &block[txn_idx as usize];
        let view = SpeculativeView::new(versioned_data, base, txn_idx);
        let execute_result = executor.execute_transaction(&view, txn, txn_idx);

        if let Some(blocking_txn) = view.speculative_failure() {
            // Blocked on an estimate: the incarnation aborted on the first
            // blocked read and wrote nothing; requeue behind the blocker.
            debug!(txn_idx, incarnation, blocking_txn, "speculative run blocked, requeued");
            scheduler.finish_execution_with_dependency(txn_idx, incarnation, blocking_txn);
            return SchedulerTask::NoTask;
        }

        let mut prev_modified_keys = Self::modified_keys(txn_idx, write_hints, last_input_output);

        // For tracking whether this execution wrote outside of the previous
        // incarnation's write-set.
        let mut updates_outside = false;
        let mut written_keys = BTreeSet::new();
        if let ExecutionStatus::Success(output) = &execute_result {
            for (key, value) in output.get_writes() {
                if !prev_modified_keys.remove(&key) {
                    updates_outside = true;
                }
                versioned_data.write(&key, (txn_idx, incarnation), value);
                written_keys.insert(key);
            }
        }

        // Entries of the previous write-set that were not overwritten, and
        // unconsumed estimate placeholders, are removed: a failed execution
        // leaves no partial writes behind.
        for key in prev_modified_keys {
            versioned_data.delete(&key, txn_idx);
        }

        let mut record = view.take_record();
        record.set_writes(written_keys);
        last_input_output.record(txn_idx, record, execute_result);
        scheduler.finish_execution(txn_idx, incarnation, updates_outside)
    }

    fn validate(
        &self,
        version_to_validate: Version,
        wave: Wave,
        last_input_output: &TxnLastInputOutput<T, E::Output, E::Error>,
        versioned_data: &VersionedData<T::Key, T::Value>,
        scheduler: &Scheduler,
        base: &S,
    ) -> SchedulerTask {
        let (txn_idx, incarnation) = version_to_validate;
        let record = last_input_output
            .read_record(txn_idx)
            .expect("Prior execution record must be recorded");

        match validate_record(versioned_data, base, txn_idx, &record) {
            ValidationOutcome::Valid => {
                scheduler.finish_validation(txn_idx, wave);
                SchedulerTask::NoTask
            },
            ValidationOutcome::Invalid { blocking_txn } => {
                if scheduler.try_abort(txn_idx, incarnation) {
                    debug!(txn_idx, incarnation, ?blocking_txn, "validation failed, aborting");
                    // Mark the latest write-set as estimates so readers
                    // observe the pending re-execution, not stale data.
                    for key in record.writes() {
                        versioned_data.mark_estimate(key, txn_idx);
                    }
                    scheduler.finish_abort(txn_idx, incarnation, blocking_txn)
                } else {
                    SchedulerTask::NoTask
                }
            },
        }
    }

    fn worker_loop(
        &self,
        executor_arguments: E::Argument,
        block: &[T],
        write_hints: &[Vec<T::Key>],
        last_input_output: &TxnLastInputOutput<T, E::Output, E::Error>,
        versioned_data: &VersionedData<T::Key, T::Value>,
        scheduler: &Scheduler,
        base: &S,
    ) {
        // Make executor for each thread.
        let executor = E::init(executor_arguments);

        let mut scheduler_task = SchedulerTask::NoTask;
        loop {
            // Drain the commit frontier before picking up more work.
            while scheduler.try_commit().is_some() {}

            scheduler_task = match scheduler_task {
                SchedulerTask::ValidationTask(version_to_validate, wave) => self.validate(
                    version_to_validate,
                    wave,
                    last_input_output,
                    versioned_data,
                    scheduler,
                    base,
                ),
                SchedulerTask::ExecutionTask(version_to_execute) => self.execute(
                    version_to_execute,
                    block,
                    write_hints,
                    last_input_output,
                    versioned_data,
                    scheduler,
                    &executor,
                    base,
                ),
                SchedulerTask::NoTask => scheduler.next_task(),
                SchedulerTask::Done => break,
            };
        }
    }

    /// Executes one ordered batch to completion and applies the final
    /// write-set to the base store.
    ///
    /// Declaration expansion and graph construction run first; a modeling
    /// error or a dependency cycle rejects the whole batch with the base
    /// store untouched. Per-transaction execution failures and validation
    /// aborts are contained and never surface here.
    pub fn execute_block(
        &self,
        executor_arguments: E::Argument,
        signature_checked_block: &[T],
        declarations: &D,
        base_store: &S,
    ) -> BlockExecutionResult<Vec<TransactionStatus<E::Output, E::Error>>> {
        if signature_checked_block.is_empty() {
            return Ok(Vec::new());
        }
        let num_txns = signature_checked_block.len();

        let accesses = signature_checked_block
            .iter()
            .map(|txn| declarations.declared_accesses(txn))
            .collect::<Result<Vec<_>, _>>()
            .map_err(GraphError::from)?;
        let graph = build_dependency_graph(&accesses)?;

        let write_hints: Vec<Vec<T::Key>> = signature_checked_block
            .iter()
            .map(|txn| declarations.write_hints(txn))
            .collect();

        let versioned_data = VersionedData::new();
        for (txn_idx, hints) in write_hints.iter().enumerate() {
            for key in hints {
                versioned_data.publish_estimate(key, txn_idx as TxnIndex);
            }
        }

        let last_input_output = TxnLastInputOutput::new(num_txns);
        let scheduler = Scheduler::new(
            num_txns,
            graph.predecessor_lists(),
            graph.dependent_lists(),
            self.config.eager_speculation,
        );

        let concurrency_level = self.config.concurrency_level.clamp(1, num_txns);
        info!(
            num_txns,
            concurrency_level,
            eager = self.config.eager_speculation,
            "executing block in parallel"
        );

        rayon::scope(|s| {
            for _ in 0..concurrency_level {
                s.spawn(|_| {
                    self.worker_loop(
                        executor_arguments,
                        signature_checked_block,
                        &write_hints,
                        &last_input_output,
                        &versioned_data,
                        &scheduler,
                        base_store,
                    );
                });
            }
        });

        // Assemble outcomes and the final write-set in original batch
        // order; later transactions win on overlapping keys by apply order.
        let mut statuses = Vec::with_capacity(num_txns);
        let mut final_write_set: Vec<(T::Key, T::Value)> = Vec::new();
        for txn_idx in 0..num_txns {
            match last_input_output.take_output(txn_idx as TxnIndex)? {
                ExecutionStatus::Success(output) => {
                    final_write_set.extend(output.get_writes());
                    statuses.push(TransactionStatus::Committed(output));
                },
                ExecutionStatus::Failure(err) => statuses.push(TransactionStatus::Failed(err)),
                ExecutionStatus::RetriesExhausted => {
                    statuses.push(TransactionStatus::RetriesExhausted)
                },
            }
        }
        base_store.commit(final_write_set);
        info!(num_txns, "block execution complete");
        Ok(statuses)
    }
}

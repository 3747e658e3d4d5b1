// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::BlockExecutorConfig,
    errors::{BlockExecutionError, TransactionStatus},
    executor::BlockExecutor,
    proptest_types::types::{Output, Task, Transaction, UnionDeclarations, ValueType, run_and_assert},
    scheduler::{Scheduler, SchedulerTask},
    task::{ExecutionStatus, ExecutorTask, TransactionOutput},
    view::{SpeculativeAbort, SpeculativeView},
};
use claims::assert_err;
use meridian_dep_graph::GraphError;
use meridian_mvstore::{VersionedData, types::TxnIndex};
use meridian_types::{
    access::{AccessModelError, AccessOperation, Identifier, ResourceType},
    declarations::{AccessDeclarations, TransactionAccesses},
    state_store::{InMemoryStateStore, IterationDirection, KeyRange, TStateStore},
    transaction::Transaction as TransactionTrait,
};
use rand::random;
use std::sync::{Arc, atomic::AtomicUsize};

fn write_txn<K: Clone>(reads: Vec<K>, writes: Vec<(K, ValueType<u32>)>) -> Transaction<K, ValueType<u32>> {
    Transaction::Write {
        incarnation: Arc::new(AtomicUsize::new(0)),
        writes: vec![writes],
        reads: vec![reads],
    }
}

fn live(value: u32) -> ValueType<u32> {
    ValueType(value, true)
}

fn deletion() -> ValueType<u32> {
    ValueType(0, false)
}

///////////////////////////////////////////////////////////////////////////
// End-to-end batches against the sequential baseline.
///////////////////////////////////////////////////////////////////////////

const TOTAL_KEY_NUM: u64 = 10;
const WRITES_PER_KEY: u64 = 20;

#[test]
fn empty_block() {
    let base = InMemoryStateStore::<u32, ValueType<u32>>::new();
    let statuses = BlockExecutor::<
        Transaction<u32, ValueType<u32>>,
        Task<u32, ValueType<u32>>,
        _,
        UnionDeclarations,
    >::new(BlockExecutorConfig::default())
    .execute_block((), &[], &UnionDeclarations, &base)
    .unwrap();
    assert!(statuses.is_empty());
}

#[test]
fn conflicting_chains() {
    let mut transactions = vec![];
    // For every key, a chain of transactions that read and then reassign it.
    for _ in 0..TOTAL_KEY_NUM {
        let key = random::<[u8; 32]>();
        for _ in 0..WRITES_PER_KEY {
            transactions.push(write_txn(vec![key], vec![(key, live(random::<u32>()))]));
        }
    }
    run_and_assert(transactions, true);
}

#[test]
fn conflicting_chains_gated() {
    let mut transactions = vec![];
    for _ in 0..TOTAL_KEY_NUM {
        let key = random::<[u8; 32]>();
        for _ in 0..WRITES_PER_KEY {
            transactions.push(write_txn(vec![key], vec![(key, live(random::<u32>()))]));
        }
    }
    run_and_assert(transactions, false);
}

const NUM_BLOCKS: u64 = 5;
const TXN_PER_BLOCK: u64 = 30;

#[test]
fn one_reads_all_barrier() {
    let mut transactions = vec![];
    let keys: Vec<[u8; 32]> = (0..TXN_PER_BLOCK).map(|_| random::<[u8; 32]>()).collect();
    for _ in 0..NUM_BLOCKS {
        for key in &keys {
            transactions.push(write_txn(vec![*key], vec![(*key, live(random::<u32>()))]));
        }
        // One transaction reading the write results of every prior
        // transaction in the block.
        transactions.push(write_txn(keys.clone(), vec![]));
    }
    run_and_assert(transactions, true);
}

#[test]
fn one_writes_all_barrier() {
    let mut transactions = vec![];
    let keys: Vec<[u8; 32]> = (0..TXN_PER_BLOCK).map(|_| random::<[u8; 32]>()).collect();
    for _ in 0..NUM_BLOCKS {
        for key in &keys {
            transactions.push(write_txn(vec![*key], vec![(*key, live(random::<u32>()))]));
        }
        // One transaction overwriting every key of the block.
        transactions.push(write_txn(
            keys.clone(),
            keys.iter().map(|key| (*key, live(random::<u32>()))).collect(),
        ));
    }
    run_and_assert(transactions, true);
}

#[test]
fn early_failures() {
    let mut transactions = vec![];
    let keys: Vec<[u8; 32]> = (0..TXN_PER_BLOCK).map(|_| random::<[u8; 32]>()).collect();
    for _ in 0..NUM_BLOCKS {
        for key in &keys {
            transactions.push(write_txn(vec![*key], vec![(*key, live(random::<u32>()))]));
        }
        // A failing transaction: contained, the batch continues.
        transactions.push(Transaction::Fail);
    }
    run_and_assert(transactions, true);
}

#[test]
fn deletions_tombstone_prior_writes() {
    let key = random::<[u8; 32]>();
    let other = random::<[u8; 32]>();
    let transactions = vec![
        write_txn(vec![], vec![(key, live(7)), (other, live(1))]),
        write_txn(vec![key], vec![(key, deletion())]),
        // Reads after the deletion observe absence.
        write_txn(vec![key, other], vec![]),
    ];
    run_and_assert(transactions, true);
}

#[test]
fn serialization_order() {
    // T0 writes the key before T1 reads it in batch order: T1 must observe
    // T0's write under every scheduling, never the base value.
    let key = random::<[u8; 32]>();
    let base = InMemoryStateStore::new();
    base.insert(key, live(1));

    for _ in 0..20 {
        let transactions = vec![
            write_txn(vec![], vec![(key, live(42))]),
            write_txn(vec![key], vec![]),
        ];
        let statuses = BlockExecutor::<
            Transaction<[u8; 32], ValueType<u32>>,
            Task<[u8; 32], ValueType<u32>>,
            _,
            UnionDeclarations,
        >::new(BlockExecutorConfig::with_concurrency(2))
        .execute_block((), &transactions, &UnionDeclarations, &base)
        .unwrap();

        let Output(_, reads, _) = statuses[1]
            .as_committed()
            .expect("reader transaction must commit");
        assert_eq!(reads, &vec![Some(live(42))]);
    }
}

#[test]
fn two_estimates_in_sequence() {
    // T1 reads two keys for which T0's estimates are pre-published. A
    // speculative run of T1 aborts on the first blocked read and completes
    // after T0 finishes; the engine must terminate with baseline results.
    let (k1, k2) = (random::<[u8; 32]>(), random::<[u8; 32]>());
    for _ in 0..20 {
        let transactions = vec![
            write_txn(vec![], vec![(k1, live(5)), (k2, live(6))]),
            write_txn(vec![k1, k2], vec![]),
        ];
        run_and_assert(transactions, true);
    }
}

#[test]
fn retry_bound_zero_without_conflicts() {
    // Disjoint transactions never abort, so a zero retry bound must not
    // affect them.
    let transactions: Vec<_> = (0..20u32)
        .map(|i| {
            let key = [i as u8; 32];
            write_txn(vec![key], vec![(key, live(i))])
        })
        .collect();
    let base = InMemoryStateStore::new();
    let config = BlockExecutorConfig {
        concurrency_level: 4,
        max_retries_per_txn: 0,
        eager_speculation: true,
    };
    let statuses = BlockExecutor::<
        Transaction<[u8; 32], ValueType<u32>>,
        Task<[u8; 32], ValueType<u32>>,
        _,
        UnionDeclarations,
    >::new(config)
    .execute_block((), &transactions, &UnionDeclarations, &base)
    .unwrap();
    assert!(statuses.iter().all(|status| status.is_committed()));
}

///////////////////////////////////////////////////////////////////////////
// Batch rejection.
///////////////////////////////////////////////////////////////////////////

struct MalformedDeclarations;

impl AccessDeclarations<Transaction<[u8; 32], ValueType<u32>>> for MalformedDeclarations {
    fn declared_accesses(
        &self,
        _txn: &Transaction<[u8; 32], ValueType<u32>>,
    ) -> Result<TransactionAccesses, AccessModelError> {
        // A specific identifier on a non-leaf resource type: must be caught
        // by the central validation in the graph builder.
        Ok(TransactionAccesses {
            envelope: vec![AccessOperation::write(
                ResourceType::Bank,
                Identifier::exact("item-42"),
            )],
            messages: vec![],
        })
    }
}

#[test]
fn rejected_batch_leaves_store_untouched() {
    let key = random::<[u8; 32]>();
    let base = InMemoryStateStore::new();
    base.insert(key, live(11));

    let transactions = vec![write_txn(vec![], vec![(key, live(99))])];
    let err = assert_err!(
        BlockExecutor::<
            Transaction<[u8; 32], ValueType<u32>>,
            Task<[u8; 32], ValueType<u32>>,
            _,
            MalformedDeclarations,
        >::new(BlockExecutorConfig::default())
        .execute_block((), &transactions, &MalformedDeclarations, &base)
    );
    assert!(matches!(
        err,
        BlockExecutionError::Rejected(GraphError::Model(
            AccessModelError::NonLeafExactIdentifier { .. }
        ))
    ));

    // No partial commits: the base store is exactly as seeded.
    assert_eq!(base.len(), 1);
    assert_eq!(base.get(&key), Some(live(11)));
}

///////////////////////////////////////////////////////////////////////////
// One-shot abort latch.
///////////////////////////////////////////////////////////////////////////

#[test]
fn blocked_view_aborts_once() {
    let data = VersionedData::<u32, ValueType<u32>>::new();
    data.publish_estimate(&1, 0);
    data.publish_estimate(&2, 1);
    let base = InMemoryStateStore::<u32, ValueType<u32>>::new();
    let view = SpeculativeView::<Transaction<u32, ValueType<u32>>, _>::new(&data, &base, 5);
    assert_eq!(view.txn_idx(), 5);

    // The first blocked read latches the abort.
    assert_eq!(view.read(&1), Err(SpeculativeAbort { blocking_txn: 0 }));
    // A second blocked read (a different blocker) fails fast against the
    // latch: same abort, no second signal, nothing recorded.
    assert_eq!(view.read(&2), Err(SpeculativeAbort { blocking_txn: 0 }));
    assert_eq!(
        view.iterate(KeyRange::unbounded(), IterationDirection::Ascending)
            .err(),
        Some(SpeculativeAbort { blocking_txn: 0 })
    );

    assert_eq!(view.speculative_failure(), Some(0));
    let record = view.take_record();
    assert!(record.reads().is_empty());
    assert!(record.iterations().is_empty());
}

///////////////////////////////////////////////////////////////////////////
// Range iteration under concurrent deletion.
///////////////////////////////////////////////////////////////////////////

mod scan {
    use super::*;

    #[derive(Debug)]
    pub enum ScanTxn {
        Delete(u32),
        /// Iterates the whole range and writes the number of live keys it
        /// saw to `out`.
        CountRange {
            out: u32,
        },
    }

    impl TransactionTrait for ScanTxn {
        type Event = TxnIndex;
        type Key = u32;
        type Value = ValueType<u32>;
    }

    #[derive(Debug)]
    pub struct ScanOutput(Vec<(u32, ValueType<u32>)>);

    impl TransactionOutput for ScanOutput {
        type Txn = ScanTxn;

        fn get_writes(&self) -> Vec<(u32, ValueType<u32>)> {
            self.0.clone()
        }

        fn get_events(&self) -> Vec<TxnIndex> {
            vec![]
        }
    }

    pub struct ScanTask;

    impl ExecutorTask for ScanTask {
        type Argument = ();
        type Error = usize;
        type Output = ScanOutput;
        type Txn = ScanTxn;

        fn init(_argument: ()) -> Self {
            ScanTask
        }

        fn execute_transaction<S>(
            &self,
            view: &SpeculativeView<'_, ScanTxn, S>,
            txn: &ScanTxn,
            _txn_idx: TxnIndex,
        ) -> ExecutionStatus<ScanOutput, usize>
        where
            S: TStateStore<Key = u32, Value = ValueType<u32>>,
        {
            match txn {
                ScanTxn::Delete(key) => {
                    ExecutionStatus::Success(ScanOutput(vec![(*key, deletion())]))
                },
                ScanTxn::CountRange { out } => {
                    let count = match view
                        .iterate(KeyRange::unbounded(), IterationDirection::Ascending)
                    {
                        Ok(iter) => iter.count() as u32,
                        // Blocked: the run is discarded by the executor.
                        Err(_) => return ExecutionStatus::Success(ScanOutput(vec![])),
                    };
                    ExecutionStatus::Success(ScanOutput(vec![(*out, live(count))]))
                },
            }
        }
    }

    pub struct ScanDeclarations;

    impl AccessDeclarations<ScanTxn> for ScanDeclarations {
        fn declared_accesses(&self, txn: &ScanTxn) -> Result<TransactionAccesses, AccessModelError> {
            Ok(TransactionAccesses {
                envelope: vec![],
                messages: vec![match txn {
                    ScanTxn::Delete(key) => vec![AccessOperation::write(
                        ResourceType::BankBalance,
                        Identifier::exact(key.to_string()),
                    )],
                    ScanTxn::CountRange { out } => vec![
                        AccessOperation::read(ResourceType::BankBalance, Identifier::Wildcard),
                        AccessOperation::write(
                            ResourceType::BankBalance,
                            Identifier::exact(out.to_string()),
                        ),
                    ],
                }],
            })
        }

        fn write_hints(&self, txn: &ScanTxn) -> Vec<u32> {
            match txn {
                ScanTxn::Delete(key) => vec![*key],
                ScanTxn::CountRange { out } => vec![*out],
            }
        }
    }

    fn seeded_store() -> InMemoryStateStore<u32, ValueType<u32>> {
        let base = InMemoryStateStore::new();
        for key in [1, 2, 3] {
            base.insert(key, live(key * 10));
        }
        base
    }

    fn run_scan_batch(batch: &[ScanTxn], out: u32) -> u32 {
        let base = seeded_store();
        let statuses = BlockExecutor::<ScanTxn, ScanTask, _, ScanDeclarations>::new(
            BlockExecutorConfig::with_concurrency(2),
        )
        .execute_block((), batch, &ScanDeclarations, &base)
        .unwrap();
        assert!(statuses.iter().all(|status| status.is_committed()));
        match base.get(&out) {
            Some(ValueType(count, true)) => count,
            other => panic!("missing count output: {other:?}"),
        }
    }

    #[test]
    fn scan_observes_deletion_before_it() {
        // Sequentially, the count runs after the deletion: it must see two
        // live keys even when it speculated over three. Validation has to
        // flag the stale iteration although no surviving key changed value.
        for _ in 0..20 {
            let batch = [ScanTxn::Delete(2), ScanTxn::CountRange { out: 100 }];
            assert_eq!(run_scan_batch(&batch, 100), 2);
        }
    }

    #[test]
    fn scan_ignores_deletion_after_it() {
        let batch = [ScanTxn::CountRange { out: 100 }, ScanTxn::Delete(2)];
        assert_eq!(run_scan_batch(&batch, 100), 3);
    }
}

///////////////////////////////////////////////////////////////////////////
// Scheduler walkthroughs.
///////////////////////////////////////////////////////////////////////////

#[test]
fn scheduler_tasks() {
    let s = Scheduler::new_eager(6);
    assert_eq!(s.num_txns(), 6);

    for i in 0..5 {
        // No validation tasks before any finished execution.
        assert!(matches!(
            s.next_task(),
            SchedulerTask::ExecutionTask((j, 0)) if j == i
        ));
    }

    // Finish execution for txns 0, 2, 4. Txn 0 without revalidate_suffix:
    // the validation index is higher, so a validation task for txn 0 itself
    // comes back to the caller.
    assert!(matches!(
        s.finish_execution(0, 0, false),
        SchedulerTask::ValidationTask((0, 0), _)
    ));
    // Txn 2 requires a suffix revalidation: the validation index is pulled
    // down to 2 and nothing is returned to the caller.
    assert!(matches!(s.finish_execution(2, 0, true), SchedulerTask::NoTask));
    // The decreased validation index already covers txn 4.
    assert!(matches!(s.finish_execution(4, 0, false), SchedulerTask::NoTask));

    assert!(matches!(
        s.next_task(),
        SchedulerTask::ValidationTask((2, 0), _)
    ));
    // Txn 3 hasn't finished execution, so txn 4 is next for validation.
    assert!(matches!(
        s.next_task(),
        SchedulerTask::ValidationTask((4, 0), _)
    ));

    assert!(matches!(s.finish_execution(3, 0, true), SchedulerTask::NoTask));
    assert!(matches!(
        s.next_task(),
        SchedulerTask::ValidationTask((3, 0), _)
    ));
    // Txn 4 is dispatched for validation again in the new wave.
    assert!(matches!(
        s.next_task(),
        SchedulerTask::ValidationTask((4, 0), _)
    ));

    // Successful abort of txn 3.
    assert!(s.try_abort(3, 0));
    assert!(matches!(
        s.finish_execution(1, 0, false),
        SchedulerTask::ValidationTask((1, 0), _)
    ));

    // Unsuccessful abort of the same version.
    assert!(!s.try_abort(3, 0));
    assert!(matches!(
        s.finish_abort(3, 0, None),
        SchedulerTask::ExecutionTask((3, 1))
    ));

    // Can abort txn 4 even after its successful validation dispatch.
    assert!(s.try_abort(4, 0));
    assert!(matches!(
        s.finish_abort(4, 0, None),
        SchedulerTask::ExecutionTask((4, 1))
    ));

    // Aborted txns are executing; txn 5 is the next execution task.
    assert!(matches!(
        s.next_task(),
        SchedulerTask::ExecutionTask((5, 0))
    ));

    // Wrap up all outstanding executions.
    assert!(matches!(
        s.finish_execution(4, 1, false),
        SchedulerTask::ValidationTask((4, 1), _)
    ));
    assert!(matches!(
        s.finish_execution(3, 1, false),
        SchedulerTask::ValidationTask((3, 1), _)
    ));
    assert!(matches!(s.finish_execution(5, 0, false), SchedulerTask::NoTask));
    assert!(matches!(
        s.next_task(),
        SchedulerTask::ValidationTask((5, 0), _)
    ));
    assert!(matches!(s.next_task(), SchedulerTask::NoTask));

    // Validate everything at a high wave and commit strictly in order.
    for i in 0..6 {
        s.finish_validation(i, 10);
    }
    for i in 0..6 {
        assert_eq!(s.try_commit(), Some(i));
    }
    assert_eq!(s.try_commit(), None);
    assert!(matches!(s.next_task(), SchedulerTask::Done));
}

#[test]
fn scheduler_dependency_requeue() {
    let s = Scheduler::new_eager(10);

    for i in 0..5 {
        assert!(matches!(
            s.next_task(),
            SchedulerTask::ExecutionTask((j, 0)) if j == i
        ));
    }

    assert!(matches!(
        s.finish_execution(0, 0, false),
        SchedulerTask::ValidationTask((0, 0), _)
    ));

    // Txn 4 blocked on txn 2's estimate: discarded and parked on txn 2.
    s.finish_execution_with_dependency(4, 0, 2);
    // Txn 3 blocked on already-executed txn 0: requeued immediately.
    s.finish_execution_with_dependency(3, 0, 0);
    assert!(matches!(
        s.next_task(),
        SchedulerTask::ExecutionTask((3, 1))
    ));

    // Once txn 2 finishes, txn 4 is requeued with a fresh incarnation.
    assert!(matches!(
        s.finish_execution(2, 0, false),
        SchedulerTask::ValidationTask((2, 0), _)
    ));
    assert!(matches!(
        s.next_task(),
        SchedulerTask::ExecutionTask((4, 1))
    ));
}

#[test]
fn gated_scheduler_waits_for_predecessor_commits() {
    // Txn 1 depends on txn 0's commit.
    let s = Scheduler::new(2, vec![vec![], vec![0]], vec![vec![1], vec![]], false);

    assert!(matches!(s.next_task(), SchedulerTask::ExecutionTask((0, 0))));
    // Txn 1 is gated: no execution task until txn 0 commits.
    assert!(matches!(s.next_task(), SchedulerTask::NoTask));

    assert!(matches!(
        s.finish_execution(0, 0, false),
        SchedulerTask::ValidationTask((0, 0), _)
    ));
    s.finish_validation(0, 0);
    assert_eq!(s.try_commit(), Some(0));

    // The commit nudged txn 1 back into the execution window.
    assert!(matches!(s.next_task(), SchedulerTask::ExecutionTask((1, 0))));
    assert!(matches!(
        s.finish_execution(1, 0, false),
        SchedulerTask::ValidationTask((1, 0), _)
    ));
    s.finish_validation(1, 0);
    assert_eq!(s.try_commit(), Some(1));
    assert_eq!(s.try_commit(), None);
    assert!(matches!(s.next_task(), SchedulerTask::Done));
}

#[test]
fn abort_hint_defers_requeue_until_blocker_finishes() {
    let s = Scheduler::new_eager(3);

    for i in 0..3 {
        assert!(matches!(
            s.next_task(),
            SchedulerTask::ExecutionTask((j, 0)) if j == i
        ));
    }
    assert!(matches!(s.finish_execution(1, 0, false), SchedulerTask::ValidationTask((1, 0), _)));
    // The validation index already reached txn 2 through next_task bumps.
    assert!(matches!(s.finish_execution(2, 0, false), SchedulerTask::NoTask));

    // Txn 2 fails validation, attributed to txn 0 which is still executing:
    // no immediate re-execution task.
    assert!(s.try_abort(2, 0));
    assert!(matches!(s.finish_abort(2, 0, Some(0)), SchedulerTask::NoTask));

    // When txn 0 finishes, txn 2 is requeued.
    assert!(matches!(
        s.finish_execution(0, 0, false),
        SchedulerTask::ValidationTask((0, 0), _)
    ));
    assert!(matches!(s.next_task(), SchedulerTask::ExecutionTask((2, 1))));
}

#[test]
fn config_defaults_are_conservative() {
    let config = BlockExecutorConfig::default();
    assert!(config.concurrency_level >= 1);
    assert!(config.max_retries_per_txn > 0);
    assert!(config.eager_speculation);
}

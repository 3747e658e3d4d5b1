// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::BlockExecutorConfig,
    errors::TransactionStatus,
    executor::BlockExecutor,
    task::{ExecutionStatus, ExecutorTask, TransactionOutput},
    view::SpeculativeView,
};
use meridian_mvstore::types::TxnIndex;
use meridian_types::{
    access::{AccessModelError, AccessOperation, Identifier, ResourceType},
    declarations::{AccessDeclarations, TransactionAccesses},
    state_store::{InMemoryStateStore, TStateStore, TransactionWrite},
    transaction::Transaction as TransactionTrait,
};
use proptest::{arbitrary::Arbitrary, collection::vec, prelude::*, sample::Index};
use proptest_derive::Arbitrary;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Debug,
    hash::Hash,
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

///////////////////////////////////////////////////////////////////////////
// Generation of transactions
///////////////////////////////////////////////////////////////////////////

/// Wrapping the types used for testing to add a TransactionWrite
/// implementation. The bool field is true for a live value and false for a
/// deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueType<V>(pub V, pub bool);

impl<V: Send + Sync> TransactionWrite for ValueType<V> {
    fn is_deletion(&self) -> bool {
        !self.1
    }
}

#[derive(Clone, Copy)]
pub struct TransactionGenParams {
    /// Each transaction's write-set consists of between 1 and write_size-1
    /// many writes.
    pub write_size: usize,
    /// Each transaction's read-set consists of between 1 and read_size-1
    /// many reads.
    pub read_size: usize,
    /// The number of different read- and write-sets an execution of the
    /// transaction may have is between 1 and read_write_alternatives-1:
    /// read_write_alternatives = 2 corresponds to a static transaction,
    /// while larger values lead to dynamic behavior across incarnations.
    pub read_write_alternatives: usize,
}

impl TransactionGenParams {
    pub fn new_dynamic() -> Self {
        TransactionGenParams {
            write_size: 5,
            read_size: 10,
            read_write_alternatives: 4,
        }
    }
}

impl Default for TransactionGenParams {
    fn default() -> Self {
        TransactionGenParams {
            write_size: 5,
            read_size: 10,
            read_write_alternatives: 2,
        }
    }
}

#[derive(Arbitrary, Debug, Clone)]
#[proptest(params = "TransactionGenParams")]
pub struct TransactionGen<V: Arbitrary + Clone + Debug + Eq + 'static> {
    /// Keys and values for possible write-sets.
    #[proptest(
        strategy = "vec(vec((any::<Index>(), any::<V>()), 1..params.write_size), 1..params.read_write_alternatives)"
    )]
    keys_modified: Vec<Vec<(Index, V)>>,
    /// Keys for possible read-sets.
    #[proptest(
        strategy = "vec(vec(any::<Index>(), 1..params.read_size), 1..params.read_write_alternatives)"
    )]
    keys_read: Vec<Vec<Index>>,
}

/// A naive transaction used to test correctness and throughput of the
/// engine. To test behavior where reads and writes might be dynamic (depend
/// on previously read values), different read and write sets are generated
/// and chosen round-robin by an incarnation counter that each execution
/// increments.
#[derive(Debug, Clone)]
pub enum Transaction<K, V> {
    Write {
        /// Incarnation counter for dynamic behavior.
        incarnation: Arc<AtomicUsize>,
        /// All possible write-sets, chosen round-robin by incarnation.
        writes: Vec<Vec<(K, V)>>,
        /// All possible read-sets, chosen round-robin by incarnation.
        reads: Vec<Vec<K>>,
    },
    /// Fails with the transaction's own logic error; the batch continues.
    Fail,
}

impl<V: Arbitrary + Clone + Debug + Eq> TransactionGen<V> {
    fn writes_from_gen<K: Clone + Hash + Debug + Eq + Ord>(
        universe: &[K],
        generated: Vec<Vec<(Index, V)>>,
    ) -> Vec<Vec<(K, ValueType<V>)>> {
        let mut ret = vec![];
        for write_gen in generated.into_iter() {
            let mut keys_modified = BTreeSet::new();
            let mut incarnation_writes: Vec<(K, ValueType<V>)> = vec![];
            for (idx, value) in write_gen.into_iter() {
                let key = universe[idx.index(universe.len())].clone();
                if !keys_modified.contains(&key) {
                    keys_modified.insert(key.clone());
                    incarnation_writes.push((key, ValueType(value.clone(), true)));
                }
            }
            ret.push(incarnation_writes);
        }
        ret
    }

    fn reads_from_gen<K: Clone + Hash + Debug + Eq + Ord>(
        universe: &[K],
        generated: Vec<Vec<Index>>,
    ) -> Vec<Vec<K>> {
        generated.into_iter()
            .map(|read_gen| {
                read_gen
                    .into_iter()
                    .map(|idx| universe[idx.index(universe.len())].clone())
                    .collect()
            })
            .collect()
    }

    pub fn materialize<K: Clone + Hash + Debug + Eq + Ord>(
        self,
        universe: &[K],
    ) -> Transaction<K, ValueType<V>> {
        Transaction::Write {
            incarnation: Arc::new(AtomicUsize::new(0)),
            writes: Self::writes_from_gen(universe, self.keys_modified),
            reads: Self::reads_from_gen(universe, self.keys_read),
        }
    }
}

impl<K, V> TransactionTrait for Transaction<K, V>
where
    K: Ord + Hash + Clone + Debug + Send + Sync + 'static,
    V: TransactionWrite + Clone + Debug + 'static,
{
    type Key = K;
    type Value = V;
    type Event = TxnIndex;
}

///////////////////////////////////////////////////////////////////////////
// Naive transaction executor implementation.
///////////////////////////////////////////////////////////////////////////

pub struct Task<K, V>(PhantomData<(K, V)>);

impl<K, V> Task<K, V> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<K, V> Default for Task<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ExecutorTask for Task<K, V>
where
    K: Ord + Hash + Clone + Debug + Send + Sync + 'static,
    V: TransactionWrite + Clone + Debug + Eq + 'static,
{
    type Argument = ();
    type Error = usize;
    type Output = Output<K, V>;
    type Txn = Transaction<K, V>;

    fn init(_argument: Self::Argument) -> Self {
        Self::new()
    }

    fn execute_transaction<S>(
        &self,
        view: &SpeculativeView<'_, Self::Txn, S>,
        txn: &Self::Txn,
        txn_idx: TxnIndex,
    ) -> ExecutionStatus<Self::Output, Self::Error>
    where
        S: TStateStore<Key = K, Value = V>,
    {
        match txn {
            Transaction::Write {
                incarnation,
                reads,
                writes,
            } => {
                // The incarnation counter selects the read- and write-set
                // of this execution round-robin, simulating dynamic
                // behavior across incarnations.
                let idx = incarnation.fetch_add(1, Ordering::SeqCst);
                let read_idx = idx % reads.len();
                let write_idx = idx % writes.len();

                let mut reads_result = vec![];
                for key in reads[read_idx].iter() {
                    match view.read(key) {
                        Ok(value) => reads_result.push(value.map(|v| (*v).clone())),
                        // Blocked read: the executor discards this run via
                        // the view's abort latch, the result is irrelevant.
                        Err(_) => return ExecutionStatus::Success(Output::empty()),
                    }
                }
                ExecutionStatus::Success(Output(
                    writes[write_idx].clone(),
                    reads_result,
                    vec![txn_idx],
                ))
            },
            Transaction::Fail => ExecutionStatus::Failure(txn_idx as usize),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Output<K, V>(
    pub Vec<(K, V)>,
    pub Vec<Option<V>>,
    pub Vec<TxnIndex>, // events
);

impl<K, V> Output<K, V> {
    pub fn empty() -> Self {
        Self(vec![], vec![], vec![])
    }
}

impl<K, V> TransactionOutput for Output<K, V>
where
    K: Ord + Hash + Clone + Debug + Send + Sync + 'static,
    V: TransactionWrite + Clone + Debug + 'static,
{
    type Txn = Transaction<K, V>;

    fn get_writes(&self) -> Vec<(K, V)> {
        self.0.clone()
    }

    fn get_events(&self) -> Vec<TxnIndex> {
        self.2.clone()
    }
}

///////////////////////////////////////////////////////////////////////////
// Access declarations for generated transactions.
///////////////////////////////////////////////////////////////////////////

/// Declares the union of all read/write alternatives of a generated
/// transaction, the way a conservative static analysis would. Write hints
/// are only produced for static write-sets (a dynamic transaction's writes
/// are not predictable).
pub struct UnionDeclarations;

fn balance_id<K: Debug>(key: &K) -> Identifier {
    Identifier::exact(format!("{:?}", key))
}

impl<K, V> AccessDeclarations<Transaction<K, V>> for UnionDeclarations
where
    K: Ord + Hash + Clone + Debug + Send + Sync + 'static,
    V: TransactionWrite + Clone + Debug + 'static,
{
    fn declared_accesses(
        &self,
        txn: &Transaction<K, V>,
    ) -> Result<TransactionAccesses, AccessModelError> {
        Ok(match txn {
            Transaction::Write { reads, writes, .. } => TransactionAccesses {
                envelope: vec![],
                messages: vec![
                    reads
                        .iter()
                        .flatten()
                        .map(|key| {
                            AccessOperation::read(ResourceType::BankBalance, balance_id(key))
                        })
                        .chain(writes.iter().flatten().map(|(key, _)| {
                            AccessOperation::write(ResourceType::BankBalance, balance_id(key))
                        }))
                        .collect(),
                ],
            },
            Transaction::Fail => TransactionAccesses::default(),
        })
    }

    fn write_hints(&self, txn: &Transaction<K, V>) -> Vec<K> {
        match txn {
            Transaction::Write { writes, .. } if writes.len() == 1 => {
                writes[0].iter().map(|(key, _)| key.clone()).collect()
            },
            _ => vec![],
        }
    }
}

///////////////////////////////////////////////////////////////////////////
// Sequential baseline implementation.
///////////////////////////////////////////////////////////////////////////

/// Sequential baseline of the execution result for generated transactions.
/// Must be generated after parallel execution so that the incarnation
/// counters identify the final read/write sets of dynamic transactions.
pub struct ExpectedOutput<K, V> {
    /// Per transaction: Some(read results) for a committed transaction,
    /// None for a failed one.
    results: Vec<Option<Vec<Option<V>>>>,
    final_state: BTreeMap<K, V>,
}

impl<K, V> ExpectedOutput<K, ValueType<V>>
where
    K: Ord + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Debug + Eq + Send + Sync + 'static,
{
    pub fn generate_baseline(
        txns: &[Transaction<K, ValueType<V>>],
        initial_state: BTreeMap<K, ValueType<V>>,
    ) -> Self {
        let mut current_world = initial_state;
        let mut results = vec![];
        for txn in txns.iter() {
            match txn {
                Transaction::Fail => results.push(None),
                Transaction::Write {
                    incarnation,
                    reads,
                    writes,
                } => {
                    // The counter value prior to the fetch_add of the last
                    // execution selects the final read/write sets.
                    let incarnation = incarnation.load(Ordering::SeqCst);
                    let read_set = if reads.len() == 1 {
                        &reads[0]
                    } else {
                        assert!(incarnation > 0, "must run after parallel execution");
                        &reads[(incarnation - 1) % reads.len()]
                    };
                    let write_set = if writes.len() == 1 {
                        &writes[0]
                    } else {
                        assert!(incarnation > 0, "must run after parallel execution");
                        &writes[(incarnation - 1) % writes.len()]
                    };

                    let result = read_set
                        .iter()
                        .map(|key| current_world.get(key).cloned())
                        .collect();
                    for (key, value) in write_set.iter() {
                        if value.is_deletion() {
                            current_world.remove(key);
                        } else {
                            current_world.insert(key.clone(), value.clone());
                        }
                    }
                    results.push(Some(result));
                },
            }
        }
        Self {
            results,
            final_state: current_world,
        }
    }

    pub fn assert_output(
        &self,
        statuses: &[TransactionStatus<Output<K, ValueType<V>>, usize>],
        store: &InMemoryStateStore<K, ValueType<V>>,
    ) {
        assert_eq!(statuses.len(), self.results.len());
        for (txn_idx, (expected, status)) in
            self.results.iter().zip(statuses.iter()).enumerate()
        {
            match (expected, status) {
                (Some(expected_reads), TransactionStatus::Committed(Output(_, reads, events))) => {
                    assert_eq!(expected_reads, reads, "read results diverge at txn {txn_idx}");
                    // Events surface in original batch order.
                    assert_eq!(events, &vec![txn_idx as TxnIndex]);
                },
                (None, TransactionStatus::Failed(err)) => assert_eq!(*err, txn_idx),
                (expected, status) => {
                    panic!("status mismatch at txn {txn_idx}: expected {expected:?}, got {status:?}")
                },
            }
        }

        // The persisted state must be byte-identical to the sequential
        // world.
        assert_eq!(store.len(), self.final_state.len());
        for (key, value) in self.final_state.iter() {
            assert_eq!(store.get(key).as_ref(), Some(value));
        }
    }
}

/// Runs the batch in parallel against an empty base store and asserts
/// byte-identical results to the sequential baseline.
pub fn run_and_assert<K, V>(transactions: Vec<Transaction<K, ValueType<V>>>, eager: bool)
where
    K: Ord + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Debug + Eq + Send + Sync + 'static,
{
    let base = InMemoryStateStore::new();
    let config = BlockExecutorConfig {
        concurrency_level: num_cpus::get(),
        // High enough that generated conflict storms never hit the bound.
        max_retries_per_txn: 10_000,
        eager_speculation: eager,
    };
    let statuses = BlockExecutor::<
        Transaction<K, ValueType<V>>,
        Task<K, ValueType<V>>,
        InMemoryStateStore<K, ValueType<V>>,
        UnionDeclarations,
    >::new(config)
    .execute_block((), &transactions, &UnionDeclarations, &base)
    .expect("no modeling errors in generated batches");

    let baseline = ExpectedOutput::generate_baseline(&transactions, BTreeMap::new());
    baseline.assert_output(&statuses, &base);
}

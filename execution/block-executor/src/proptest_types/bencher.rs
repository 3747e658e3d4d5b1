// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::BlockExecutorConfig,
    executor::BlockExecutor,
    proptest_types::types::{Task, Transaction, TransactionGen, UnionDeclarations, ValueType},
};
use criterion::{BatchSize, Bencher as CBencher};
use meridian_types::state_store::InMemoryStateStore;
use proptest::{
    arbitrary::Arbitrary,
    collection::vec,
    prelude::*,
    strategy::{Strategy, ValueTree},
    test_runner::TestRunner,
};
use std::{fmt::Debug, hash::Hash, marker::PhantomData};

pub struct Bencher<K, V> {
    transaction_size: usize,
    universe_size: usize,
    phantom: PhantomData<(K, V)>,
}

pub(crate) struct BencherState<K, V>
where
    K: Ord + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Debug + Eq + Send + Sync + 'static,
{
    transactions: Vec<Transaction<K, ValueType<V>>>,
}

impl<K, V> Bencher<K, V>
where
    K: Ord + Hash + Clone + Debug + Send + Sync + Arbitrary + 'static,
    V: Arbitrary + Clone + Debug + Eq + Send + Sync + 'static,
{
    pub fn new(transaction_size: usize, universe_size: usize) -> Self {
        Self {
            transaction_size,
            universe_size,
            phantom: PhantomData,
        }
    }

    pub fn bench(&self, key_strategy: &impl Strategy<Value = K>, b: &mut CBencher) {
        b.iter_batched(
            || {
                BencherState::<K, V>::with_universe(
                    vec(key_strategy, self.universe_size),
                    self.transaction_size,
                )
            },
            |state| state.run(),
            // The input here is the entire list of signature verified
            // transactions, hence the large batch size.
            BatchSize::LargeInput,
        )
    }
}

impl<K, V> BencherState<K, V>
where
    K: Ord + Hash + Clone + Debug + Send + Sync + 'static,
    V: Arbitrary + Clone + Debug + Eq + Send + Sync + 'static,
{
    /// Creates a new benchmark state with a universe of possible keys and a
    /// number of transactions, generated from proptest strategies.
    pub(crate) fn with_universe(
        universe_strategy: impl Strategy<Value = Vec<K>>,
        num_transactions: usize,
    ) -> Self {
        let mut runner = TestRunner::default();
        let key_universe = universe_strategy
            .new_tree(&mut runner)
            .expect("creating a new value should succeed")
            .current();

        let transaction_gens = vec(any::<TransactionGen<V>>(), num_transactions)
            .new_tree(&mut runner)
            .expect("creating a new value should succeed")
            .current();

        Self {
            transactions: transaction_gens
                .into_iter()
                .map(|txn_gen| txn_gen.materialize(&key_universe))
                .collect(),
        }
    }

    pub(crate) fn run(self) {
        let base = InMemoryStateStore::new();
        let config = BlockExecutorConfig {
            concurrency_level: num_cpus::get(),
            max_retries_per_txn: 10_000,
            eager_speculation: true,
        };
        BlockExecutor::<
            Transaction<K, ValueType<V>>,
            Task<K, ValueType<V>>,
            InMemoryStateStore<K, ValueType<V>>,
            UnionDeclarations,
        >::new(config)
        .execute_block((), &self.transactions, &UnionDeclarations, &base)
        .expect("generated batches must execute");
    }
}

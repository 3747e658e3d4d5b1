// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{
    iterator::MergeIterator,
    types::{Flag, Incarnation, MVDataError, TxnIndex, Version},
};
use crossbeam::utils::CachePadded;
use dashmap::DashMap;
use meridian_types::state_store::{IterationDirection, KeyRange, TStateStore, TransactionWrite};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Debug,
    hash::Hash,
    sync::Arc,
};

/// In order to store base values at the lowest index, i.e. at index 0,
/// without conflicting with actual transaction index 0, the following
/// struct wraps the index and internally increments it by 1.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ShiftedTxnIndex {
    idx: TxnIndex,
}

impl ShiftedTxnIndex {
    fn new(real_idx: TxnIndex) -> Self {
        Self { idx: real_idx + 1 }
    }

    fn idx(self) -> TxnIndex {
        debug_assert!(self.idx > 0, "base version has no transaction index");
        self.idx - 1
    }

    fn zero() -> Self {
        Self { idx: 0 }
    }
}

struct Entry<V> {
    incarnation: Incarnation,
    /// `None` only for estimates pre-published from write hints, which have
    /// no prior value to retain.
    value: Option<Arc<V>>,
    flag: Flag,
}

impl<V> Entry<V> {
    fn write(incarnation: Incarnation, value: V) -> Self {
        Self {
            incarnation,
            value: Some(Arc::new(value)),
            flag: Flag::Done,
        }
    }

    fn estimate() -> Self {
        Self {
            incarnation: 0,
            value: None,
            flag: Flag::Estimate,
        }
    }
}

/// Maps each key to an ordered tree of versioned entries, one per writing
/// transaction index. A separate ordered key index supports range
/// iteration, which the hash-sharded map cannot provide by itself.
pub struct VersionedData<K, V> {
    values: DashMap<K, BTreeMap<ShiftedTxnIndex, CachePadded<Entry<V>>>>,
    key_index: Mutex<BTreeSet<K>>,
}

impl<K, V> VersionedData<K, V>
where
    K: Ord + Hash + Clone + Debug + Send + Sync,
    V: TransactionWrite,
{
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
            key_index: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn num_keys(&self) -> usize {
        self.values.len()
    }

    /// Latest entry visible below `txn_idx`: the value written by the
    /// highest transaction index `< txn_idx` holding a cell for `key`.
    /// An estimate cell reports the blocking transaction instead of data.
    pub fn read(&self, key: &K, txn_idx: TxnIndex) -> Result<(Version, Arc<V>), MVDataError> {
        match self.values.get(key) {
            Some(tree) => {
                let (shifted_idx, entry) = tree
                    .range(ShiftedTxnIndex::zero()..ShiftedTxnIndex::new(txn_idx))
                    .next_back()
                    .ok_or(MVDataError::NotFound)?;
                if entry.flag == Flag::Estimate {
                    return Err(MVDataError::Dependency(shifted_idx.idx()));
                }
                let value = entry
                    .value
                    .clone()
                    .expect("Non-estimate entry must carry a value");
                Ok(((shifted_idx.idx(), entry.incarnation), value))
            },
            None => Err(MVDataError::NotFound),
        }
    }

    /// Installs or overwrites transaction `txn_idx`'s cell for `key`,
    /// replacing any prior estimate at the same index.
    pub fn write(&self, key: &K, version: Version, value: V) {
        let (txn_idx, incarnation) = version;
        self.values.entry(key.clone()).or_default().insert(
            ShiftedTxnIndex::new(txn_idx),
            CachePadded::new(Entry::write(incarnation, value)),
        );
        self.key_index.lock().insert(key.clone());
    }

    /// Installs transaction `txn_idx`'s cells for all of `writes`,
    /// replacing prior estimates for the same keys. Each per-key update is
    /// atomic; readers never observe a partially written cell.
    pub fn write_set(
        &self,
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        writes: impl IntoIterator<Item = (K, V)>,
    ) {
        for (key, value) in writes {
            self.write(&key, (txn_idx, incarnation), value);
        }
    }

    /// Pre-publishes a placeholder for a write transaction `txn_idx` is
    /// expected to make. Readers below a real write observe it as a
    /// dependency. A cell already present at the index is left untouched.
    pub fn publish_estimate(&self, key: &K, txn_idx: TxnIndex) {
        self.values
            .entry(key.clone())
            .or_default()
            .entry(ShiftedTxnIndex::new(txn_idx))
            .or_insert_with(|| CachePadded::new(Entry::estimate()));
        self.key_index.lock().insert(key.clone());
    }

    /// Marks the entry written by `txn_idx` at `key` as an estimate for a
    /// future incarnation. Will panic if the entry is not in the
    /// data-structure.
    pub fn mark_estimate(&self, key: &K, txn_idx: TxnIndex) {
        let mut tree = self.values.get_mut(key).expect("Path must exist");
        tree.get_mut(&ShiftedTxnIndex::new(txn_idx))
            .expect("Entry by the transaction must exist to be marked an estimate")
            .flag = Flag::Estimate;
    }

    /// Deletes the entry of transaction `txn_idx` at `key`, if present.
    pub fn delete(&self, key: &K, txn_idx: TxnIndex) {
        if let Some(mut tree) = self.values.get_mut(key) {
            tree.remove(&ShiftedTxnIndex::new(txn_idx));
        }
    }

    /// The non-estimate entries visible to `txn_idx` in `range`, in
    /// ascending key order, tombstones included (iteration uses them to
    /// shadow base-store keys). Returns the blocking transaction if an
    /// estimate is visible anywhere in the range: iterating over a
    /// placeholder must abort the reader exactly like reading one.
    pub fn range_snapshot(
        &self,
        range: &KeyRange<K>,
        txn_idx: TxnIndex,
    ) -> Result<Vec<(K, Version, Arc<V>)>, MVDataError> {
        let keys: Vec<K> = {
            let index = self.key_index.lock();
            index.range(range.bounds()).cloned().collect()
        };

        let mut snapshot = Vec::with_capacity(keys.len());
        for key in keys {
            match self.read(&key, txn_idx) {
                Ok((version, value)) => snapshot.push((key, version, value)),
                Err(MVDataError::NotFound) => {},
                Err(MVDataError::Dependency(blocking)) => {
                    return Err(MVDataError::Dependency(blocking));
                },
            }
        }
        Ok(snapshot)
    }

    /// A lazy, finite, restartable merge of the base store with all version
    /// cells visible to `txn_idx`, in key order, skipping tombstones. The
    /// version-layer snapshot is materialized here, at creation, so the
    /// sequence reflects the layer as of this call even if other tasks
    /// install writes at lower indices mid-iteration.
    pub fn iterate<'a, S>(
        &self,
        base: &'a S,
        range: &KeyRange<K>,
        direction: IterationDirection,
        txn_idx: TxnIndex,
    ) -> Result<MergeIterator<'a, K, V>, MVDataError>
    where
        S: TStateStore<Key = K, Value = V>,
        V: Clone + 'a,
        K: 'a,
    {
        let mut snapshot = self.range_snapshot(range, txn_idx)?;
        if direction == IterationDirection::Descending {
            snapshot.reverse();
        }
        Ok(MergeIterator::new(
            base.iter_range(range, direction),
            snapshot,
            direction,
        ))
    }
}

impl<K, V> Default for VersionedData<K, V>
where
    K: Ord + Hash + Clone + Debug + Send + Sync,
    V: TransactionWrite,
{
    fn default() -> Self {
        Self::new()
    }
}

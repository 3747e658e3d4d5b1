// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt::Debug, hash::Hash, ops::Bound};

/// A value produced by a transaction write. Deletions act as tombstones in
/// the versioned store and are skipped by range iteration.
pub trait TransactionWrite: Send + Sync {
    fn is_deletion(&self) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IterationDirection {
    Ascending,
    Descending,
}

/// Half-open key interval `[start, end)`; `None` bounds are unbounded.
/// Descending iteration walks the same interval in reverse.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRange<K> {
    pub start: Option<K>,
    pub end: Option<K>,
}

impl<K: Ord + Clone> KeyRange<K> {
    pub fn new(start: Option<K>, end: Option<K>) -> Self {
        Self { start, end }
    }

    pub fn unbounded() -> Self {
        Self {
            start: None,
            end: None,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        if let Some(start) = &self.start {
            if key < start {
                return false;
            }
        }
        if let Some(end) = &self.end {
            if key >= end {
                return false;
            }
        }
        true
    }

    pub fn bounds(&self) -> (Bound<K>, Bound<K>) {
        let lower = match &self.start {
            Some(k) => Bound::Included(k.clone()),
            None => Bound::Unbounded,
        };
        let upper = match &self.end {
            Some(k) => Bound::Excluded(k.clone()),
            None => Bound::Unbounded,
        };
        (lower, upper)
    }
}

/// The base (version-0) store beneath all speculative versions. Frozen for
/// the duration of a batch; `commit` is invoked exactly once with the final
/// write-set after every transaction of the batch has committed.
pub trait TStateStore: Sync {
    type Key: Ord + Hash + Clone + Debug + Send + Sync;
    type Value: TransactionWrite + Clone;

    fn get(&self, key: &Self::Key) -> Option<Self::Value>;

    /// Live key/value pairs in `range`, in `direction` order. Tombstoned
    /// entries never appear.
    fn iter_range<'a>(
        &'a self,
        range: &KeyRange<Self::Key>,
        direction: IterationDirection,
    ) -> Box<dyn Iterator<Item = (Self::Key, Self::Value)> + 'a>;

    /// Applies a finalized write-set. Values for which
    /// [`TransactionWrite::is_deletion`] holds remove the key.
    fn commit(&self, write_set: Vec<(Self::Key, Self::Value)>);
}

/// Reference in-memory backend: a BTreeMap behind a RwLock. Used by the
/// engine's tests and suitable as the bottom layer of small deployments.
#[derive(Debug, Default)]
pub struct InMemoryStateStore<K, V> {
    inner: RwLock<BTreeMap<K, V>>,
}

impl<K: Ord + Clone, V: Clone> InMemoryStateStore<K, V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, key: K, value: V) {
        self.inner.write().insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.read().keys().cloned().collect()
    }
}

impl<K, V> TStateStore for InMemoryStateStore<K, V>
where
    K: Ord + Hash + Clone + Debug + Send + Sync,
    V: TransactionWrite + Clone,
{
    type Key = K;
    type Value = V;

    fn get(&self, key: &K) -> Option<V> {
        self.inner.read().get(key).cloned()
    }

    fn iter_range<'a>(
        &'a self,
        range: &KeyRange<K>,
        direction: IterationDirection,
    ) -> Box<dyn Iterator<Item = (K, V)> + 'a> {
        let guard = self.inner.read();
        let mut items: Vec<(K, V)> = guard
            .range(range.bounds())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if direction == IterationDirection::Descending {
            items.reverse();
        }
        Box::new(items.into_iter())
    }

    fn commit(&self, write_set: Vec<(K, V)>) {
        let mut guard = self.inner.write();
        for (key, value) in write_set {
            if value.is_deletion() {
                guard.remove(&key);
            } else {
                guard.insert(key, value);
            }
        }
    }
}

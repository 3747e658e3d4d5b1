// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::types::Version;
use meridian_types::state_store::{IterationDirection, KeyRange};
use std::collections::BTreeSet;

/// Where a captured read resolved: a versioned cell of the multi-version
/// layer, or the base store beneath it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOrigin {
    Versioned(Version),
    Storage,
}

/// One read observed during a speculative execution, captured for
/// re-derivation at validation time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadDescriptor<K> {
    key: K,
    origin: ReadOrigin,
}

impl<K> ReadDescriptor<K> {
    pub fn from_versioned(key: K, version: Version) -> Self {
        Self {
            key,
            origin: ReadOrigin::Versioned(version),
        }
    }

    pub fn from_storage(key: K) -> Self {
        Self {
            key,
            origin: ReadOrigin::Storage,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn origin(&self) -> ReadOrigin {
        self.origin
    }

    /// Whether the read would observe the same versioned cell now.
    /// Version comparison suffices: versions are never reused within a
    /// batch, so an equal version implies an identical value.
    pub fn validate_versioned(&self, version: Version) -> bool {
        self.origin == ReadOrigin::Versioned(version)
    }

    /// Whether the read correctly fell through to the base store.
    pub fn validate_storage(&self) -> bool {
        self.origin == ReadOrigin::Storage
    }
}

/// One range iteration observed during a speculative execution: the range
/// and direction requested, the exact key sequence yielded, and whether the
/// caller stopped before exhausting it (the last observed key being the
/// early-stop point).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IterationDescriptor<K> {
    pub range: KeyRange<K>,
    pub direction: IterationDirection,
    pub observed: Vec<K>,
    pub early_stopped: bool,
}

impl<K> IterationDescriptor<K> {
    pub fn early_stop_key(&self) -> Option<&K> {
        self.early_stopped.then(|| self.observed.last()).flatten()
    }
}

/// Everything one incarnation of a transaction observed and produced:
/// consumed once at validation time, discarded when the transaction commits
/// or is requeued.
#[derive(Clone, Debug)]
pub struct ExecutionRecord<K: Ord> {
    reads: Vec<ReadDescriptor<K>>,
    iterations: Vec<IterationDescriptor<K>>,
    writes: BTreeSet<K>,
}

impl<K: Ord> ExecutionRecord<K> {
    pub fn new() -> Self {
        Self {
            reads: Vec::new(),
            iterations: Vec::new(),
            writes: BTreeSet::new(),
        }
    }

    pub fn push_read(&mut self, read: ReadDescriptor<K>) {
        self.reads.push(read);
    }

    pub fn push_iteration(&mut self, iteration: IterationDescriptor<K>) {
        self.iterations.push(iteration);
    }

    pub fn set_writes(&mut self, writes: impl IntoIterator<Item = K>) {
        self.writes = writes.into_iter().collect();
    }

    pub fn reads(&self) -> &[ReadDescriptor<K>] {
        &self.reads
    }

    pub fn iterations(&self) -> &[IterationDescriptor<K>] {
        &self.iterations
    }

    pub fn writes(&self) -> &BTreeSet<K> {
        &self.writes
    }
}

impl<K: Ord> Default for ExecutionRecord<K> {
    fn default() -> Self {
        Self::new()
    }
}

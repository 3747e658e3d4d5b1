// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

use meridian_mvstore::{
    VersionedData,
    execution_record::{ExecutionRecord, IterationDescriptor, ReadDescriptor},
    iterator::MergeIterator,
    types::{MVDataError, TxnIndex},
};
use meridian_types::{
    state_store::{IterationDirection, KeyRange, TStateStore, TransactionWrite},
    transaction::Transaction,
};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// The speculative run is blocked on a write the named transaction has not
/// performed yet. The current incarnation must stop; it will be requeued
/// once the blocking transaction finishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("speculative execution blocked on transaction {blocking_txn}")]
pub struct SpeculativeAbort {
    pub blocking_txn: TxnIndex,
}

/// A struct used by a single thread performing one execution task. It is
/// passed to the transaction logic and acts as a proxy resolving reads and
/// range iterations against the multi-version store first, falling back to
/// the base store, while capturing everything observed for validation.
///
/// The abort latch is one-shot by construction: the first blocked read
/// records the blocking transaction, and every later read or iteration
/// fails fast without recording anything. The only signal the scheduler
/// ever consumes is the single post-execution check of
/// [`Self::speculative_failure`], so a second blocked read can never
/// deliver a second signal to a consumer that has stopped listening.
pub struct SpeculativeView<'a, T: Transaction, S> {
    versioned_data: &'a VersionedData<T::Key, T::Value>,
    base: &'a S,
    txn_idx: TxnIndex,
    abort_latch: Mutex<Option<TxnIndex>>,
    captured: Mutex<ExecutionRecord<T::Key>>,
}

impl<'a, T, S> SpeculativeView<'a, T, S>
where
    T: Transaction,
    S: TStateStore<Key = T::Key, Value = T::Value>,
{
    pub(crate) fn new(
        versioned_data: &'a VersionedData<T::Key, T::Value>,
        base: &'a S,
        txn_idx: TxnIndex,
    ) -> Self {
        Self {
            versioned_data,
            base,
            txn_idx,
            abort_latch: Mutex::new(None),
            captured: Mutex::new(ExecutionRecord::new()),
        }
    }

    pub fn txn_idx(&self) -> TxnIndex {
        self.txn_idx
    }

    /// The latest value visible below this transaction's index, or the base
    /// store's value if no version cell exists. `None` means the key is
    /// absent (or tombstoned by a visible deletion).
    pub fn read(&self, key: &T::Key) -> Result<Option<Arc<T::Value>>, SpeculativeAbort> {
        if let Some(blocking_txn) = *self.abort_latch.lock() {
            return Err(SpeculativeAbort { blocking_txn });
        }
        match self.versioned_data.read(key, self.txn_idx) {
            Ok((version, value)) => {
                self.captured
                    .lock()
                    .push_read(ReadDescriptor::from_versioned(key.clone(), version));
                Ok((!value.is_deletion()).then_some(value))
            },
            Err(MVDataError::NotFound) => {
                self.captured
                    .lock()
                    .push_read(ReadDescriptor::from_storage(key.clone()));
                Ok(self.base.get(key).map(Arc::new))
            },
            Err(MVDataError::Dependency(blocking_txn)) => {
                *self.abort_latch.lock() = Some(blocking_txn);
                Err(SpeculativeAbort { blocking_txn })
            },
        }
    }

    /// A recording range iteration over the merged view. The yielded key
    /// sequence and the early-stop point (if the returned iterator is
    /// dropped before exhaustion) are captured for validation.
    pub fn iterate(
        &self,
        range: KeyRange<T::Key>,
        direction: IterationDirection,
    ) -> Result<RecordedIterator<'_, 'a, T, S>, SpeculativeAbort> {
        if let Some(blocking_txn) = *self.abort_latch.lock() {
            return Err(SpeculativeAbort { blocking_txn });
        }
        match self
            .versioned_data
            .iterate(self.base, &range, direction, self.txn_idx)
        {
            Ok(inner) => Ok(RecordedIterator {
                view: self,
                inner,
                range,
                direction,
                observed: Vec::new(),
                exhausted: false,
            }),
            Err(MVDataError::Dependency(blocking_txn)) => {
                *self.abort_latch.lock() = Some(blocking_txn);
                Err(SpeculativeAbort { blocking_txn })
            },
            Err(MVDataError::NotFound) => unreachable!("iteration never reports NotFound"),
        }
    }

    /// The blocking transaction of the first blocked read, if any. Checked
    /// exactly once by the executor after the transaction logic returns.
    pub(crate) fn speculative_failure(&self) -> Option<TxnIndex> {
        *self.abort_latch.lock()
    }

    /// Drains the captured execution record.
    pub(crate) fn take_record(&self) -> ExecutionRecord<T::Key> {
        std::mem::take(&mut *self.captured.lock())
    }
}

/// Iterator handed to transaction logic: forwards the merged sequence while
/// recording each observed item as a read and, on drop, the exact key
/// sequence with its early-stop state.
pub struct RecordedIterator<'s, 'a, T: Transaction, S> {
    view: &'s SpeculativeView<'a, T, S>,
    inner: MergeIterator<'a, T::Key, T::Value>,
    range: KeyRange<T::Key>,
    direction: IterationDirection,
    observed: Vec<T::Key>,
    exhausted: bool,
}

impl<'s, 'a, T: Transaction, S> Iterator for RecordedIterator<'s, 'a, T, S> {
    type Item = (T::Key, Arc<T::Value>);

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next() {
            Some((key, value, version)) => {
                let mut captured = self.view.captured.lock();
                captured.push_read(match version {
                    Some(version) => ReadDescriptor::from_versioned(key.clone(), version),
                    None => ReadDescriptor::from_storage(key.clone()),
                });
                drop(captured);
                self.observed.push(key.clone());
                Some((key, value))
            },
            None => {
                self.exhausted = true;
                None
            },
        }
    }
}

impl<'s, 'a, T: Transaction, S> Drop for RecordedIterator<'s, 'a, T, S> {
    fn drop(&mut self) {
        self.view.captured.lock().push_iteration(IterationDescriptor {
            range: std::mem::replace(&mut self.range, KeyRange::new(None, None)),
            direction: self.direction,
            observed: std::mem::take(&mut self.observed),
            early_stopped: !self.exhausted,
        });
    }
}

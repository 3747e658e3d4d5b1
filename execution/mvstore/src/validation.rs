// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{
    execution_record::{ExecutionRecord, ReadOrigin},
    types::{MVDataError, TxnIndex, Version},
    versioned_data::VersionedData,
};
use meridian_types::state_store::{TStateStore, TransactionWrite};
use std::{fmt::Debug, hash::Hash, sync::Arc};

/// Result of re-checking a speculative execution against current state.
/// `Invalid` carries the index of the transaction whose write invalidated
/// the record, when one can be attributed, for prioritized re-execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    Invalid { blocking_txn: Option<TxnIndex> },
}

impl ValidationOutcome {
    pub fn is_valid(self) -> bool {
        self == ValidationOutcome::Valid
    }

    fn invalid(blocking_txn: Option<TxnIndex>) -> Self {
        ValidationOutcome::Invalid { blocking_txn }
    }
}

/// Re-derives, from the current store state, the values the transaction
/// would observe now for every captured read, and the exact key sequence
/// for every captured iteration, comparing both against the record from the
/// speculative run. Detects value divergence and iteration divergence
/// (fewer, more, or different keys); checking values alone under-validates
/// iteration-heavy transactions.
///
/// Idempotent: with no intervening writes, repeated validation of the same
/// record yields the same outcome.
pub fn validate_record<K, V, S>(
    data: &VersionedData<K, V>,
    base: &S,
    txn_idx: TxnIndex,
    record: &ExecutionRecord<K>,
) -> ValidationOutcome
where
    K: Ord + Hash + Clone + Debug + Send + Sync,
    V: TransactionWrite + Clone,
    S: TStateStore<Key = K, Value = V>,
{
    for read in record.reads() {
        match data.read(read.key(), txn_idx) {
            Ok((version, _)) => {
                if !read.validate_versioned(version) {
                    return ValidationOutcome::invalid(Some(version.0));
                }
            },
            Err(MVDataError::NotFound) => {
                if !read.validate_storage() {
                    // The versioned write this read observed has since been
                    // discarded; attribute the abort to its author.
                    let blocking = match read.origin() {
                        ReadOrigin::Versioned((writer, _)) => Some(writer),
                        ReadOrigin::Storage => None,
                    };
                    return ValidationOutcome::invalid(blocking);
                }
            },
            Err(MVDataError::Dependency(blocking)) => {
                return ValidationOutcome::invalid(Some(blocking));
            },
        }
    }

    for iteration in record.iterations() {
        let replay = match data.iterate(base, &iteration.range, iteration.direction, txn_idx) {
            Ok(iter) => iter,
            Err(MVDataError::Dependency(blocking)) => {
                return ValidationOutcome::invalid(Some(blocking));
            },
            Err(MVDataError::NotFound) => unreachable!("iteration never reports NotFound"),
        };

        // An early-stopped caller only observed a prefix; replay exactly as
        // many items. A completed iteration must reproduce the full
        // sequence, so replay one extra item to catch new trailing keys.
        let replayed: Vec<(K, Arc<V>, Option<Version>)> = if iteration.early_stopped {
            replay.take(iteration.observed.len()).collect()
        } else {
            replay.take(iteration.observed.len() + 1).collect()
        };

        for (position, expected) in iteration.observed.iter().enumerate() {
            match replayed.get(position) {
                Some((actual, _, version)) if actual == expected => {
                    debug_assert!(version.is_none() || version.unwrap().0 < txn_idx);
                },
                Some((_, _, version)) => {
                    let blocking = version
                        .map(|(writer, _)| writer)
                        .or_else(|| attribute_missing_key(data, txn_idx, expected));
                    return ValidationOutcome::invalid(blocking);
                },
                None => {
                    return ValidationOutcome::invalid(attribute_missing_key(
                        data, txn_idx, expected,
                    ));
                },
            }
        }

        // The whole prefix matched; a surviving extra item means the
        // completed iteration would now see more keys than it did.
        if replayed.len() > iteration.observed.len() {
            let (_, _, version) = &replayed[iteration.observed.len()];
            return ValidationOutcome::invalid(version.map(|(writer, _)| writer));
        }
    }

    ValidationOutcome::Valid
}

/// Best-effort attribution when a previously observed key no longer appears
/// in the replayed sequence: a visible tombstone names the deleting
/// transaction.
fn attribute_missing_key<K, V>(
    data: &VersionedData<K, V>,
    txn_idx: TxnIndex,
    key: &K,
) -> Option<TxnIndex>
where
    K: Ord + Hash + Clone + Debug + Send + Sync,
    V: TransactionWrite,
{
    match data.read(key, txn_idx) {
        Ok(((writer, _), _)) => Some(writer),
        Err(MVDataError::Dependency(blocking)) => Some(blocking),
        Err(MVDataError::NotFound) => None,
    }
}

// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::{
    execution_record::{ExecutionRecord, IterationDescriptor, ReadDescriptor},
    types::{MVDataError, TxnIndex},
    validation::{ValidationOutcome, validate_record},
};
use claims::{assert_err, assert_ok};
use meridian_types::state_store::{
    InMemoryStateStore, IterationDirection, KeyRange, TransactionWrite,
};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
struct TestValue {
    blob: Vec<u32>,
    deletion: bool,
}

impl TransactionWrite for TestValue {
    fn is_deletion(&self) -> bool {
        self.deletion
    }
}

// Generate a value deterministically based on txn_idx and incarnation.
fn value_for(txn_idx: TxnIndex, incarnation: u32) -> TestValue {
    TestValue {
        blob: vec![txn_idx * 5, txn_idx + incarnation, incarnation * 5],
        deletion: false,
    }
}

fn arc_value_for(txn_idx: TxnIndex, incarnation: u32) -> Arc<TestValue> {
    Arc::new(value_for(txn_idx, incarnation))
}

fn tombstone() -> TestValue {
    TestValue {
        blob: vec![],
        deletion: true,
    }
}

#[test]
fn write_read_estimate_lifecycle() {
    let ap1 = b"/foo/b".to_vec();
    let ap2 = b"/foo/c".to_vec();

    let data = VersionedData::new();

    // Reads that should go to the base store return Err(NotFound).
    assert_eq!(data.read(&ap1, 5), Err(MVDataError::NotFound));

    // Write by txn 10.
    data.write(&ap1, (10, 1), value_for(10, 1));

    // Reads at or below txn 10 still fall through.
    assert_eq!(data.read(&ap1, 9), Err(MVDataError::NotFound));
    assert_eq!(data.read(&ap1, 10), Err(MVDataError::NotFound));

    // Reads above observe the entry written by txn 10.
    assert_eq!(data.read(&ap1, 15), Ok(((10, 1), arc_value_for(10, 1))));

    // More writes; reads resolve the highest entry below the reader.
    data.write_set(12, 0, [(ap1.clone(), value_for(12, 0))]);
    data.write(&ap1, (8, 3), value_for(8, 3));
    assert_eq!(data.read(&ap1, 15), Ok(((12, 0), arc_value_for(12, 0))));
    assert_eq!(data.read(&ap1, 11), Ok(((10, 1), arc_value_for(10, 1))));
    assert_eq!(data.read(&ap1, 10), Ok(((8, 3), arc_value_for(8, 3))));

    // Mark the entry written by txn 10 as an estimate: readers observe a
    // dependency on txn 10 instead of data.
    data.mark_estimate(&ap1, 10);
    assert_eq!(data.read(&ap1, 11), Err(MVDataError::Dependency(10)));
    // Readers below txn 10 are unaffected.
    assert_eq!(data.read(&ap1, 10), Ok(((8, 3), arc_value_for(8, 3))));

    // Deleting the aborted entry reveals the one below again.
    data.delete(&ap1, 10);
    assert_eq!(data.read(&ap1, 11), Ok(((8, 3), arc_value_for(8, 3))));

    // An estimate pre-published from a write hint blocks readers until the
    // real write replaces it.
    data.publish_estimate(&ap2, 5);
    assert_eq!(data.read(&ap2, 6), Err(MVDataError::Dependency(5)));
    data.write(&ap2, (5, 0), value_for(5, 0));
    assert_eq!(data.read(&ap2, 6), Ok(((5, 0), arc_value_for(5, 0))));

    // publish_estimate never clobbers an existing write at the same index.
    data.publish_estimate(&ap2, 5);
    assert_eq!(data.read(&ap2, 6), Ok(((5, 0), arc_value_for(5, 0))));

    assert_eq!(data.num_keys(), 2);
}

fn base_store() -> InMemoryStateStore<u32, TestValue> {
    let base = InMemoryStateStore::new();
    base.insert(1, value_for(0, 0));
    base.insert(3, value_for(0, 0));
    base.insert(5, value_for(0, 0));
    base
}

#[test]
fn iteration_merges_base_and_version_layer() {
    let base = base_store();
    let data = VersionedData::new();
    data.write(&2, (2, 0), value_for(2, 0));
    data.write(&3, (2, 0), tombstone());
    data.write(&5, (4, 0), value_for(4, 0));

    // Full ascending merge for txn 5: key 2 from the version layer, key 3
    // tombstoned, key 5 shadowed by txn 4's write.
    let items: Vec<_> = assert_ok!(data.iterate(
        &base,
        &KeyRange::unbounded(),
        IterationDirection::Ascending,
        5
    ))
    .collect();
    let keys: Vec<u32> = items.iter().map(|(k, _, _)| *k).collect();
    assert_eq!(keys, vec![1, 2, 5]);
    assert_eq!(items[0].2, None);
    assert_eq!(items[1].2, Some((2, 0)));
    assert_eq!(items[2].2, Some((4, 0)));
    assert_eq!(items[2].1, arc_value_for(4, 0));

    // Txn 3 sees txn 2's writes but not txn 4's: key 5 resolves to base.
    let keys: Vec<u32> = assert_ok!(data.iterate(
        &base,
        &KeyRange::unbounded(),
        IterationDirection::Ascending,
        3
    ))
    .map(|(k, _, _)| k)
    .collect();
    assert_eq!(keys, vec![1, 2, 5]);

    // Txn 2 sees no version cells at all.
    let keys: Vec<u32> = assert_ok!(data.iterate(
        &base,
        &KeyRange::unbounded(),
        IterationDirection::Ascending,
        2
    ))
    .map(|(k, _, _)| k)
    .collect();
    assert_eq!(keys, vec![1, 3, 5]);

    // Descending order and sub-ranges.
    let keys: Vec<u32> = assert_ok!(data.iterate(
        &base,
        &KeyRange::unbounded(),
        IterationDirection::Descending,
        5
    ))
    .map(|(k, _, _)| k)
    .collect();
    assert_eq!(keys, vec![5, 2, 1]);

    let keys: Vec<u32> = assert_ok!(data.iterate(
        &base,
        &KeyRange::new(Some(2), Some(5)),
        IterationDirection::Ascending,
        5
    ))
    .map(|(k, _, _)| k)
    .collect();
    assert_eq!(keys, vec![2]);
}

#[test]
fn iteration_aborts_on_visible_estimate() {
    let base = base_store();
    let data = VersionedData::new();
    data.publish_estimate(&4, 1);

    let err = assert_err!(data
        .iterate(&base, &KeyRange::unbounded(), IterationDirection::Ascending, 3)
        .map(|_| ()));
    assert_eq!(err, MVDataError::Dependency(1));

    // Readers at or below the estimate's index are unaffected.
    assert_ok!(data
        .iterate(&base, &KeyRange::unbounded(), IterationDirection::Ascending, 1)
        .map(|_| ()));
}

/// Record containing exactly one iteration descriptor: the full key
/// sequence txn_idx observes right now. Reads are deliberately not captured
/// so that validation failures exercise the iteration-replay path.
fn record_current_iteration(
    data: &VersionedData<u32, TestValue>,
    base: &InMemoryStateStore<u32, TestValue>,
    txn_idx: TxnIndex,
) -> ExecutionRecord<u32> {
    let mut record = ExecutionRecord::new();
    let observed: Vec<u32> = data
        .iterate(base, &KeyRange::unbounded(), IterationDirection::Ascending, txn_idx)
        .unwrap()
        .map(|(k, _, _)| k)
        .collect();
    record.push_iteration(IterationDescriptor {
        range: KeyRange::unbounded(),
        direction: IterationDirection::Ascending,
        observed,
        early_stopped: false,
    });
    record
}

#[test]
fn validation_detects_value_divergence() {
    let base = base_store();
    let data = VersionedData::new();
    data.write(&1, (2, 0), value_for(2, 0));

    let mut record = ExecutionRecord::new();
    record.push_read(ReadDescriptor::from_versioned(1, (2, 0)));
    assert_eq!(validate_record(&data, &base, 5, &record), ValidationOutcome::Valid);

    // A re-execution of txn 2 bumps the incarnation: same writer, new value.
    data.write(&1, (2, 1), value_for(2, 1));
    assert_eq!(
        validate_record(&data, &base, 5, &record),
        ValidationOutcome::Invalid {
            blocking_txn: Some(2)
        }
    );

    // A storage read invalidated by a new versioned write.
    let mut record = ExecutionRecord::new();
    record.push_read(ReadDescriptor::from_storage(3));
    assert_eq!(validate_record(&data, &base, 5, &record), ValidationOutcome::Valid);
    data.write(&3, (4, 0), value_for(4, 0));
    assert_eq!(
        validate_record(&data, &base, 5, &record),
        ValidationOutcome::Invalid {
            blocking_txn: Some(4)
        }
    );
}

#[test]
fn validation_detects_disappeared_write() {
    let base = base_store();
    let data = VersionedData::new();
    data.write(&2, (2, 0), value_for(2, 0));

    let mut record = ExecutionRecord::new();
    record.push_read(ReadDescriptor::from_versioned(2, (2, 0)));

    // Txn 2 aborted and its next incarnation no longer writes key 2.
    data.delete(&2, 2);
    assert_eq!(
        validate_record(&data, &base, 5, &record),
        ValidationOutcome::Invalid {
            blocking_txn: Some(2)
        }
    );
}

#[test]
fn validation_detects_estimate_dependency() {
    let base = base_store();
    let data = VersionedData::new();
    data.write(&1, (2, 0), value_for(2, 0));

    let mut record = ExecutionRecord::new();
    record.push_read(ReadDescriptor::from_versioned(1, (2, 0)));

    data.mark_estimate(&1, 2);
    assert_eq!(
        validate_record(&data, &base, 5, &record),
        ValidationOutcome::Invalid {
            blocking_txn: Some(2)
        }
    );
}

#[test]
fn validation_detects_iteration_divergence() {
    let base = base_store();
    let data = VersionedData::new();

    // Speculative run observed base keys [1, 3, 5].
    let record = record_current_iteration(&data, &base, 5);

    // A concurrent commit deletes the middle key. The values of keys 1 and
    // 5 are untouched, yet validation must flag the record.
    data.write(&3, (2, 0), tombstone());
    assert_eq!(
        validate_record(&data, &base, 5, &record),
        ValidationOutcome::Invalid {
            blocking_txn: Some(2)
        }
    );
}

#[test]
fn validation_detects_new_keys_in_iteration() {
    let base = base_store();
    let data = VersionedData::new();
    let record = record_current_iteration(&data, &base, 5);

    // A key inserted mid-range changes the observed sequence.
    data.write(&2, (3, 0), value_for(3, 0));
    assert_eq!(
        validate_record(&data, &base, 5, &record),
        ValidationOutcome::Invalid {
            blocking_txn: Some(3)
        }
    );

    // A key appended past the recorded end is divergence too: the caller
    // ran the iterator to exhaustion.
    let data = VersionedData::new();
    let record = record_current_iteration(&data, &base, 5);
    data.write(&9, (4, 0), value_for(4, 0));
    assert_eq!(
        validate_record(&data, &base, 5, &record),
        ValidationOutcome::Invalid {
            blocking_txn: Some(4)
        }
    );
}

#[test]
fn early_stopped_iteration_only_validates_its_prefix() {
    let base = base_store();
    let data = VersionedData::new();

    // The caller stopped after [1, 3]; key 5 was never observed.
    let mut record = ExecutionRecord::new();
    record.push_iteration(IterationDescriptor {
        range: KeyRange::unbounded(),
        direction: IterationDirection::Ascending,
        observed: vec![1, 3],
        early_stopped: true,
    });

    assert_eq!(record.iterations()[0].early_stop_key(), Some(&3));

    // Writes past the early-stop point are invisible to the prefix.
    data.write(&9, (2, 0), value_for(2, 0));
    assert_eq!(validate_record(&data, &base, 5, &record), ValidationOutcome::Valid);

    // A write inside the observed prefix still invalidates.
    data.write(&2, (3, 0), value_for(3, 0));
    assert_eq!(
        validate_record(&data, &base, 5, &record),
        ValidationOutcome::Invalid {
            blocking_txn: Some(3)
        }
    );
}

#[test]
fn revalidation_is_idempotent() {
    let base = base_store();
    let data = VersionedData::new();
    data.write(&1, (1, 0), value_for(1, 0));

    let mut record = ExecutionRecord::new();
    record.push_read(ReadDescriptor::from_versioned(1, (1, 0)));
    record.push_read(ReadDescriptor::from_storage(3));
    let mut full = record_current_iteration(&data, &base, 4);
    full.push_read(ReadDescriptor::from_versioned(1, (1, 0)));

    // Without intervening writes, validation returns Valid every time.
    for record in [&record, &full] {
        assert!(validate_record(&data, &base, 4, record).is_valid());
        assert!(validate_record(&data, &base, 4, record).is_valid());
    }
}

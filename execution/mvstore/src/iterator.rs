// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::types::Version;
use itertools::{EitherOrBoth, merge_join_by};
use meridian_types::state_store::{IterationDirection, TransactionWrite};
use std::sync::Arc;

/// Key-ordered merge of the base store with a version-layer snapshot.
/// Version cells shadow base entries at the same key; tombstones suppress
/// the key entirely. Yields the originating version alongside each item
/// (`None` for base-store entries) so that callers can record what they
/// observed for later validation.
pub struct MergeIterator<'a, K, V> {
    inner: Box<dyn Iterator<Item = (K, Arc<V>, Option<Version>)> + 'a>,
}

impl<'a, K, V> MergeIterator<'a, K, V>
where
    K: Ord + 'a,
    V: TransactionWrite + 'a,
{
    /// `base` and `overlay` must both already be ordered in `direction`.
    pub(crate) fn new(
        base: Box<dyn Iterator<Item = (K, V)> + 'a>,
        overlay: Vec<(K, Version, Arc<V>)>,
        direction: IterationDirection,
    ) -> Self {
        let merged = merge_join_by(
            overlay.into_iter(),
            base,
            move |(overlay_key, _, _), (base_key, _)| match direction {
                IterationDirection::Ascending => overlay_key.cmp(base_key),
                IterationDirection::Descending => base_key.cmp(overlay_key),
            },
        );
        let inner = merged.filter_map(|item| match item {
            EitherOrBoth::Left((key, version, value))
            | EitherOrBoth::Both((key, version, value), _) => {
                (!value.is_deletion()).then_some((key, value, Some(version)))
            },
            EitherOrBoth::Right((key, value)) => Some((key, Arc::new(value), None)),
        });
        Self {
            inner: Box::new(inner),
        }
    }
}

impl<'a, K, V> Iterator for MergeIterator<'a, K, V> {
    type Item = (K, Arc<V>, Option<Version>);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

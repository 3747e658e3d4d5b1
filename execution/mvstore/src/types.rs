// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

pub type TxnIndex = u32;
pub type Incarnation = u32;
pub type Version = (TxnIndex, Incarnation);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Flag {
    Done,
    Estimate,
}

/// Returned as Err(..) when failed to read from the multi-version
/// data-structure.
#[derive(Debug, PartialEq, Eq)]
pub enum MVDataError {
    /// No prior entry is found; the caller falls back to the base store.
    NotFound,
    /// A dependency on another transaction was found during the read: the
    /// visible entry is an estimate for a write that transaction has not
    /// performed yet. The reader must abort, naming the blocking index.
    Dependency(TxnIndex),
}

// Successful reads yield `(Version, Arc<V>)`: the version is returned
// alongside the data so that validation can compare versions instead of
// cloning big values around.

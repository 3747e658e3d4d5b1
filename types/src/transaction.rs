// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::state_store::TransactionWrite;
use std::{fmt::Debug, hash::Hash};

/// A transaction executable by the block executor. Each transaction writes
/// to key/value state as its side effect and may emit events; events of
/// committed transactions are surfaced in original batch order.
pub trait Transaction: Send + Sync + 'static {
    type Key: Ord + Hash + Clone + Debug + Send + Sync + 'static;
    type Value: TransactionWrite + Clone + Debug + 'static;
    type Event: Clone + Debug + Send + Sync + 'static;
}

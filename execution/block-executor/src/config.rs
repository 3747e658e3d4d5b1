// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Local configuration of the block executor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockExecutorConfig {
    /// Number of parallel workers; capped at the batch size at runtime.
    pub concurrency_level: usize,
    /// Re-execution bound per transaction. An incarnation past this bound
    /// is reported as failed instead of retried, protecting the batch from
    /// pathological livelock.
    pub max_retries_per_txn: u32,
    /// When true (the default), transactions may start before their
    /// predecessors commit, fenced by estimates; a blocked read aborts the
    /// incarnation immediately. When false, a transaction only starts once
    /// every direct predecessor in the dependency graph has committed.
    pub eager_speculation: bool,
}

impl Default for BlockExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency_level: num_cpus::get(),
            max_retries_per_txn: 32,
            eager_speculation: true,
        }
    }
}

impl BlockExecutorConfig {
    pub fn with_concurrency(concurrency_level: usize) -> Self {
        Self {
            concurrency_level,
            ..Self::default()
        }
    }
}

// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

//! Drives the dependency DAG of one block to completion: a bounded pool of
//! workers executes transactions speculatively against the multi-version
//! store, validates each speculative run once its turn comes, and commits
//! writes in original batch order. The final committed state is equivalent
//! to strict sequential execution of the batch.

pub mod config;
pub mod errors;
pub mod executor;
pub mod scheduler;
pub mod task;
pub mod txn_last_input_output;
pub mod view;

#[cfg(any(test, feature = "fuzzing"))]
pub mod proptest_types;

#[cfg(test)]
mod unit_tests;

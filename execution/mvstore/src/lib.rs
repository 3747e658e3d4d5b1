// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

//! Multi-version data-structure used by threads to read/write during
//! parallel execution.
//!
//! Each transaction index can install tentative writes, observe the latest
//! visible write below its own index, and detect whether something it read
//! was later invalidated. Concurrency is managed by DashMap: when a method
//! accesses the version tree at a given key it holds exclusive access and
//! doesn't need to explicitly synchronize with other reader/writers.

pub mod execution_record;
pub mod iterator;
pub mod types;
pub mod validation;
pub mod versioned_data;

#[cfg(test)]
mod unit_tests;

pub use versioned_data::VersionedData;

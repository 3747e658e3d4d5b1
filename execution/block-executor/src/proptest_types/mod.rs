// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

pub mod types;

#[cfg(feature = "fuzzing")]
pub mod bencher;

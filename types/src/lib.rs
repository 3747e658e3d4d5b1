// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

pub mod access;
pub mod declarations;
pub mod error;
pub mod registry;
pub mod state_store;
pub mod transaction;

// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// An unrecoverable violation of an internal invariant. Raising one of these
/// indicates an implementation defect, never a transient condition; the
/// surrounding batch is aborted and the error surfaced to the caller.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("code invariant broken: {0}")]
pub struct PanicError(String);

pub fn code_invariant_error(message: impl ToString) -> PanicError {
    let message = message.to_string();
    tracing::error!("code invariant broken: {}", message);
    PanicError(message)
}

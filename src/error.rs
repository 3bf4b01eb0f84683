// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::types::Hash;

/// Error taxonomy for block application and verification.
///
/// `Validation` is not raised for ordinary per-transaction rejections —
/// those are logged and the offending tx is dropped with no staged record
/// (see `tx::handlers::Rejection`). It exists for programmer-facing misuse
/// of the core (bad `Params`, malformed caller input) distinct from
/// consensus-visible tx rejection.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("persistence error: {0}")]
    Persistence(#[source] anyhow::Error),

    #[error("storage root mismatch: expected {expected}, computed {computed}")]
    RootMismatch { expected: Hash, computed: Hash },
}

impl CoreError {
    pub fn invariant(msg: impl Into<String>) -> Self {
        CoreError::InvariantViolation(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn persistence(err: impl Into<anyhow::Error>) -> Self {
        CoreError::Persistence(err.into())
    }
}

/// Shorthand matching the teacher's `actor_error!` call-site shape, used at
/// the handful of sites that abort block application rather than reject a
/// single tx.
macro_rules! core_error {
    ($kind:ident, $msg:literal $(, $arg:expr)* $(,)?) => {
        $crate::error::CoreError::$kind(format!($msg $(, $arg)*))
    };
}

pub(crate) use core_error;

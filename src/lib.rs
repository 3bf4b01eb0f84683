// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Deterministic accounting core for a storage-market side chain: ingest of
//! storage-market transactions, a once-a-day verification/reward pass, and
//! a content-addressed root hash for the block header. This crate has no
//! networking, signature verification, or account-ledger implementation of
//! its own — those are external collaborators behind the trait surface in
//! [`ext`] — mirroring how `fil_actors_runtime` hands an actor a `Runtime`
//! rather than letting it talk to the outside world directly.
//!
//! [`snapshot::apply_block`] is the entry point: callers clone the prior
//! [`snapshot::Snapshot`] (copy-on-write), call it, and discard the clone
//! on `Err`.

pub mod error;
pub mod ext;
pub mod hash;
pub mod lease;
pub mod lock;
pub mod policy;
pub mod provider;
pub mod snapshot;
pub mod tx;
pub mod types;
pub mod verification;

pub use error::CoreError;
pub use ext::ExternalServices;
pub use policy::Params;
pub use snapshot::{apply_block, Snapshot};
pub use tx::StorageTx;
pub use types::{Address, BlockHeader, BlockOutcome, Hash};

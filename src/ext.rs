// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! External collaborator interfaces (spec §6). The core consumes these; it
//! never implements account balances, the SRT ledger, chain header lookup,
//! or PoC verification itself.

use num_bigint::BigUint;

use crate::types::{Address, BlockHeader, ChainHeader, Hash, PaymentResult, PledgeItem, PocPayload, SrtRefundRecord};

pub trait Database {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, anyhow::Error>;
    fn put(&mut self, key: &str, val: &[u8]) -> Result<(), anyhow::Error>;
}

pub trait AccountState {
    fn get_balance(&self, addr: &Address) -> BigUint;
    fn set_balance(&mut self, addr: &Address, amount: BigUint);
}

pub trait Chain {
    fn header_by_hash(&self, hash: &Hash) -> Option<ChainHeader>;
}

pub trait SrtIndex {
    fn check_enough_srt(&self, addr: &Address, amount: &BigUint) -> bool;
    fn burn_srt(&mut self, addr: &Address, amount: &BigUint) -> Result<(), anyhow::Error>;
    /// Daily-sweep refund leg (spec §1, §4.4 "Revert sweep"): the tenant's
    /// share of a terminated lease's proration.
    fn refund_srt(&mut self, addr: &Address, amount: &BigUint) -> Result<(), anyhow::Error>;
    /// The `utgSRTExch` tx category's direct UTG<->SRT rate exchange (spec
    /// §6 wire table) — a distinct collaborator call from `refund_srt`,
    /// not a synonym for it.
    fn update_exchange_srt(&mut self, record: &SrtRefundRecord) -> Result<(), anyhow::Error>;
}

pub trait PocVerifier {
    fn verify_storage_poc(&self, payload: &PocPayload, expected_root: &Hash, nonce: u64) -> bool;
    fn verify_poc_string(&self, raw: &str) -> bool;
}

/// The fraction released at header `h >= start_high + lock_period` is
/// `min(amount, amount * (h - start_high - lock_period) / release_period)`
/// sampled only on multiples of `interval` (spec §4.2). This crate does not
/// compute that math itself — it is the collaborator's responsibility —
/// this doc comment records the contract for implementers.
pub trait PaymentPledge {
    fn payment_pledge(
        &self,
        item: &PledgeItem,
        state: &dyn AccountState,
        header: &BlockHeader,
    ) -> (PaymentResult, BigUint);
}

/// Bundle of every collaborator `apply_block` needs, mirroring the
/// teacher's `Runtime<BS>` as a single capability object threaded through
/// rather than five separate parameters.
pub struct ExternalServices<'a> {
    pub db: &'a mut dyn Database,
    pub state: &'a mut dyn AccountState,
    pub chain: &'a dyn Chain,
    pub srt: &'a mut dyn SrtIndex,
    pub poc: &'a dyn PocVerifier,
    pub pledge: &'a dyn PaymentPledge,
}

// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! TxApplier (spec §4.5): parse every storage-category string in a block,
//! validate and stage each one against the pre-block snapshot, then mutate
//! the snapshot only after every tx in the block has staged — so
//! intra-block validation never observes partially-applied state.

pub mod handlers;
pub mod parse;

use log::{info, warn};

use crate::error::CoreError;
use crate::ext::ExternalServices;
use crate::policy::Params;
use crate::snapshot::Snapshot;
use crate::types::{Address, BlockHeader, LockRewardRecord, LockStream};

use handlers::Staged;
use parse::{parse_tx, ParsedTx};

/// One storage transaction: the pre-recovered sender plus the raw wire
/// payload. Spec.md §6's wire-format table describes only the payload
/// string; which address authored it is a signature-recovery result this
/// crate does not itself perform (spec §1 excludes "cryptographic-
/// signature checks"), so the surrounding chain supplies it alongside the
/// string rather than embedding it in-band, the same way `tx.From()` in
/// `original_source/consensus/alien/storage_snap.go` is a pre-recovered
/// value every handler there simply reads off the `*types.Transaction`.
#[derive(Clone, Debug)]
pub struct StorageTx {
    pub sender: Address,
    pub raw: String,
}

/// Splits the shared `prefix;version;chain;category` header off a raw wire
/// string and returns `(category, remaining_tokens)`. Tokens are
/// semicolon-delimited per spec §6; malformed strings are rejected rather
/// than panicking, mirroring `txDataInfo := strings.Split(string(data),
/// ";")` plus the length checks at the top of every Go handler.
fn split_wire(raw: &str) -> Option<(&str, Vec<&str>)> {
    let tokens: Vec<&str> = raw.split(';').collect();
    if tokens.len() < 5 {
        return None;
    }
    Some((tokens[3], tokens[4..].to_vec()))
}

/// Apply every storage tx in one block against `snapshot`, logging and
/// dropping any tx that fails validation (spec §7 "Propagation policy":
/// transaction-level rejections are not errors). No tx category mints a
/// lock-reward record directly — space and lease reward accrual happen
/// separately in `verification.rs`'s daily pass — so this always returns
/// empty; the `Vec<LockRewardRecord>` return type exists so `apply_block`
/// can `extend` it alongside the daily pass's records at a single
/// call site (`snapshot.rs`) without special-casing an empty-vs-nonempty
/// source.
pub fn apply_tx_batch(
    snapshot: &mut Snapshot,
    txs: &[StorageTx],
    header: &BlockHeader,
    ext: &mut ExternalServices,
    cfg: &Params,
) -> Result<Vec<LockRewardRecord>, CoreError> {
    let mut staged: Vec<Staged> = Vec::new();
    for tx in txs {
        let Some((category, tokens)) = split_wire(&tx.raw) else {
            warn!("storage tx malformed wire header, dropping");
            continue;
        };
        let parsed = match parse_tx(category, &tokens) {
            Ok(p) => p,
            Err(e) => {
                warn!("storage tx parse failed: {}", e.0);
                continue;
            }
        };
        match handlers::validate(tx.sender, &parsed, &tx.raw, header, snapshot, ext, cfg) {
            Ok(s) => staged.push(s),
            Err(rej) => {
                warn!("storage tx rejected: {}", rej.0);
                continue;
            }
        }
    }

    for item in staged {
        apply_one(snapshot, item, header, ext, cfg)?;
    }
    Ok(Vec::new())
}

fn apply_one(
    snapshot: &mut Snapshot,
    staged: Staged,
    header: &BlockHeader,
    ext: &mut ExternalServices,
    cfg: &Params,
) -> Result<(), CoreError> {
    match staged {
        Staged::Pledge(s) => {
            info!("storage pledge applied for {}", s.address);
            handlers::apply_pledge(snapshot, s);
        }
        Staged::Exit(s) => handlers::apply_exit(snapshot, s),
        Staged::RentRequest(s) => handlers::apply_rent_request(snapshot, s, header),
        Staged::RentPledge(s) => {
            ext.srt.burn_srt(&s.tenant, &s.cost).map_err(CoreError::persistence)?;
            handlers::apply_rent_pledge(snapshot, s, header);
        }
        Staged::RenewalRequest(s) => handlers::apply_renewal_request(snapshot, s, header),
        Staged::RenewalPledge(s) => {
            ext.srt.burn_srt(&s.tenant, &s.cost).map_err(CoreError::persistence)?;
            handlers::apply_renewal_pledge(snapshot, s, header, cfg);
        }
        Staged::Rescind(s) => handlers::apply_rescind(snapshot, s),
        Staged::Recovery(s) => handlers::apply_recovery(snapshot, s),
        Staged::Proof(s) => handlers::apply_proof(snapshot, s),
        Staged::ChangePrice(s) => handlers::apply_change_price(snapshot, s),
        Staged::SrtExchange(s) => {
            handlers::apply_srt_exchange(s, ext).map_err(CoreError::persistence)?;
        }
    }
    Ok(())
}

/// Content-addressed identifier for a tx that has no native encoding in
/// this crate's scope (spec §1 excludes transaction encoding), standing in
/// for the Go original's `tx.Hash()`.
pub fn tx_hash(raw: &str) -> crate::types::Hash {
    crate::hash::keccak_concat(&[raw])
}

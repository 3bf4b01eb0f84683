// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Per-category pure validators (spec §4.3). Each function reads the
//! snapshot, may debit the sender's balance through `ext.state` and gate
//! against `ext.srt`/`ext.poc`/`ext.chain`, and returns a `Staged` record on
//! success or a `Rejection` on failure. No function here mutates
//! `Snapshot` entity state directly — that happens in the matching
//! `apply_*` function, invoked only after every tx in the block has staged
//! (spec §4.5 "Ordering").

use num_bigint::BigUint;

use crate::ext::ExternalServices;
use crate::hash::keccak_concat;
use crate::lease::{Lease, LeaseRenewal, LeaseStatus, StorageFile};
use crate::policy::Params;
use crate::provider::{Provider, ProviderStatus, Space};
use crate::snapshot::{cal_st_pledge_amount, Snapshot};
use crate::types::{zero, Address, BlockHeader, Hash, PocPayload};

use super::parse::ParsedTx;

/// A tx that failed a precondition. Logged and dropped with no staged
/// record; any balance debit already applied before the failing check is
/// kept (spec §7 "Propagation policy"). Every handler in this crate debits
/// only as its final step after every other check passes, so in practice
/// no `Rejection` here carries a prior side effect — documented in
/// DESIGN.md rather than modeled as a payload, since there is nothing for
/// it to carry.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection(pub String);

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn reject(msg: impl Into<String>) -> Rejection {
    Rejection(msg.into())
}

pub struct StagedPledge {
    pub address: Address,
    pub number: u64,
    pub total_capacity: u64,
    pub bandwidth: u64,
    pub price: u64,
    pub space_deposit: BigUint,
    pub root_hash: Hash,
}

pub struct StagedExit {
    pub address: Address,
}

pub struct StagedRentRequest {
    pub provider_addr: Address,
    pub lease_hash: Hash,
    pub tenant: Address,
    pub capacity_bytes: u64,
    pub duration_days: u64,
    pub price: u64,
}

pub struct StagedRentPledge {
    pub provider_addr: Address,
    pub lease_hash: Hash,
    pub pledge_hash: Hash,
    pub tenant: Address,
    pub capacity_bytes: u64,
    pub root_hash: Hash,
    pub left_capacity_bytes: u64,
    pub left_root_hash: Hash,
    pub cost: BigUint,
    pub deposit: BigUint,
}

pub struct StagedRenewalRequest {
    pub provider_addr: Address,
    pub lease_hash: Hash,
    pub renewal_key: Hash,
    pub duration_days: u64,
}

pub struct StagedRenewalPledge {
    pub provider_addr: Address,
    pub lease_hash: Hash,
    pub renewal_key: Hash,
    pub pledge_hash: Hash,
    pub tenant: Address,
    pub root_hash: Hash,
    pub capacity_bytes: u64,
    pub cost: BigUint,
    pub deposit: BigUint,
}

pub struct StagedRescind {
    pub provider_addr: Address,
    pub lease_hash: Hash,
}

pub struct StagedRecovery {
    pub provider_addr: Address,
    pub lease_hashes: Vec<Hash>,
    pub capacity_bytes: u64,
    pub root_hash: Hash,
    pub valid_number: u64,
}

pub struct StagedProof {
    pub provider_addr: Address,
    pub lease_hash: Option<Hash>,
    pub capacity_bytes: u64,
    pub root_hash: Hash,
    pub now: u64,
}

pub struct StagedChangePrice {
    pub provider_addr: Address,
    pub new_price: u64,
}

pub struct StagedSrtExchange {
    pub target_addr: Address,
    pub utg_amount: u64,
}

pub enum Staged {
    Pledge(StagedPledge),
    Exit(StagedExit),
    RentRequest(StagedRentRequest),
    RentPledge(StagedRentPledge),
    RenewalRequest(StagedRenewalRequest),
    RenewalPledge(StagedRenewalPledge),
    Rescind(StagedRescind),
    Recovery(StagedRecovery),
    Proof(StagedProof),
    ChangePrice(StagedChangePrice),
    SrtExchange(StagedSrtExchange),
}

fn srt_burn_amount(duration_days: u64, unit_price: u64, capacity_bytes: u64, cfg: &Params) -> BigUint {
    BigUint::from(duration_days) * BigUint::from(unit_price) * BigUint::from(capacity_bytes) / BigUint::from(cfg.gb_to_b)
}

fn utg_burn_amount(srt: &BigUint, cfg: &Params) -> BigUint {
    srt * BigUint::from(10_000u32) / BigUint::from(cfg.exch_rate)
}

fn verify_poc_header(poc: &PocPayload, ext: &ExternalServices) -> Result<(), Rejection> {
    let header = ext
        .chain
        .header_by_hash(&poc.block_hash)
        .ok_or_else(|| reject("poc header not found"))?;
    if header.number != poc.number || header.nonce != poc.nonce {
        return Err(reject("poc header number/nonce mismatch"));
    }
    Ok(())
}

/// `declareStoragePledge` (spec §4.3, grounded in
/// `original_source/consensus/alien/storage_snap.go`'s `declareStoragePledge`).
#[allow(clippy::too_many_arguments)]
pub fn validate_pledge(
    sender: Address,
    provider_addr: Address,
    price: u64,
    capacity_bytes: u64,
    pk_block_number: u64,
    pk_nonce: u64,
    verify_data: &PocPayload,
    bandwidth: u64,
    tx_raw: &str,
    header: &BlockHeader,
    snapshot: &Snapshot,
    ext: &mut ExternalServices,
    cfg: &Params,
) -> Result<Staged, Rejection> {
    if sender != provider_addr {
        return Err(reject("declareStoragePledge: sender must equal pledge address"));
    }
    if snapshot.providers.contains_key(&provider_addr) {
        return Err(reject("declareStoragePledge: duplicate pledge address"));
    }
    if price < cfg.base_price || price > cfg.base_price * 10 {
        return Err(reject("declareStoragePledge: price out of range"));
    }
    if capacity_bytes as u128 > cfg.max_pledge_capacity_bytes || (capacity_bytes as u128) < cfg.min_pledge_capacity_bytes {
        return Err(reject("declareStoragePledge: capacity out of range"));
    }
    if verify_data.number != pk_block_number || verify_data.nonce != pk_nonce {
        return Err(reject("declareStoragePledge: poc number/nonce mismatch"));
    }
    verify_poc_header(verify_data, ext)?;
    if verify_data.fields.len() < 5 || verify_data.fields[4] != "20" {
        return Err(reject("declareStoragePledge: fixed block size must be 20"));
    }
    // `declareStoragePledge` verifies the raw joined wire string
    // (`verifyPocString` in the original), not the struct form every other
    // handler uses — the pledge proof bundles block number/nonce/hash
    // alongside the capacity proof in one string rather than a pre-parsed
    // header lookup.
    if !ext.poc.verify_poc_string(tx_raw) {
        return Err(reject("declareStoragePledge: poc verification failed"));
    }
    let collateral = cal_st_pledge_amount(capacity_bytes as u128, cfg, snapshot, header.number);
    let balance = ext.state.get_balance(&sender);
    if balance < collateral {
        return Err(reject("declareStoragePledge: insufficient balance for collateral"));
    }
    ext.state.set_balance(&sender, balance - &collateral);
    Ok(Staged::Pledge(StagedPledge {
        address: provider_addr,
        number: header.number,
        total_capacity: capacity_bytes,
        bandwidth,
        price,
        space_deposit: collateral,
        root_hash: verify_data.root_hash,
    }))
}

pub fn apply_pledge(snapshot: &mut Snapshot, staged: StagedPledge) {
    let provider = Provider::new(
        staged.address,
        staged.number,
        staged.total_capacity,
        staged.bandwidth,
        staged.price,
        staged.space_deposit,
        staged.root_hash,
    );
    snapshot.providers.insert(staged.address, provider);
}

/// `storagePledgeExit`.
pub fn validate_exit(sender: Address, provider_addr: Address, snapshot: &Snapshot) -> Result<Staged, Rejection> {
    if sender != provider_addr {
        return Err(reject("storagePledgeExit: sender must equal pledge address"));
    }
    let provider = snapshot
        .providers
        .get(&provider_addr)
        .ok_or_else(|| reject("storagePledgeExit: pledge not found"))?;
    if provider.revenue_address.is_some() {
        return Err(reject("storagePledgeExit: has bound revenue address"));
    }
    let blocking = provider
        .leases
        .values()
        .any(|l| matches!(l.status, LeaseStatus::NotPledged | LeaseStatus::Normal | LeaseStatus::Breach));
    if blocking {
        return Err(reject("storagePledgeExit: active leases remain"));
    }
    Ok(Staged::Exit(StagedExit { address: provider_addr }))
}

pub fn apply_exit(snapshot: &mut Snapshot, staged: StagedExit) {
    if let Some(p) = snapshot.providers.get_mut(&staged.address) {
        p.status = ProviderStatus::Exit;
    }
}

/// `rentRequest` (`checkSRent`/`updateLeaseRequest`).
#[allow(clippy::too_many_arguments)]
pub fn validate_rent_request(
    sender: Address,
    provider_addr: Address,
    capacity_bytes: u64,
    duration_days: u64,
    price: u64,
    tx_raw: &str,
    snapshot: &Snapshot,
    ext: &ExternalServices,
    cfg: &Params,
) -> Result<Staged, Rejection> {
    let provider = snapshot
        .providers
        .get(&provider_addr)
        .ok_or_else(|| reject("rentRequest: pledge not found"))?;
    if provider.status != ProviderStatus::Normal {
        return Err(reject("rentRequest: provider not Normal"));
    }
    if duration_days < cfg.min_rent_days {
        return Err(reject("rentRequest: duration below minimum"));
    }
    if price > cfg.base_price * 10 {
        return Err(reject("rentRequest: price above ceiling"));
    }
    let pending: u64 = provider
        .leases
        .values()
        .filter(|l| l.status == LeaseStatus::NotPledged)
        .map(|l| l.capacity)
        .sum();
    if pending + capacity_bytes > provider.space.capacity {
        return Err(reject("rentRequest: insufficient free space"));
    }
    let srt_needed = srt_burn_amount(duration_days, price, capacity_bytes, cfg);
    if !ext.srt.check_enough_srt(&sender, &srt_needed) {
        return Err(reject("rentRequest: insufficient SRT cover"));
    }
    let lease_hash = keccak_concat(&[tx_raw]);
    Ok(Staged::RentRequest(StagedRentRequest {
        provider_addr,
        lease_hash,
        tenant: sender,
        capacity_bytes,
        duration_days,
        price,
    }))
}

pub fn apply_rent_request(snapshot: &mut Snapshot, staged: StagedRentRequest, header: &BlockHeader) {
    let Some(provider) = snapshot.providers.get_mut(&staged.provider_addr) else {
        return;
    };
    let mut lease = Lease::new(staged.tenant, staged.provider_addr, staged.capacity_bytes, staged.price, header.number);
    let renewal = LeaseRenewal {
        request_hash: staged.lease_hash,
        pledge_hash: Hash::ZERO,
        request_time: header.number,
        start_time: 0,
        duration_days: staged.duration_days,
        cost: zero(),
        deposit: zero(),
        validation_failure_total_time: 0,
        hash: Hash::ZERO,
    };
    lease.renewals.insert(staged.lease_hash, renewal);
    provider.leases.insert(staged.lease_hash, lease);
}

/// `rentPledge` (`checkSRentPg`/`updateLeasePledge`/`processLeasePledge`).
#[allow(clippy::too_many_arguments)]
pub fn validate_rent_pledge(
    sender: Address,
    provider_addr: Address,
    lease_hash: Hash,
    capacity_bytes: u64,
    poc_rented: &PocPayload,
    left_capacity_bytes: u64,
    poc_residual: &PocPayload,
    tx_raw: &str,
    snapshot: &Snapshot,
    ext: &mut ExternalServices,
    cfg: &Params,
) -> Result<Staged, Rejection> {
    if sender != provider_addr {
        return Err(reject("rentPledge: sender must equal pledge address"));
    }
    let provider = snapshot
        .providers
        .get(&provider_addr)
        .ok_or_else(|| reject("rentPledge: pledge not found"))?;
    let lease = provider
        .leases
        .get(&lease_hash)
        .ok_or_else(|| reject("rentPledge: lease not found"))?;
    if lease.status != LeaseStatus::NotPledged {
        return Err(reject("rentPledge: lease already pledged"));
    }
    if capacity_bytes != lease.capacity {
        return Err(reject("rentPledge: capacity mismatch with request"));
    }
    if capacity_bytes + left_capacity_bytes != provider.space.capacity {
        return Err(reject("rentPledge: capacity split does not cover free space"));
    }
    if !ext.poc.verify_storage_poc(poc_rented, &poc_rented.root_hash, 0) {
        return Err(reject("rentPledge: rented-region poc failed"));
    }
    if !ext.poc.verify_storage_poc(poc_residual, &poc_residual.root_hash, 0) {
        return Err(reject("rentPledge: residual-region poc failed"));
    }
    let renewal = lease
        .renewals
        .get(&lease_hash)
        .ok_or_else(|| reject("rentPledge: initial renewal record missing"))?;
    let cost = srt_burn_amount(renewal.duration_days, lease.unit_price, capacity_bytes, cfg);
    let deposit = utg_burn_amount(&cost, cfg);
    let balance = ext.state.get_balance(&sender);
    if balance < deposit {
        return Err(reject("rentPledge: insufficient balance to lock deposit"));
    }
    ext.state.set_balance(&sender, balance - &deposit);
    let pledge_hash = keccak_concat(&[tx_raw]);
    Ok(Staged::RentPledge(StagedRentPledge {
        provider_addr,
        lease_hash,
        pledge_hash,
        tenant: lease.tenant_address,
        capacity_bytes,
        root_hash: poc_rented.root_hash,
        left_capacity_bytes,
        left_root_hash: poc_residual.root_hash,
        cost,
        deposit,
    }))
}

pub fn apply_rent_pledge(snapshot: &mut Snapshot, staged: StagedRentPledge, header: &BlockHeader) {
    let Some(provider) = snapshot.providers.get_mut(&staged.provider_addr) else {
        return;
    };
    provider.space = Space::new(staged.left_capacity_bytes, staged.left_root_hash, header.number);
    let Some(lease) = provider.leases.get_mut(&staged.lease_hash) else {
        return;
    };
    lease.status = LeaseStatus::Normal;
    lease.deposit += &staged.deposit;
    lease.cost += &staged.cost;
    lease.duration_days += lease
        .renewals
        .get(&staged.lease_hash)
        .map(|r| r.duration_days)
        .unwrap_or(0);
    lease
        .files
        .insert(staged.root_hash, StorageFile::new(staged.capacity_bytes, header.number));
    if let Some(renewal) = lease.renewals.get_mut(&staged.lease_hash) {
        renewal.pledge_hash = staged.pledge_hash;
        renewal.start_time = header.number;
        renewal.deposit = staged.deposit;
        renewal.cost = staged.cost;
    }
}

/// `rentRenew` (`checkSRentReNew`/`updateLeaseRenewal`): legal only once the active
/// renewal has consumed `>= cfg.rent_renewal_expires_pct` of its duration
/// (spec §4.3 "rentRenew / rentRenewPledge").
#[allow(clippy::too_many_arguments)]
pub fn validate_renewal_request(
    sender: Address,
    provider_addr: Address,
    lease_hash: Hash,
    duration_days: u64,
    header: &BlockHeader,
    tx_raw: &str,
    snapshot: &Snapshot,
    cfg: &Params,
) -> Result<Staged, Rejection> {
    let provider = snapshot
        .providers
        .get(&provider_addr)
        .ok_or_else(|| reject("rentRenew: pledge not found"))?;
    let lease = provider
        .leases
        .get(&lease_hash)
        .ok_or_else(|| reject("rentRenew: lease not found"))?;
    if sender != lease.tenant_address {
        return Err(reject("rentRenew: sender must be tenant"));
    }
    if lease.status != LeaseStatus::Normal {
        return Err(reject("rentRenew: lease not Normal"));
    }
    if lease.renewals.values().any(|r| r.deposit == zero()) {
        return Err(reject("rentRenew: a renewal is already pending funding"));
    }
    let active = lease
        .renewals
        .values()
        .max_by_key(|r| r.start_time + r.duration_days * cfg.blocks_per_day)
        .ok_or_else(|| reject("rentRenew: no funded renewal on record"))?;
    let total_blocks = active.duration_days * cfg.blocks_per_day;
    if total_blocks == 0 {
        return Err(reject("rentRenew: active renewal has zero duration"));
    }
    let consumed = header.number.saturating_sub(active.start_time);
    let consumed_pct = consumed * 100 / total_blocks;
    if consumed_pct < cfg.rent_renewal_expires_pct {
        return Err(reject("rentRenew: active renewal not sufficiently consumed"));
    }
    let renewal_key = keccak_concat(&[tx_raw]);
    Ok(Staged::RenewalRequest(StagedRenewalRequest {
        provider_addr,
        lease_hash,
        renewal_key,
        duration_days,
    }))
}

pub fn apply_renewal_request(snapshot: &mut Snapshot, staged: StagedRenewalRequest, header: &BlockHeader) {
    let Some(provider) = snapshot.providers.get_mut(&staged.provider_addr) else {
        return;
    };
    let Some(lease) = provider.leases.get_mut(&staged.lease_hash) else {
        return;
    };
    let renewal = LeaseRenewal {
        request_hash: staged.renewal_key,
        pledge_hash: Hash::ZERO,
        request_time: header.number,
        start_time: 0,
        duration_days: staged.duration_days,
        cost: zero(),
        deposit: zero(),
        validation_failure_total_time: 0,
        hash: Hash::ZERO,
    };
    lease.renewals.insert(staged.renewal_key, renewal);
}

/// `rentRenewPledge` (`checkSRentReNewPg`/`processLeaseRenewalPledge`).
#[allow(clippy::too_many_arguments)]
pub fn validate_renewal_pledge(
    sender: Address,
    provider_addr: Address,
    lease_hash: Hash,
    capacity_bytes: u64,
    poc: &PocPayload,
    tx_raw: &str,
    snapshot: &Snapshot,
    ext: &mut ExternalServices,
    cfg: &Params,
) -> Result<Staged, Rejection> {
    if sender != provider_addr {
        return Err(reject("rentRenewPledge: sender must equal pledge address"));
    }
    let provider = snapshot
        .providers
        .get(&provider_addr)
        .ok_or_else(|| reject("rentRenewPledge: pledge not found"))?;
    let lease = provider
        .leases
        .get(&lease_hash)
        .ok_or_else(|| reject("rentRenewPledge: lease not found"))?;
    if capacity_bytes != lease.capacity {
        return Err(reject("rentRenewPledge: capacity mismatch"));
    }
    let (pending_key, pending) = lease
        .renewals
        .iter()
        .find(|(_, r)| r.deposit == zero())
        .ok_or_else(|| reject("rentRenewPledge: no pending renewal to fund"))?;
    if !ext.poc.verify_storage_poc(poc, &poc.root_hash, 0) {
        return Err(reject("rentRenewPledge: poc verification failed"));
    }
    let cost = srt_burn_amount(pending.duration_days, lease.unit_price, capacity_bytes, cfg);
    let deposit = utg_burn_amount(&cost, cfg);
    let balance = ext.state.get_balance(&sender);
    if balance < deposit {
        return Err(reject("rentRenewPledge: insufficient balance to lock deposit"));
    }
    ext.state.set_balance(&sender, balance - &deposit);
    let pledge_hash = keccak_concat(&[tx_raw]);
    Ok(Staged::RenewalPledge(StagedRenewalPledge {
        provider_addr,
        lease_hash,
        renewal_key: *pending_key,
        pledge_hash,
        tenant: lease.tenant_address,
        root_hash: poc.root_hash,
        capacity_bytes,
        cost,
        deposit,
    }))
}

/// `start_time` of the funded renewal continues the prior one
/// (`previous_start + previous_duration_blocks + 1`, spec §4.3).
pub fn apply_renewal_pledge(snapshot: &mut Snapshot, staged: StagedRenewalPledge, header: &BlockHeader, cfg: &Params) {
    let Some(provider) = snapshot.providers.get_mut(&staged.provider_addr) else {
        return;
    };
    let Some(lease) = provider.leases.get_mut(&staged.lease_hash) else {
        return;
    };
    let prior_end = lease
        .renewals
        .values()
        .filter(|r| r.deposit > zero())
        .map(|r| r.end_block(cfg.blocks_per_day))
        .max()
        .unwrap_or(header.number);
    lease.deposit += &staged.deposit;
    lease.cost += &staged.cost;
    if !lease.files.contains_key(&staged.root_hash) {
        lease
            .files
            .insert(staged.root_hash, StorageFile::new(staged.capacity_bytes, header.number));
    }
    if let Some(renewal) = lease.renewals.get_mut(&staged.renewal_key) {
        renewal.pledge_hash = staged.pledge_hash;
        renewal.start_time = prior_end + 1;
        renewal.deposit = staged.deposit.clone();
        renewal.cost = staged.cost.clone();
        lease.duration_days += renewal.duration_days;
    }
}

/// `rentRescind` (`checkSRescind`/`updateLeaseRescind`).
pub fn validate_rescind(sender: Address, provider_addr: Address, lease_hash: Hash, snapshot: &Snapshot) -> Result<Staged, Rejection> {
    let provider = snapshot
        .providers
        .get(&provider_addr)
        .ok_or_else(|| reject("rentRescind: pledge not found"))?;
    let lease = provider
        .leases
        .get(&lease_hash)
        .ok_or_else(|| reject("rentRescind: lease not found"))?;
    if sender != lease.tenant_address {
        return Err(reject("rentRescind: sender must be tenant"));
    }
    if lease.status != LeaseStatus::Breach {
        return Err(reject("rentRescind: lease not in Breach"));
    }
    Ok(Staged::Rescind(StagedRescind { provider_addr, lease_hash }))
}

pub fn apply_rescind(snapshot: &mut Snapshot, staged: StagedRescind) {
    if let Some(provider) = snapshot.providers.get_mut(&staged.provider_addr) {
        if let Some(lease) = provider.leases.get_mut(&staged.lease_hash) {
            lease.status = LeaseStatus::UserRescind;
        }
    }
}

/// `storageRecoveryCertificate`.
#[allow(clippy::too_many_arguments)]
pub fn validate_recovery(
    sender: Address,
    provider_addr: Address,
    lease_hashes_csv: &[Hash],
    new_capacity_bytes: u64,
    poc: &PocPayload,
    header: &BlockHeader,
    snapshot: &Snapshot,
    ext: &ExternalServices,
) -> Result<Staged, Rejection> {
    if sender != provider_addr {
        return Err(reject("storageRecoveryCertificate: sender must equal pledge address"));
    }
    let provider = snapshot
        .providers
        .get(&provider_addr)
        .ok_or_else(|| reject("storageRecoveryCertificate: pledge not found"))?;
    let mut returned_hashes = Vec::new();
    for h in lease_hashes_csv {
        let lease = provider
            .leases
            .get(h)
            .ok_or_else(|| reject("storageRecoveryCertificate: lease not found"))?;
        if lease.status != LeaseStatus::Returned {
            return Err(reject("storageRecoveryCertificate: unexpired lease in set"));
        }
        returned_hashes.push(*h);
    }
    if new_capacity_bytes as u128 > provider.total_capacity as u128 {
        return Err(reject("storageRecoveryCertificate: capacity exceeds total"));
    }
    if !ext.poc.verify_storage_poc(poc, &poc.root_hash, 0) {
        return Err(reject("storageRecoveryCertificate: poc verification failed"));
    }
    Ok(Staged::Recovery(StagedRecovery {
        provider_addr,
        lease_hashes: returned_hashes,
        capacity_bytes: new_capacity_bytes,
        root_hash: poc.root_hash,
        valid_number: header.number,
    }))
}

pub fn apply_recovery(snapshot: &mut Snapshot, staged: StagedRecovery) {
    let Some(provider) = snapshot.providers.get_mut(&staged.provider_addr) else {
        return;
    };
    for h in &staged.lease_hashes {
        provider.leases.remove(h);
    }
    provider.space = Space::new(staged.capacity_bytes, staged.root_hash, staged.valid_number);
}

/// `applyStorageProof` (`applyStorageProof`/`updateStorageProof`): any file
/// (space or lease) may be re-proved within `cfg.proof_time_out` blocks of
/// the proof-source header.
#[allow(clippy::too_many_arguments)]
pub fn validate_proof(
    sender: Address,
    provider_addr: Address,
    lease_hash: Option<Hash>,
    capacity_bytes: u64,
    poc: &PocPayload,
    header: &BlockHeader,
    snapshot: &Snapshot,
    ext: &ExternalServices,
    cfg: &Params,
) -> Result<Staged, Rejection> {
    if sender != provider_addr {
        return Err(reject("applyStorageProof: sender must equal pledge address"));
    }
    let provider = snapshot
        .providers
        .get(&provider_addr)
        .ok_or_else(|| reject("applyStorageProof: pledge not found"))?;
    let proof_header = ext
        .chain
        .header_by_hash(&poc.block_hash)
        .ok_or_else(|| reject("applyStorageProof: proof-source header not found"))?;
    if header.number.saturating_sub(proof_header.number) > cfg.proof_time_out {
        return Err(reject("applyStorageProof: proof source too old"));
    }
    let on_chain_capacity = match lease_hash {
        None => provider
            .space
            .files
            .get(&poc.root_hash)
            .map(|f| f.capacity)
            .ok_or_else(|| reject("applyStorageProof: space file not found"))?,
        Some(lh) => {
            let lease = provider.leases.get(&lh).ok_or_else(|| reject("applyStorageProof: lease not found"))?;
            lease
                .files
                .get(&poc.root_hash)
                .map(|f| f.capacity)
                .ok_or_else(|| reject("applyStorageProof: lease file not found"))?
        }
    };
    if on_chain_capacity != capacity_bytes {
        return Err(reject("applyStorageProof: capacity mismatch"));
    }
    if !ext.poc.verify_storage_poc(poc, &poc.root_hash, proof_header.nonce) {
        return Err(reject("applyStorageProof: poc verification failed"));
    }
    Ok(Staged::Proof(StagedProof {
        provider_addr,
        lease_hash,
        capacity_bytes,
        root_hash: poc.root_hash,
        now: header.number,
    }))
}

pub fn apply_proof(snapshot: &mut Snapshot, staged: StagedProof) {
    let Some(provider) = snapshot.providers.get_mut(&staged.provider_addr) else {
        return;
    };
    let file = match staged.lease_hash {
        None => provider.space.files.get_mut(&staged.root_hash),
        Some(lh) => provider.leases.get_mut(&lh).and_then(|l| l.files.get_mut(&staged.root_hash)),
    };
    if let Some(f) = file {
        f.last_ver_time = staged.now;
        f.last_ver_success_time = staged.now;
    }
}

/// `exchangeStoragePrice`.
pub fn validate_change_price(sender: Address, provider_addr: Address, new_price: u64, snapshot: &Snapshot, cfg: &Params) -> Result<Staged, Rejection> {
    if sender != provider_addr {
        return Err(reject("exchangeStoragePrice: sender must equal pledge address"));
    }
    if !snapshot.providers.contains_key(&provider_addr) {
        return Err(reject("exchangeStoragePrice: pledge not found"));
    }
    if new_price < cfg.base_price || new_price > cfg.base_price * 10 {
        return Err(reject("exchangeStoragePrice: price out of range"));
    }
    Ok(Staged::ChangePrice(StagedChangePrice { provider_addr, new_price }))
}

pub fn apply_change_price(snapshot: &mut Snapshot, staged: StagedChangePrice) {
    if let Some(p) = snapshot.providers.get_mut(&staged.provider_addr) {
        p.price = staged.new_price;
    }
}

/// `utgSRTExch`: out-of-scope SRT sub-ledger exchange, forwarded verbatim
/// to the `SrtIndex` collaborator at apply time.
pub fn validate_srt_exchange(sender: Address, target_addr: Address, utg_amount: u64) -> Result<Staged, Rejection> {
    if sender != target_addr {
        return Err(reject("utgSRTExch: sender must equal target address"));
    }
    Ok(Staged::SrtExchange(StagedSrtExchange { target_addr, utg_amount }))
}

pub fn apply_srt_exchange(staged: StagedSrtExchange, ext: &mut ExternalServices) -> Result<(), anyhow::Error> {
    ext.srt.update_exchange_srt(&crate::types::SrtRefundRecord {
        target: staged.target_addr,
        amount: BigUint::from(staged.utg_amount),
    })
}

/// Dispatch a parsed tx to its validator. `tx_raw` is the original wire
/// string (used to derive synthetic content-addressed hashes where the
/// Go original used `tx.Hash()` — transaction encoding is out of scope
/// here, spec §1).
pub fn validate(
    sender: Address,
    parsed: &ParsedTx,
    tx_raw: &str,
    header: &BlockHeader,
    snapshot: &Snapshot,
    ext: &mut ExternalServices,
    cfg: &Params,
) -> Result<Staged, Rejection> {
    match parsed {
        ParsedTx::StPledge {
            provider_addr,
            price,
            capacity_bytes,
            pk_block_number,
            pk_nonce,
            pk_block_hash: _,
            verify_data,
            bandwidth,
        } => validate_pledge(
            sender,
            *provider_addr,
            *price,
            *capacity_bytes,
            *pk_block_number,
            *pk_nonce,
            verify_data,
            *bandwidth,
            tx_raw,
            header,
            snapshot,
            ext,
            cfg,
        ),
        ParsedTx::StReq {
            provider_addr,
            capacity_bytes,
            duration_days,
            price,
        } => validate_rent_request(sender, *provider_addr, *capacity_bytes, *duration_days, *price, tx_raw, snapshot, ext, cfg),
        ParsedTx::StExit { provider_addr } => validate_exit(sender, *provider_addr, snapshot),
        ParsedTx::StRentPg {
            provider_addr,
            lease_hash,
            capacity_bytes,
            poc_rented,
            left_capacity_bytes,
            poc_residual,
        } => validate_rent_pledge(
            sender,
            *provider_addr,
            *lease_hash,
            *capacity_bytes,
            poc_rented,
            *left_capacity_bytes,
            poc_residual,
            tx_raw,
            snapshot,
            ext,
            cfg,
        ),
        ParsedTx::StReNew {
            provider_addr,
            lease_hash,
            duration_days,
        } => validate_renewal_request(sender, *provider_addr, *lease_hash, *duration_days, header, tx_raw, snapshot, cfg),
        ParsedTx::StReNewPg {
            provider_addr,
            lease_hash,
            capacity_bytes,
            poc,
        } => validate_renewal_pledge(sender, *provider_addr, *lease_hash, *capacity_bytes, poc, tx_raw, snapshot, ext, cfg),
        ParsedTx::StRescind { provider_addr, lease_hash } => validate_rescind(sender, *provider_addr, *lease_hash, snapshot),
        ParsedTx::StReValid {
            provider_addr,
            lease_hashes,
            new_capacity_bytes,
            poc,
        } => validate_recovery(sender, *provider_addr, lease_hashes, *new_capacity_bytes, poc, header, snapshot, ext),
        ParsedTx::StProof {
            provider_addr,
            lease_hash,
            capacity_bytes,
            poc,
        } => validate_proof(sender, *provider_addr, *lease_hash, *capacity_bytes, poc, header, snapshot, ext, cfg),
        ParsedTx::ChPrice { provider_addr, new_price } => validate_change_price(sender, *provider_addr, *new_price, snapshot, cfg),
        ParsedTx::UtgSrtExch { target_addr, utg_amount } => validate_srt_exchange(sender, *target_addr, *utg_amount),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext::{AccountState, Chain, Database, PaymentPledge, PocVerifier};
    use crate::types::{ChainHeader, PaymentResult};
    use std::collections::HashMap;

    struct FakeDb;
    impl Database for FakeDb {
        fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, anyhow::Error> {
            Ok(None)
        }
        fn put(&mut self, _key: &str, _val: &[u8]) -> Result<(), anyhow::Error> {
            Ok(())
        }
    }
    struct FakeState(HashMap<Address, BigUint>);
    impl AccountState for FakeState {
        fn get_balance(&self, addr: &Address) -> BigUint {
            self.0.get(addr).cloned().unwrap_or_else(zero)
        }
        fn set_balance(&mut self, addr: &Address, amount: BigUint) {
            self.0.insert(*addr, amount);
        }
    }
    struct FakeChain;
    impl Chain for FakeChain {
        fn header_by_hash(&self, hash: &Hash) -> Option<ChainHeader> {
            Some(ChainHeader {
                number: 7,
                nonce: 42,
                hash: *hash,
            })
        }
    }
    struct FakeSrt;
    impl crate::ext::SrtIndex for FakeSrt {
        fn check_enough_srt(&self, _addr: &Address, _amount: &BigUint) -> bool {
            true
        }
        fn burn_srt(&mut self, _addr: &Address, _amount: &BigUint) -> Result<(), anyhow::Error> {
            Ok(())
        }
        fn refund_srt(&mut self, _addr: &Address, _amount: &BigUint) -> Result<(), anyhow::Error> {
            Ok(())
        }
        fn update_exchange_srt(&mut self, _record: &crate::types::SrtRefundRecord) -> Result<(), anyhow::Error> {
            Ok(())
        }
    }
    struct FakePoc;
    impl PocVerifier for FakePoc {
        fn verify_storage_poc(&self, _payload: &PocPayload, _expected_root: &Hash, _nonce: u64) -> bool {
            true
        }
        fn verify_poc_string(&self, _raw: &str) -> bool {
            true
        }
    }
    struct FakePledge;
    impl PaymentPledge for FakePledge {
        fn payment_pledge(&self, _item: &crate::types::PledgeItem, _state: &dyn AccountState, _header: &BlockHeader) -> (PaymentResult, BigUint) {
            (PaymentResult::None, zero())
        }
    }

    fn poc(number: u64, nonce: u64, block_hash: Hash) -> PocPayload {
        PocPayload {
            number,
            nonce,
            block_hash,
            fields: vec!["0".into(), "0".into(), "0".into(), "0".into(), "20".into(), "0xroot".into()],
            root_hash: Hash([7u8; 32]),
        }
    }

    #[test]
    fn pledge_rejects_capacity_out_of_range() {
        let cfg = Params::mainnet();
        let snap = Snapshot::new();
        let mut db = FakeDb;
        let mut state = FakeState(HashMap::new());
        let chain = FakeChain;
        let mut srt = FakeSrt;
        let pocv = FakePoc;
        let pledge = FakePledge;
        let mut ext = ExternalServices {
            db: &mut db,
            state: &mut state,
            chain: &chain,
            srt: &mut srt,
            poc: &pocv,
            pledge: &pledge,
        };
        let header = BlockHeader { number: 7, hash: Hash::ZERO };
        let addr = Address([1u8; 20]);
        let verify = poc(7, 42, Hash([3u8; 32]));
        let result = validate_pledge(addr, addr, 1, 1, 7, 42, &verify, 100, "raw", &header, &snap, &mut ext, &cfg);
        assert!(result.is_err());
    }

    #[test]
    fn pledge_accepts_valid_one_tib_request() {
        let cfg = Params::mainnet();
        let snap = Snapshot::new();
        let mut db = FakeDb;
        let addr = Address([1u8; 20]);
        let mut balances = HashMap::new();
        balances.insert(addr, BigUint::from(10_000_000_000_000_000_000u128));
        let mut state = FakeState(balances);
        let chain = FakeChain;
        let mut srt = FakeSrt;
        let pocv = FakePoc;
        let pledge = FakePledge;
        let mut ext = ExternalServices {
            db: &mut db,
            state: &mut state,
            chain: &chain,
            srt: &mut srt,
            poc: &pocv,
            pledge: &pledge,
        };
        let header = BlockHeader { number: 7, hash: Hash::ZERO };
        let verify = poc(7, 42, Hash([3u8; 32]));
        let staged = validate_pledge(addr, addr, 1, 1u64 << 40, 7, 42, &verify, 100, "raw", &header, &snap, &mut ext, &cfg).unwrap();
        match staged {
            Staged::Pledge(p) => assert_eq!(p.total_capacity, 1u64 << 40),
            _ => panic!("wrong variant"),
        }
    }
}

// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! VerificationEngine (spec §4.4): the once-a-day audit + reward pass.
//! `run_daily_verification` walks every provider exactly once — files
//! audit, lease audit, provider audit — then computes the revert sweep,
//! storage ratios, space reward, and lease reward off the same pass,
//! grounded throughout on `storageVerificationCheck`/`storageVerify`/
//! `dealLeaseStatus`/`calcStoragePledgeReward`/`accumulateLeaseRewards` in
//! `original_source/consensus/alien/storage_snap.go`.

use std::collections::{BTreeMap, BTreeSet};

use log::info;
use num_bigint::BigUint;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::CoreError;
use crate::ext::ExternalServices;
use crate::lease::{Lease, LeaseStatus};
use crate::policy::{bandwidth_index, biguint_to_decimal, decimal_floor_to_biguint, storage_ratio, Params};
use crate::provider::{Provider, ProviderStatus};
use crate::snapshot::Snapshot;
use crate::types::{zero, Address, BlockHeader, Hash, LockRewardRecord, LockStream, SrtRefundRecord};

/// `isStorageVerificationCheck` equivalent: the pass runs exactly once per
/// day, at the first block of each `blocks_per_day` window.
pub fn is_verification_checkpoint(number: u64, blocks_per_day: u64) -> bool {
    blocks_per_day != 0 && number % blocks_per_day == 0
}

/// Everything one daily pass produced, for the caller to route into the
/// lock-reward streams (`apply_block`'s job, not this module's — §4.2 and
/// §4.4 are separate concerns) and to fold into the block's reporting.
#[derive(Clone, Debug, Default)]
pub struct VerificationOutcome {
    pub successful_providers: Vec<Address>,
    pub successful_leases: Vec<Hash>,
    pub lock_rewards: Vec<LockRewardRecord>,
    pub srt_refunds: Vec<SrtRefundRecord>,
    pub space_harvest: BigUint,
    pub lease_harvest: BigUint,
}

fn persist_json<T: Serialize>(db: &mut dyn crate::ext::Database, key: &str, value: &T) -> Result<(), CoreError> {
    let blob = serde_json::to_vec(value).map_err(|e| CoreError::persistence(anyhow::anyhow!(e)))?;
    db.put(key, &blob).map_err(CoreError::persistence)
}

/// Runs the daily audit + reward pass at `header`'s day boundary and
/// persists every record §5's "Shared resources" names. Callers should
/// only invoke this when `is_verification_checkpoint` holds for
/// `header.number`.
pub fn run_daily_verification(
    snapshot: &mut Snapshot,
    header: &BlockHeader,
    ext: &mut ExternalServices,
    cfg: &Params,
) -> Result<VerificationOutcome, CoreError> {
    let day_start = (header.number / cfg.blocks_per_day) * cfg.blocks_per_day;
    let day_prev = day_start.saturating_sub(cfg.blocks_per_day);
    info!(
        "storage verification check: number={} day_start={} day_prev={}",
        header.number, day_start, day_prev
    );

    let mut successful_providers = Vec::new();
    let mut successful_leases = Vec::new();
    let mut ratio_capacity: BTreeMap<Address, u128> = BTreeMap::new();

    for (addr, provider) in snapshot.providers.iter_mut() {
        let (success, leases_ok) = audit_provider(provider, day_prev, cfg);
        if success {
            successful_providers.push(*addr);
            *ratio_capacity.entry(provider.revenue_addr()).or_insert(0) += provider.total_capacity as u128;
        }
        successful_leases.extend(leases_ok);
    }
    successful_providers.sort();
    successful_leases.sort();

    persist_json(ext.db, &format!("storagePleage-{}", header.number), &successful_providers)?;
    persist_json(ext.db, &format!("storageContract-{}", header.number), &successful_leases)?;

    let (mut lock_rewards, srt_refunds) = revert_sweep(snapshot, day_start, cfg);
    persist_json(
        ext.db,
        &format!("revertSpaceLockReward-{}", header.number),
        &lock_rewards,
    )?;
    persist_json(ext.db, &format!("revertExchangeSRT-{}", header.number), &srt_refunds)?;
    for record in &srt_refunds {
        ext.srt.refund_srt(&record.target, &record.amount).map_err(CoreError::persistence)?;
    }

    let ratios: BTreeMap<Address, Decimal> = ratio_capacity.iter().map(|(a, c)| (*a, storage_ratio(*c))).collect();
    persist_json(ext.db, &format!("storageRatios-{}", header.number), &ratio_table_lines(&ratio_capacity, &ratios))?;

    let (space_rewards, space_harvest) = compute_space_reward(snapshot, &ratios, header.number, cfg);
    persist_json(ext.db, &format!("storagePledgeReward-{}", header.number), &space_rewards)?;
    lock_rewards.extend(space_rewards);

    prune_passtime_leases(snapshot, day_start, cfg);

    let (lease_rewards, lease_harvest) = compute_lease_reward(snapshot, &successful_leases, &ratios, header.number, cfg);
    persist_json(ext.db, &format!("storageLeaseReward-{}", header.number), &lease_rewards)?;
    lock_rewards.extend(lease_rewards);

    snapshot.flow_harvest += &space_harvest + &lease_harvest;

    Ok(VerificationOutcome {
        successful_providers,
        successful_leases,
        lock_rewards,
        srt_refunds,
        space_harvest,
        lease_harvest,
    })
}

/// Files audit + lease audit + provider audit for one provider (spec
/// §4.4 points 1-3), mutating counters/status in place. Returns whether
/// the provider passed this day's audit and which of its leases did.
fn audit_provider(provider: &mut Provider, day_prev: u64, cfg: &Params) -> (bool, Vec<Hash>) {
    let mut success_capacity: u128 = 0;

    let mut space_all_succeeded = true;
    for file in provider.space.files.values_mut() {
        if file.last_ver_success_time < day_prev {
            file.validation_failure_total_time += 1;
            space_all_succeeded = false;
        } else {
            success_capacity += file.capacity as u128;
        }
    }
    if space_all_succeeded {
        provider.space.last_ver_success_time = day_prev;
    } else {
        provider.space.validation_failure_total_time += 1;
    }
    provider.space.last_ver_time = day_prev;

    let audited_lease_count = provider
        .leases
        .values()
        .filter(|l| matches!(l.status, LeaseStatus::Normal | LeaseStatus::Breach))
        .count() as u64;

    let mut successful_leases = Vec::new();
    let mut rent_success_count = 0u64;

    for (lease_hash, lease) in provider.leases.iter_mut() {
        if !matches!(lease.status, LeaseStatus::Normal | LeaseStatus::Breach) {
            continue;
        }
        audit_lease(lease, day_prev, cfg, &mut success_capacity);
        if lease.last_ver_success_time == day_prev {
            successful_leases.push(*lease_hash);
            rent_success_count += 1;
        }
    }

    let rent51 = audited_lease_count as u128 * 51 / 100;
    let cap90 = provider.total_capacity as u128 * 90 / 100;
    let success = if audited_lease_count == 0 {
        success_capacity >= cap90
    } else if provider.space.capacity == 0 {
        rent_success_count as u128 >= rent51
    } else {
        rent_success_count as u128 >= rent51 && success_capacity >= cap90
    };

    if success {
        provider.last_ver_success_time = day_prev;
    } else {
        provider.validation_failure_total_time += 1;
        let max_fail_blocks = cfg.max_stg_ver_continue_day_fail * cfg.blocks_per_day;
        if day_prev >= max_fail_blocks && provider.last_ver_success_time < day_prev - max_fail_blocks {
            provider.status = ProviderStatus::Removing;
        }
    }
    provider.last_ver_time = day_prev;

    (success, successful_leases)
}

/// One lease's share of the files/lease audit (spec §4.4 point 2).
fn audit_lease(lease: &mut Lease, day_prev: u64, cfg: &Params, success_capacity: &mut u128) {
    let mut lease_all_succeeded = true;
    for file in lease.files.values_mut() {
        if file.last_ver_success_time < day_prev {
            file.validation_failure_total_time += 1;
            lease_all_succeeded = false;
        } else {
            *success_capacity += file.capacity as u128;
        }
    }

    let mut expire_number = 0u64;
    for renewal in lease.renewals.values_mut() {
        if renewal.deposit == zero() {
            continue;
        }
        let end = renewal.end_block(cfg.blocks_per_day);
        if renewal.start_time <= day_prev && end >= day_prev && !lease_all_succeeded {
            renewal.validation_failure_total_time += 1;
        }
        expire_number = expire_number.max(end);
    }
    if expire_number <= day_prev {
        lease.status = LeaseStatus::Expiration;
    }

    let fail_threshold = lease.duration_days * cfg.rent_fail_to_rescind_pct / 100;
    if lease_all_succeeded {
        lease.last_ver_success_time = day_prev;
        if lease.status == LeaseStatus::Breach && lease.validation_failure_total_time < fail_threshold {
            lease.status = LeaseStatus::Normal;
        }
    } else {
        lease.validation_failure_total_time += 1;
        if lease.status == LeaseStatus::Normal && lease.validation_failure_total_time > fail_threshold {
            lease.status = LeaseStatus::Breach;
        }
    }
    lease.last_ver_time = day_prev;
}

/// Provider-revert and lease-revert sweep (spec §4.4 "Revert sweep"/"Lease
/// revert sweep"). Both refund legs share one proration formula —
/// `deposit - floor(deposit * failed / duration)`, i.e. truncation lands
/// on the *failure* fraction rather than the success fraction — mirroring
/// `dealSPledgeRevert2`/`dealLeaseRevert` in
/// `original_source/consensus/alien/storage_snap.go`. At full failure
/// (`failed >= duration`) the failure fraction consumes the entire
/// deposit, so both the provider's UTG refund and the tenant's SRT refund
/// collapse to zero together, satisfying this crate's full-failure
/// scenario without needing a separate symmetric-formula carve-out.
fn revert_sweep(snapshot: &mut Snapshot, day_start: u64, cfg: &Params) -> (Vec<LockRewardRecord>, Vec<SrtRefundRecord>) {
    let mut lock_rewards = Vec::new();
    let mut srt_refunds = Vec::new();
    let mut to_delete = Vec::new();

    for (addr, provider) in snapshot.providers.iter_mut() {
        if provider.status == ProviderStatus::Returned {
            continue;
        }
        if matches!(provider.status, ProviderStatus::Removing | ProviderStatus::Exit) {
            provider.status = ProviderStatus::Returned;
            let duration_days = day_start.saturating_sub(provider.number) / cfg.blocks_per_day;
            if let Some(refund) = prorated_refund(&provider.space_deposit, duration_days, provider.validation_failure_total_time) {
                lock_rewards.push(LockRewardRecord {
                    target: *addr,
                    amount: refund,
                    revenue: *addr,
                    is_reward: LockStream::Bandwidth,
                });
            }
            for lease in provider.leases.values() {
                if lease.status == LeaseStatus::Returned {
                    continue;
                }
                revert_one_lease(lease, cfg, &mut lock_rewards, &mut srt_refunds);
            }
            to_delete.push(*addr);
            continue;
        }
        for lease in provider.leases.values_mut() {
            if matches!(lease.status, LeaseStatus::UserRescind | LeaseStatus::Expiration) {
                lease.status = LeaseStatus::Returned;
                revert_one_lease(lease, cfg, &mut lock_rewards, &mut srt_refunds);
            }
        }
    }
    for addr in to_delete {
        snapshot.providers.remove(&addr);
    }
    (lock_rewards, srt_refunds)
}

fn revert_one_lease(
    lease: &Lease,
    cfg: &Params,
    lock_rewards: &mut Vec<LockRewardRecord>,
    srt_refunds: &mut Vec<SrtRefundRecord>,
) {
    let Some(refund_utg) = prorated_refund(&lease.deposit, lease.duration_days, lease.validation_failure_total_time) else {
        return;
    };
    let refund_srt = &refund_utg * BigUint::from(cfg.exch_rate) / BigUint::from(10_000u32);
    lock_rewards.push(LockRewardRecord {
        target: lease.deposit_address,
        amount: refund_utg,
        revenue: lease.deposit_address,
        is_reward: LockStream::Bandwidth,
    });
    if refund_srt > zero() {
        srt_refunds.push(SrtRefundRecord {
            target: lease.tenant_address,
            amount: refund_srt,
        });
    }
}

/// `deposit - floor(deposit * failed / duration)`, `None` once the
/// failure fraction consumes the whole deposit (P5's `0 <= refund <=
/// deposit` lower bound).
fn prorated_refund(deposit: &BigUint, duration_days: u64, failed_days: u64) -> Option<BigUint> {
    if failed_days == 0 {
        return Some(deposit.clone());
    }
    if duration_days == 0 {
        return None;
    }
    let lost = deposit * BigUint::from(failed_days) / BigUint::from(duration_days);
    if lost >= *deposit {
        return None;
    }
    let refund = deposit - lost;
    if refund == zero() {
        None
    } else {
        Some(refund)
    }
}

/// `deletePasstimeLease`: an unfunded renewal request (`deposit == 0`)
/// older than `pass_time` is dropped; a lease left with no renewals is
/// dropped entirely.
fn prune_passtime_leases(snapshot: &mut Snapshot, day_start: u64, cfg: &Params) {
    for provider in snapshot.providers.values_mut() {
        let mut dead_leases = Vec::new();
        for (lease_hash, lease) in provider.leases.iter_mut() {
            let dead_renewals: Vec<Hash> = lease
                .renewals
                .iter()
                .filter(|(_, r)| r.deposit == zero() && r.request_time + cfg.pass_time < day_start)
                .map(|(h, _)| *h)
                .collect();
            for h in dead_renewals {
                lease.renewals.remove(&h);
            }
            if lease.renewals.is_empty() {
                dead_leases.push(*lease_hash);
            }
        }
        for h in dead_leases {
            provider.leases.remove(&h);
        }
    }
}

fn mul_floor(amount: &BigUint, factor: Decimal) -> BigUint {
    decimal_floor_to_biguint(biguint_to_decimal(amount) * factor)
}

fn ceil_div(a: u64, b: u64) -> u64 {
    if b == 0 {
        return 0;
    }
    (a + b - 1) / b
}

/// `nYearSpaceProfitReward`: `totalSpaceProfitReward * (1 - 0.5^(n/3))`.
/// Ported with the same `float64` power the original uses — this crate's
/// "deterministic decimal math" guarantee covers the `Decimal` arithmetic
/// around it, not this one irrational exponent, which the original itself
/// computes in floating point.
fn n_year_space_profit_reward(n: u64, cfg: &Params) -> Decimal {
    let one_cut = 1.0 - 0.5f64.powf(n as f64 / 3.0);
    let year_scale = Decimal::from_f64_retain(one_cut).unwrap_or_default();
    year_scale * Decimal::from(cfg.total_space_profit_reward_utg) * Decimal::from(crate::policy::ATTOWEI_PER_UTG)
}

/// Space reward (spec §4.4 "Space reward"): preserves the floor+1 year
/// count (`yearCount = number/blockNumPerYear + 1`) — the other half of
/// the intentionally-preserved year-count discrepancy against lease
/// reward's `ceil`-based count below.
fn compute_space_reward(
    snapshot: &Snapshot,
    ratios: &BTreeMap<Address, Decimal>,
    header_number: u64,
    cfg: &Params,
) -> (Vec<LockRewardRecord>, BigUint) {
    let mut shares: Vec<(Address, Address, BigUint)> = Vec::new();
    let mut total_share = zero();
    for (addr, provider) in &snapshot.providers {
        let revenue = provider.revenue_addr();
        let Some(&ratio) = ratios.get(&revenue) else {
            continue;
        };
        let bw = bandwidth_index(provider.bandwidth);
        let share = mul_floor(&BigUint::from(provider.total_capacity), bw);
        let share = mul_floor(&share, ratio);
        total_share += &share;
        shares.push((*addr, revenue, share));
    }
    if total_share == zero() {
        return (Vec::new(), zero());
    }

    let year_count = header_number / cfg.blocks_per_year + 1;
    let year_reward = if year_count <= 1 {
        n_year_space_profit_reward(year_count, cfg)
    } else {
        n_year_space_profit_reward(year_count, cfg) - n_year_space_profit_reward(year_count - 1, cfg)
    };
    let space_profit_reward = year_reward / Decimal::from(365u32);

    let mut rewards = Vec::new();
    let mut harvest = zero();
    for (addr, revenue, share) in shares {
        let numerator = mul_floor(&share, space_profit_reward);
        let reward = &numerator / &total_share;
        if reward == zero() {
            continue;
        }
        harvest += &reward;
        rewards.push(LockRewardRecord {
            target: addr,
            amount: reward,
            revenue,
            is_reward: LockStream::Bandwidth,
        });
    }
    (rewards, harvest)
}

/// Lease reward (spec §4.4 "Lease reward"): unlike space reward, every
/// factor stays in `Decimal` until a single truncation at the end of each
/// lease's own reward, mirroring `calStorageLeaseReward`'s one `.BigInt()`
/// call — the per-provider total is then plain `BigUint` addition across
/// already-truncated per-lease rewards.
fn compute_lease_reward(
    snapshot: &Snapshot,
    successful_leases: &[Hash],
    ratios: &BTreeMap<Address, Decimal>,
    header_number: u64,
    cfg: &Params,
) -> (Vec<LockRewardRecord>, BigUint) {
    if successful_leases.is_empty() {
        return (Vec::new(), zero());
    }
    let succeeded: BTreeSet<Hash> = successful_leases.iter().copied().collect();

    let n = ceil_div(header_number, cfg.blocks_per_year);
    let eb_reward = {
        let one_cut = 1.0 - 0.5f64.powf(n as f64 / 12.0);
        let scale = Decimal::from_f64_retain(one_cut).unwrap_or_default();
        scale * Decimal::from(cfg.total_block_reward_utg) * Decimal::from(crate::policy::ATTOWEI_PER_UTG)
    };
    let tb_utg_rate = eb_reward / Decimal::from(1_048_576u32);

    let mut rewards = Vec::new();
    let mut harvest = zero();
    for (addr, provider) in &snapshot.providers {
        let revenue = provider.revenue_addr();
        let Some(&ratio) = ratios.get(&revenue) else {
            continue;
        };
        let bw = bandwidth_index(provider.bandwidth);
        let mut total_reward = zero();
        for (lease_hash, lease) in &provider.leases {
            if !succeeded.contains(lease_hash) {
                continue;
            }
            let capacity_tib = Decimal::from(lease.capacity) / Decimal::from(cfg.tb1_to_b as u64);
            let to_tb_price = Decimal::from(lease.unit_price) * Decimal::from(1024u32);
            let price_index = to_tb_price / Decimal::from(cfg.base_price);
            let reward = capacity_tib * price_index * Decimal::from(lease.duration_days) * bw * ratio * tb_utg_rate;
            total_reward += decimal_floor_to_biguint(reward);
        }
        if total_reward == zero() {
            continue;
        }
        harvest += &total_reward;
        rewards.push(LockRewardRecord {
            target: *addr,
            amount: total_reward,
            revenue,
            is_reward: LockStream::Flow,
        });
    }
    (rewards, harvest)
}

fn ratio_table_lines(capacity: &BTreeMap<Address, u128>, ratios: &BTreeMap<Address, Decimal>) -> BTreeMap<String, (String, Decimal)> {
    capacity
        .iter()
        .map(|(addr, cap)| {
            (
                addr.to_string(),
                (cap.to_string(), ratios.get(addr).copied().unwrap_or(Decimal::ZERO)),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::{Lease, LeaseRenewal, StorageFile};
    use crate::provider::Provider;

    fn addr(b: u8) -> Address {
        Address([b; 20])
    }

    #[test]
    fn is_verification_checkpoint_fires_once_per_day() {
        assert!(is_verification_checkpoint(0, 100));
        assert!(is_verification_checkpoint(100, 100));
        assert!(!is_verification_checkpoint(150, 100));
    }

    #[test]
    fn prorated_refund_is_zero_on_full_failure() {
        assert_eq!(prorated_refund(&BigUint::from(100u32), 30, 30), None);
        assert_eq!(prorated_refund(&BigUint::from(100u32), 30, 0), Some(BigUint::from(100u32)));
        assert_eq!(prorated_refund(&BigUint::from(100u32), 10, 5), Some(BigUint::from(50u32)));
    }

    #[test]
    fn prorated_refund_truncates_the_failure_fraction_not_the_success_fraction() {
        // deposit - floor(deposit * failed / duration) = 100 - floor(100/3) = 100 - 33 = 67,
        // not floor(deposit * success / duration) = floor(200/3) = 66.
        assert_eq!(prorated_refund(&BigUint::from(100u32), 3, 1), Some(BigUint::from(67u32)));
    }

    #[test]
    fn lease_revert_is_symmetric_on_full_failure() {
        let mut lease = Lease::new(addr(1), addr(2), 1 << 30, 2, 0);
        lease.deposit = BigUint::from(1000u32);
        lease.duration_days = 30;
        lease.validation_failure_total_time = 30;
        let cfg = Params::mainnet();
        let mut lock_rewards = Vec::new();
        let mut srt_refunds = Vec::new();
        revert_one_lease(&lease, &cfg, &mut lock_rewards, &mut srt_refunds);
        assert!(lock_rewards.is_empty());
        assert!(srt_refunds.is_empty());
    }

    #[test]
    fn audit_provider_marks_removing_after_continuous_failures() {
        let cfg = Params {
            blocks_per_day: 10,
            max_stg_ver_continue_day_fail: 2,
            ..Params::mainnet()
        };
        let mut provider = Provider::new(addr(3), 0, 1 << 40, 100, 1, zero(), Hash::ZERO);
        provider.last_ver_success_time = 0;
        let (success, _) = audit_provider(&mut provider, 30, &cfg);
        assert!(!success);
        assert_eq!(provider.status, ProviderStatus::Removing);
    }

    #[test]
    fn audit_provider_succeeds_when_space_fully_verified() {
        let cfg = Params::mainnet();
        let mut provider = Provider::new(addr(4), 0, 1 << 40, 100, 1, zero(), Hash::ZERO);
        provider
            .space
            .files
            .insert(Hash([9u8; 32]), StorageFile::new(1 << 40, 0));
        for f in provider.space.files.values_mut() {
            f.last_ver_success_time = u64::MAX;
        }
        let (success, _) = audit_provider(&mut provider, 0, &cfg);
        assert!(success);
    }

    #[test]
    fn prune_passtime_leases_drops_stale_unfunded_renewal_and_empty_lease() {
        let cfg = Params::mainnet();
        let mut snapshot = Snapshot::new();
        let mut provider = Provider::new(addr(5), 0, 1 << 40, 100, 1, zero(), Hash::ZERO);
        let mut lease = Lease::new(addr(6), addr(5), 1 << 30, 1, 0);
        lease.renewals.insert(
            Hash([7u8; 32]),
            LeaseRenewal {
                request_hash: Hash::ZERO,
                pledge_hash: Hash::ZERO,
                request_time: 0,
                start_time: 0,
                duration_days: 0,
                cost: zero(),
                deposit: zero(),
                validation_failure_total_time: 0,
                hash: Hash::ZERO,
            },
        );
        provider.leases.insert(Hash([8u8; 32]), lease);
        snapshot.providers.insert(provider.address, provider);

        prune_passtime_leases(&mut snapshot, cfg.pass_time * 2, &cfg);
        assert!(snapshot.providers[&addr(5)].leases.is_empty());
    }
}

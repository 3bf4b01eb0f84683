// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Named constants and piecewise reward/ratio tables (spec §4.4, §9).
//!
//! Collected here rather than scattered as magic numbers through
//! `verification.rs`/`tx::handlers`, mirroring `fil_actors_runtime::
//! runtime::Policy`'s role as the single place sector-size/epoch constants
//! live so callers can build a non-default copy for tests.

use std::str::FromStr;

use rust_decimal::Decimal;

/// Tunable parameters for one deployment of the core. Construct via
/// `Params::mainnet()` and override individual fields with struct-update
/// syntax for tests, the same way callers build a non-default
/// `fil_actors_runtime::runtime::Policy`.
#[derive(Clone, Debug)]
pub struct Params {
    pub blocks_per_day: u64,
    pub min_pledge_capacity_bytes: u128,
    pub max_pledge_capacity_bytes: u128,
    pub base_price: u64,
    pub rent_fail_to_rescind_pct: u64,
    pub rent_renewal_expires_pct: u64,
    pub max_stg_ver_continue_day_fail: u64,
    pub proof_time_out: u64,
    pub total_space_profit_reward_utg: u64,
    pub total_block_reward_utg: u64,
    pub exch_rate: u64,
    pub pass_time: u64,
    pub min_rent_days: u64,
    pub storage_block_size: u64,
    pub gb_to_b: u128,
    pub tb1_to_b: u128,
    pub blocks_per_year: u64,
    /// `snap.SystemConfig.Deposit[stream]` in
    /// `original_source/consensus/alien/lock_profit_snap.go`'s
    /// `updateLockData`: the per-stream accumulated-balance threshold that
    /// triggers minting a `PledgeItem` (spec §4.2 `add_reward` step 2).
    /// The Go original defaults every stream to the same 1 UTG constant
    /// absent explicit governance config, reproduced here as one flat
    /// field rather than a per-stream table since this crate has no
    /// governance-config surface (out of scope, spec §1).
    pub reward_mint_threshold_attowei: u128,
}

impl Params {
    pub fn mainnet() -> Self {
        Params {
            blocks_per_day: 86400 / 3,
            min_pledge_capacity_bytes: 1u128 << 40, // 1 TiB
            max_pledge_capacity_bytes: 80u128 << 40, // 80 TiB
            base_price: 1,
            rent_fail_to_rescind_pct: 10,
            rent_renewal_expires_pct: 80,
            max_stg_ver_continue_day_fail: 7,
            proof_time_out: 1800,
            total_space_profit_reward_utg: 10_500_000,
            total_block_reward_utg: 10_500_000,
            exch_rate: 10_000,
            pass_time: 86400 / 3 * 7,
            min_rent_days: 1,
            storage_block_size: 20,
            gb_to_b: 1u128 << 30,
            tb1_to_b: 1u128 << 40,
            blocks_per_year: (86400 / 3) * 365,
            reward_mint_threshold_attowei: 1_000_000_000_000_000_000,
        }
    }

    pub fn reward_mint_threshold(&self) -> num_bigint::BigUint {
        num_bigint::BigUint::from(self.reward_mint_threshold_attowei)
    }
}

/// Bandwidth index table (Mbps -> multiplier), spec §4.4. Boundaries match
/// `getBandwaith` in `original_source/consensus/alien/storage_snap.go`
/// verbatim (`<=29` rather than spec.md's summarized `<30`, so that
/// `bandwidth=30` lands in the `0.7` bucket, not `0`).
pub const BANDWIDTH_INDEX_TABLE: &[(u64, &str)] = &[
    (29, "0"),
    (50, "0.7"),
    (99, "0.9"),
    (100, "1.0"),
    (500, "1.1"),
    (1023, "1.3"),
    (u64::MAX, "1.5"),
];

pub fn bandwidth_index(mbps: u64) -> Decimal {
    for (ceiling, value) in BANDWIDTH_INDEX_TABLE {
        if mbps <= *ceiling {
            return value.parse().expect("static table entry parses");
        }
    }
    unreachable!("table ends in u64::MAX")
}

/// Shared `Decimal`<->`BigUint` conversion helpers: every reward/collateral
/// computation that mixes arbitrary-precision on-chain amounts with
/// `Decimal` ratios goes through these two, keeping the "truncate once, at
/// the end" discipline (spec §9) in one place rather than reimplemented
/// per call site.
pub(crate) fn biguint_to_decimal(v: &num_bigint::BigUint) -> Decimal {
    Decimal::from_str(&v.to_string()).unwrap_or_default()
}

pub(crate) fn decimal_floor_to_biguint(d: Decimal) -> num_bigint::BigUint {
    let truncated = d.trunc();
    num_bigint::BigUint::from_str(&truncated.to_string()).unwrap_or_else(|_| num_bigint::BigUint::from(0u32))
}

/// Attowei per whole UTG (1e18), the scale `nYearSpaceProfitReward`/
/// `calStorageLeaseReward` apply to their UTG-denominated constants before
/// doing any `Decimal` arithmetic.
pub const ATTOWEI_PER_UTG: u64 = 1_000_000_000_000_000_000;

/// Genesis per-TiB collateral requirement: 1.25 UTG expressed in attowei.
/// `calStPledgeAmount` in `original_source/consensus/alien/storage_snap.go`
/// hardcodes this literal rather than reading it from a config table, so it
/// is reproduced here as a constant rather than a `Params` field.
pub const DEFAULT_TB_PLEDGE_ATTOWEI: u128 = 1_250_000_000_000_000_000;

/// One TiB in bytes, the unit `calStorageRatio` in
/// `original_source/consensus/alien/storage_snap.go` buckets against.
pub const TB1B: u128 = 1u128 << 40;

/// Storage ratio: total bytes pledged by one revenue address -> multiplier.
/// Ported directly from `calStorageRatio` (bucket boundaries are exact
/// equality or open/half-open ranges in the original, not a simple
/// rounded table — reproduced verbatim rather than the simplified 6-row
/// summary in spec.md §4.4, per "use original_source/ to resolve
/// ambiguity"). This includes the gap at `c == pd1024` (1024x1024 TiB):
/// the original's branch chain is `> pd1024`, then `< pd1024 && > pd500`,
/// so the exact boundary value satisfies neither and falls through every
/// remaining branch to the `0` default, rather than landing in the `1.8`
/// bucket a naive `> pd500` check (without the paired `< pd1024`) would
/// put it in.
pub fn storage_ratio(total_capacity_bytes: u128) -> Decimal {
    let tb1b = TB1B;
    let tb1b50 = 50 * tb1b;
    let tb1b500 = 500 * tb1b;
    let tb1b1024 = 1024 * tb1b;
    let pd50 = 50 * tb1b1024;
    let pd500 = 500 * tb1b1024;
    let pd1024 = 1024 * tb1b1024;
    let c = total_capacity_bytes;
    if c > pd1024 {
        "2.0".parse().unwrap()
    } else if c == pd1024 {
        Decimal::from(0)
    } else if c > pd500 {
        "1.8".parse().unwrap()
    } else if c > pd50 {
        "1.5".parse().unwrap()
    } else if c > tb1b1024 {
        "1.2".parse().unwrap()
    } else if c == tb1b1024 {
        "1.0".parse().unwrap()
    } else if c > tb1b500 {
        "0.7".parse().unwrap()
    } else if c > tb1b50 {
        "0.5".parse().unwrap()
    } else if c > tb1b {
        "0.3".parse().unwrap()
    } else if c == tb1b {
        "0.1".parse().unwrap()
    } else {
        Decimal::from(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bandwidth_index_boundaries() {
        assert_eq!(bandwidth_index(29), Decimal::from(0));
        assert_eq!(bandwidth_index(30), "0.7".parse::<Decimal>().unwrap());
        assert_eq!(bandwidth_index(100), "1.0".parse::<Decimal>().unwrap());
        assert_eq!(bandwidth_index(2000), "1.5".parse::<Decimal>().unwrap());
    }

    #[test]
    fn storage_ratio_boundaries() {
        assert_eq!(storage_ratio(TB1B), "0.1".parse::<Decimal>().unwrap());
        assert_eq!(storage_ratio(TB1B - 1), Decimal::from(0));
        assert_eq!(storage_ratio(1024 * TB1B), "1.0".parse::<Decimal>().unwrap());
        assert_eq!(storage_ratio(1024 * 1024 * TB1B + 1), "2.0".parse::<Decimal>().unwrap());
    }

    #[test]
    fn storage_ratio_falls_through_to_zero_at_exact_pd1024_boundary() {
        let pd1024 = 1024 * 1024 * TB1B;
        assert_eq!(storage_ratio(pd1024), Decimal::from(0));
        assert_eq!(storage_ratio(pd1024 - 1), "1.8".parse::<Decimal>().unwrap());
        assert_eq!(storage_ratio(pd1024 + 1), "2.0".parse::<Decimal>().unwrap());
    }
}

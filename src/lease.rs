// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;

use num_bigint::BigUint;

use crate::hash::{combine, Accumulate};
use crate::types::{zero, Address, Hash};

/// A committed PoC chunk, owned either by a `Space` or a `Lease`.
#[derive(Clone, Debug, PartialEq)]
pub struct StorageFile {
    pub capacity: u64,
    pub create_time: u64,
    pub last_ver_time: u64,
    pub last_ver_success_time: u64,
    pub validation_failure_total_time: u64,
    pub hash: Hash,
}

impl StorageFile {
    pub fn new(capacity: u64, create_time: u64) -> Self {
        let mut f = StorageFile {
            capacity,
            create_time,
            last_ver_time: create_time,
            last_ver_success_time: create_time,
            validation_failure_total_time: 0,
            hash: Hash::ZERO,
        };
        f.recompute_hash();
        f
    }
}

impl Accumulate for StorageFile {
    /// `file.hash = keccak(concat_dec(last_ver_time, last_ver_success_time,
    /// failure_total, capacity, create_time))` (spec §4.1).
    fn recompute_hash(&mut self) -> Hash {
        let scalar = format!(
            "{}{}{}{}{}",
            self.last_ver_time,
            self.last_ver_success_time,
            self.validation_failure_total_time,
            self.capacity,
            self.create_time
        );
        self.hash = combine(&[], &scalar);
        self.hash
    }
}

/// One rental segment within a `Lease` (spec §3 "LeaseRenewal").
#[derive(Clone, Debug, PartialEq)]
pub struct LeaseRenewal {
    pub request_hash: Hash,
    pub pledge_hash: Hash,
    pub request_time: u64,
    pub start_time: u64,
    pub duration_days: u64,
    pub cost: BigUint,
    pub deposit: BigUint,
    pub validation_failure_total_time: u64,
    pub hash: Hash,
}

impl LeaseRenewal {
    pub fn end_block(&self, blocks_per_day: u64) -> u64 {
        self.start_time + self.duration_days * blocks_per_day
    }
}

impl Accumulate for LeaseRenewal {
    fn recompute_hash(&mut self) -> Hash {
        let scalar = format!(
            "{}{}{}{}{}{}{}",
            self.request_hash,
            self.pledge_hash,
            self.request_time,
            self.start_time,
            self.duration_days,
            self.cost,
            self.deposit
        );
        self.hash = combine(&[], &scalar);
        self.hash
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseStatus {
    NotPledged = 0,
    Normal = 1,
    UserRescind = 2,
    Expiration = 3,
    Breach = 4,
    Returned = 6,
}

/// A signed rental agreement against one provider's capacity (spec §3).
#[derive(Clone, Debug, PartialEq)]
pub struct Lease {
    pub tenant_address: Address,
    pub deposit_address: Address,
    pub capacity: u64,
    pub unit_price: u64,
    pub deposit: BigUint,
    pub cost: BigUint,
    pub duration_days: u64,
    pub files: BTreeMap<Hash, StorageFile>,
    pub renewals: BTreeMap<Hash, LeaseRenewal>,
    pub last_ver_time: u64,
    pub last_ver_success_time: u64,
    pub validation_failure_total_time: u64,
    pub status: LeaseStatus,
    pub hash: Hash,
}

impl Lease {
    pub fn new(
        tenant_address: Address,
        deposit_address: Address,
        capacity: u64,
        unit_price: u64,
        now: u64,
    ) -> Self {
        let mut l = Lease {
            tenant_address,
            deposit_address,
            capacity,
            unit_price,
            deposit: zero(),
            cost: zero(),
            duration_days: 0,
            files: BTreeMap::new(),
            renewals: BTreeMap::new(),
            last_ver_time: now,
            last_ver_success_time: now,
            validation_failure_total_time: 0,
            status: LeaseStatus::NotPledged,
            hash: Hash::ZERO,
        };
        l.recompute_hash();
        l
    }

    /// I1: `deposit >= sum(renewals.deposit)`, `cost >= sum(renewals.cost)`.
    pub fn check_invariants(&self) -> Result<(), String> {
        let sum_deposit: BigUint = self.renewals.values().map(|r| r.deposit.clone()).sum();
        let sum_cost: BigUint = self.renewals.values().map(|r| r.cost.clone()).sum();
        if self.deposit < sum_deposit {
            return Err(format!(
                "lease deposit {} < sum(renewal deposits) {}",
                self.deposit, sum_deposit
            ));
        }
        if self.cost < sum_cost {
            return Err(format!(
                "lease cost {} < sum(renewal costs) {}",
                self.cost, sum_cost
            ));
        }
        Ok(())
    }

    /// `failure_total / duration` (spec GLOSSARY "Failure ratio").
    pub fn failure_ratio_pct(&self) -> u64 {
        if self.duration_days == 0 {
            return 0;
        }
        self.validation_failure_total_time * 100 / self.duration_days
    }
}

impl Accumulate for Lease {
    /// `lease.hash = keccak(sort_lex([file.hash..] ++ [renewal.hash..] ++
    /// [scalar_block]))` (spec §4.1).
    fn recompute_hash(&mut self) -> Hash {
        for f in self.files.values_mut() {
            f.recompute_hash();
        }
        for r in self.renewals.values_mut() {
            r.recompute_hash();
        }
        let children: Vec<Hash> = self
            .files
            .values()
            .map(|f| f.hash)
            .chain(self.renewals.values().map(|r| r.hash))
            .collect();
        let scalar = format!(
            "{}{}{}{}{}{}{}{}{}{}",
            self.tenant_address,
            self.deposit_address,
            self.capacity,
            self.unit_price,
            self.deposit,
            self.cost,
            self.duration_days,
            self.last_ver_time,
            self.last_ver_success_time,
            self.validation_failure_total_time
        );
        self.hash = combine(&children, &scalar);
        self.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_hash_changes_on_mutation() {
        let mut f = StorageFile::new(1024, 0);
        let h0 = f.hash;
        f.last_ver_success_time = 10;
        f.recompute_hash();
        assert_ne!(h0, f.hash);
    }

    #[test]
    fn lease_hash_is_order_independent_over_children() {
        let addr = Address([1u8; 20]);
        let mut l1 = Lease::new(addr, addr, 100, 1, 0);
        let mut l2 = Lease::new(addr, addr, 100, 1, 0);
        l1.files.insert(Hash([1u8; 32]), StorageFile::new(1, 0));
        l1.files.insert(Hash([2u8; 32]), StorageFile::new(2, 0));
        l2.files.insert(Hash([2u8; 32]), StorageFile::new(2, 0));
        l2.files.insert(Hash([1u8; 32]), StorageFile::new(1, 0));
        l1.recompute_hash();
        l2.recompute_hash();
        assert_eq!(l1.hash, l2.hash);
    }
}

// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;

use num_bigint::BigUint;

use crate::hash::{combine, Accumulate};
use crate::lease::{Lease, StorageFile};
use crate::types::{zero, Address, Hash};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderStatus {
    Normal = 0,
    Exit = 1,
    Removing = 5,
    Returned = 6,
}

/// Unleased capacity of a provider (spec §3 "Space").
#[derive(Clone, Debug, PartialEq)]
pub struct Space {
    pub capacity: u64,
    pub root_hash: Hash,
    pub files: BTreeMap<Hash, StorageFile>,
    pub last_ver_time: u64,
    pub last_ver_success_time: u64,
    pub validation_failure_total_time: u64,
    pub hash: Hash,
}

impl Space {
    pub fn new(capacity: u64, root_hash: Hash, now: u64) -> Self {
        let mut s = Space {
            capacity,
            root_hash,
            files: BTreeMap::new(),
            last_ver_time: now,
            last_ver_success_time: now,
            validation_failure_total_time: 0,
            hash: Hash::ZERO,
        };
        s.recompute_hash();
        s
    }
}

impl Accumulate for Space {
    fn recompute_hash(&mut self) -> Hash {
        for f in self.files.values_mut() {
            f.recompute_hash();
        }
        let children: Vec<Hash> = self.files.values().map(|f| f.hash).collect();
        let scalar = format!(
            "{}{}{}{}{}",
            self.capacity,
            self.root_hash,
            self.last_ver_time,
            self.last_ver_success_time,
            self.validation_failure_total_time
        );
        self.hash = combine(&children, &scalar);
        self.hash
    }
}

/// The pledge of a storage operator (spec §3 "Provider (SPledge)").
#[derive(Clone, Debug, PartialEq)]
pub struct Provider {
    pub address: Address,
    pub number: u64,
    pub total_capacity: u64,
    pub storage_size: u64,
    pub bandwidth: u64,
    pub price: u64,
    pub space_deposit: BigUint,
    pub space: Space,
    pub leases: BTreeMap<Hash, Lease>,
    pub last_ver_time: u64,
    pub last_ver_success_time: u64,
    pub validation_failure_total_time: u64,
    pub status: ProviderStatus,
    pub revenue_address: Option<Address>,
    pub hash: Hash,
}

impl Provider {
    pub fn new(
        address: Address,
        number: u64,
        total_capacity: u64,
        bandwidth: u64,
        price: u64,
        space_deposit: BigUint,
        root_hash: Hash,
    ) -> Self {
        let space = Space::new(total_capacity, root_hash, number);
        let mut p = Provider {
            address,
            number,
            total_capacity,
            storage_size: 0,
            bandwidth,
            price,
            space_deposit,
            space,
            leases: BTreeMap::new(),
            last_ver_time: number,
            last_ver_success_time: number,
            validation_failure_total_time: 0,
            status: ProviderStatus::Normal,
            revenue_address: None,
            hash: Hash::ZERO,
        };
        p.recompute_hash();
        p
    }

    pub fn revenue_addr(&self) -> Address {
        self.revenue_address.unwrap_or(self.address)
    }

    /// I2 (partial-leasing form): `space.capacity == total_capacity -
    /// sum(Normal-or-Breach lease.capacity)`.
    pub fn check_invariants(&self) -> Result<(), String> {
        let leased: u64 = self
            .leases
            .values()
            .filter(|l| {
                matches!(
                    l.status,
                    crate::lease::LeaseStatus::Normal | crate::lease::LeaseStatus::Breach
                )
            })
            .map(|l| l.capacity)
            .sum();
        if self.space.capacity != self.total_capacity.saturating_sub(leased) {
            return Err(format!(
                "provider {} space.capacity {} != total_capacity {} - leased {}",
                self.address, self.space.capacity, self.total_capacity, leased
            ));
        }
        for l in self.leases.values() {
            l.check_invariants()
                .map_err(|e| format!("provider {}: {}", self.address, e))?;
        }
        Ok(())
    }
}

impl Accumulate for Provider {
    /// `pledge.hash` follows the same sorted-hash pattern as `lease.hash`
    /// (spec §4.1): children are the space hash and every lease hash.
    fn recompute_hash(&mut self) -> Hash {
        self.space.recompute_hash();
        for l in self.leases.values_mut() {
            l.recompute_hash();
        }
        let children: Vec<Hash> = std::iter::once(self.space.hash)
            .chain(self.leases.values().map(|l| l.hash))
            .collect();
        let scalar = format!(
            "{}{}{}{}{}{}{}{}{}",
            self.address,
            self.number,
            self.total_capacity,
            self.storage_size,
            self.bandwidth,
            self.price,
            self.space_deposit,
            self.last_ver_time,
            self.validation_failure_total_time
        );
        self.hash = combine(&children, &scalar);
        self.hash
    }
}

pub fn zero_deposit() -> BigUint {
    zero()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_provider_has_full_space_capacity() {
        let p = Provider::new(Address([1u8; 20]), 0, 1 << 40, 100, 1, zero(), Hash::ZERO);
        assert_eq!(p.space.capacity, p.total_capacity);
        assert!(p.check_invariants().is_ok());
    }
}

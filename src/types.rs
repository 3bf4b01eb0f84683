// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

/// 32-byte content hash. Lexicographic ordering is defined over the hex
/// string, not the raw bytes — `HashAccumulator` sorts children this way so
/// that the root is reproducible regardless of the byte-order semantics of
/// whatever `Ord` a naive `[u8; 32]` comparison would pick.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn to_hex_string(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 32];
        let n = bytes.len().min(32);
        buf[..n].copy_from_slice(&bytes[..n]);
        Hash(buf)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash(0x{})", self.to_hex_string())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex_string())
    }
}

impl PartialOrd for Hash {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Hash {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_hex_string().cmp(&other.to_hex_string())
    }
}

/// 20-byte account/operator identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub [u8; 20]);

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// `#[serde(with = "biguint_ser")]` helper, mirroring the teacher's
/// `fvm_shared::bigint::bigint_ser` pattern for serializing arbitrary
/// precision integers through a stable decimal-string representation.
pub mod biguint_ser {
    use num_bigint::BigUint;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(v: &BigUint, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        v.to_string().serialize(s)
    }

    pub fn deserialize<'de, D>(d: D) -> Result<BigUint, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(d)?;
        s.parse::<BigUint>().map_err(serde::de::Error::custom)
    }
}

/// Header fields this core reads. The surrounding block-assembly machinery
/// is out of scope (spec §1); only what verification/PoC gating needs.
#[derive(Clone, Debug)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: Hash,
}

/// A header looked up by hash through the `Chain` collaborator, needed by
/// PoC verification (`number`, `nonce`).
#[derive(Clone, Debug)]
pub struct ChainHeader {
    pub number: u64,
    pub nonce: u64,
    pub hash: Hash,
}

/// Parsed `"<number>,<nonce>,<block_hash>,...,<root_hash>"` PoC payload.
/// `fields[4]` is the fixed block-size marker ("20" for initial pledge);
/// the final field is the Merkle root.
#[derive(Clone, Debug)]
pub struct PocPayload {
    pub number: u64,
    pub nonce: u64,
    pub block_hash: Hash,
    pub fields: Vec<String>,
    pub root_hash: Hash,
}

/// Outcome of an external `PaymentPledge` collaborator call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaymentResult {
    Paid,
    Partial,
    None,
}

/// One of the three independent reward streams (spec §9 "Dynamic
/// dispatch": not subtypes, three instances of the same `LockData` value
/// tagged by stream).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockStream {
    Reward,
    Flow,
    Bandwidth,
}

impl LockStream {
    pub fn key_prefix(&self) -> &'static str {
        match self {
            LockStream::Reward => "reward",
            LockStream::Flow => "flow",
            LockStream::Bandwidth => "bandwidth",
        }
    }
}

impl fmt::Display for LockStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key_prefix())
    }
}

/// A locked-reward entry minted once a stream's accumulated balance for a
/// target crosses its per-stream deposit threshold.
#[derive(Clone, Debug, PartialEq)]
pub struct PledgeItem {
    #[allow(dead_code)]
    pub amount: BigUint,
    pub payment: BigUint,
    pub pledge_type: LockStream,
    pub lock_period: u64,
    pub release_period: u64,
    pub interval: u64,
    pub start_high: u64,
    pub target_address: Address,
    pub revenue_address: Address,
    pub revenue_contract: Address,
    pub multi_signature: Address,
}

impl PledgeItem {
    /// I4: a fully paid item has nothing left to release.
    pub fn is_settled(&self) -> bool {
        self.payment >= self.amount
    }
}

/// One line in a block's aggregate lock-reward output, tagged by which
/// stream it is destined for (spec §4.4: "bandwidth" for space + provider-
/// revert refunds, "flow" for lease reward). Also the shape persisted to
/// the daily `storagePledgeReward-<n>`/`storageLeaseReward-<n>`/
/// `revertSpaceLockReward-<n>` JSON blobs, mirroring `SpaceRewardRecord` in
/// `original_source/consensus/alien/storage_snap.go`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LockRewardRecord {
    pub target: Address,
    #[serde(with = "biguint_ser")]
    pub amount: BigUint,
    pub revenue: Address,
    pub is_reward: LockStream,
}

/// A refund destined for the SRT sub-ledger, forwarded via
/// `SrtIndex::update_exchange_srt`. Also the shape persisted to the daily
/// `revertExchangeSRT-<n>` blob (`ExchangeSRTRecord` in the Go original).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SrtRefundRecord {
    pub target: Address,
    #[serde(with = "biguint_ser")]
    pub amount: BigUint,
}

/// One `PaymentPledge` outcome gathered by `LockData::pay_profit` (spec
/// §4.2 step 3): either a fully-settled item (destined for
/// `play_grant_profit`) or a partial release this period (destined for
/// `current_grant_profit`). `block` is the `lock_balance` key the item was
/// minted under — `LockData::update_grant_profit` uses it to find the item
/// again without re-walking every stream.
#[derive(Clone, Debug, PartialEq)]
pub struct GrantProfitRecord {
    pub target_address: Address,
    pub block: u64,
    pub amount: BigUint,
    pub revenue_address: Address,
    pub revenue_contract: Address,
    pub multi_signature: Address,
}

/// What one `apply_block` call produced (spec §2): every reward routed
/// into a lock stream this block, every SRT refund forwarded to the
/// external sub-ledger, and the resulting root hash for the header.
#[derive(Clone, Debug)]
pub struct BlockOutcome {
    pub lock_rewards: Vec<LockRewardRecord>,
    pub srt_refunds: Vec<SrtRefundRecord>,
    pub storage_root: Hash,
}

pub fn zero() -> BigUint {
    BigUint::from(0u32)
}

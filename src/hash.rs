// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Canonical rolling hash over nested entities (spec §4.1).
//!
//! Every mutation path must recompute ancestor hashes bottom-up before the
//! block is sealed. Sorting happens over the *hex string* of child hashes,
//! never raw byte order — map iteration order must never leak into the
//! root.

use crate::types::Hash;

/// `keccak256` over the concatenation of every part, in the order given.
/// Callers build `parts` from decimal-string-encoded scalars and hex-string
/// child hashes, matching the Go original's `getHash(obj) =
/// keccak256(rlp_encode(obj))` in spirit: RLP there simply concatenates
/// field encodings, so we concatenate their canonical string form directly.
pub fn keccak_concat(parts: &[&str]) -> Hash {
    let mut buf = String::new();
    for p in parts {
        buf.push_str(p);
    }
    let digest = keccak_hash::keccak(buf.as_bytes());
    Hash(digest.0)
}

/// Sort hashes by their lexicographic hex-string representation. This is
/// the only sanctioned way to make a collection of child hashes
/// order-independent before folding them into a parent hash.
pub fn sort_lex(mut hashes: Vec<Hash>) -> Vec<Hash> {
    hashes.sort_by(|a, b| a.to_hex_string().cmp(&b.to_hex_string()));
    hashes
}

/// Fold a set of already-sorted child hashes plus a scalar block into one
/// parent hash.
pub fn combine(children: &[Hash], scalar_block: &str) -> Hash {
    let sorted = sort_lex(children.to_vec());
    let mut parts: Vec<String> = sorted.iter().map(|h| h.to_hex_string()).collect();
    parts.push(scalar_block.to_string());
    let refs: Vec<&str> = parts.iter().map(|s| s.as_str()).collect();
    keccak_concat(&refs)
}

/// Anything with a recomputable accumulator hash.
pub trait Accumulate {
    fn recompute_hash(&mut self) -> Hash;
}

//! Content hashing with domain separation, mirroring the way the teacher's
//! `aptos-crypto::hash::CryptoHash` salts each hashable struct with a
//! distinct prefix so that no two structurally different messages collide.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub const HASH_LEN: usize = 32;

#[derive(Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct HashValue(#[serde(with = "serde_bytes")] pub [u8; HASH_LEN]);

impl HashValue {
    pub const fn zero() -> Self {
        HashValue([0u8; HASH_LEN])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_LEN]
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != HASH_LEN {
            return None;
        }
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(bytes);
        Some(HashValue(out))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Debug for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Display for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &hex::encode(self.0)[..8])
    }
}

/// A domain-separated hasher: every hashable struct in this crate picks a
/// unique `domain` label so that e.g. an `InputRecord` and a `Block` never
/// hash to the same digest even if their serialized bytes coincide.
pub struct DomainHasher {
    inner: Sha256,
}

impl DomainHasher {
    pub fn new(domain: &'static str) -> Self {
        let mut inner = Sha256::new();
        inner.update(domain.as_bytes());
        inner.update([0u8]);
        DomainHasher { inner }
    }

    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.inner.update(bytes);
        self
    }

    pub fn finish(self) -> HashValue {
        let digest = self.inner.finalize();
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&digest);
        HashValue(out)
    }
}

/// Implemented by every structure that contributes to a UC/block/vote hash.
pub trait CryptoHash {
    const DOMAIN: &'static str;

    fn hash(&self) -> HashValue;
}

pub fn hash_bytes(domain: &'static str, bytes: &[u8]) -> HashValue {
    DomainHasher::new(domain).update(bytes).finish()
}

//! Shard-state application capability (Design Notes §9 "capability
//! records"). The Unicity Tree / per-shard AVL state trees themselves
//! are out of scope (spec.md §1 "AVL/Merkle tree implementations"); the
//! Consensus Manager only needs a pure function from
//! `(parent_root_hash, payload)` to the new root hash it must embed in
//! `VoteInfo::current_root_hash`.

use ucbft_types::{hash::DomainHasher, HashValue, Payload};

pub trait ShardStateTree: Send + Sync {
    fn apply(&self, parent_root_hash: HashValue, payload: &Payload) -> HashValue;
}

/// Deterministic reference implementation: the new root is the hash of
/// the parent root chained with the payload's own hash. Good enough to
/// exercise the Consensus Manager's commit/vote plumbing in tests
/// without a real Merkle backend.
pub struct InMemoryShardStateTree;

impl ShardStateTree for InMemoryShardStateTree {
    fn apply(&self, parent_root_hash: HashValue, payload: &Payload) -> HashValue {
        use ucbft_types::CryptoHash;
        DomainHasher::new("ShardStateTree")
            .update(parent_root_hash.as_bytes())
            .update(payload.hash().as_bytes())
            .finish()
    }
}

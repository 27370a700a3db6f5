//! Shard blocks (spec.md §3 "Block") and root-side executed blocks
//! (spec.md §3 "Executed Block (root side)").

use crate::hash::{CryptoHash, DomainHasher, HashValue};
use crate::ids::{NetworkId, NodeId, PartitionId, PartitionShardId, Round, ShardId};
use crate::uc::UnicityCertificate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An opaque, already-validated transaction as seen by the round engine.
/// The concrete transaction-system semantics are out of scope (spec.md
/// §1); the core only needs a stable byte representation to hash and
/// persist it.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct Transaction(#[serde(with = "serde_bytes")] pub Vec<u8>);

#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct BlockHeader {
    pub network: NetworkId,
    pub partition: PartitionId,
    pub shard: ShardId,
    pub proposer: NodeId,
    pub previous_block_hash: HashValue,
}

#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub unicity_certificate: UnicityCertificate,
}

impl Block {
    pub fn round(&self) -> Round {
        self.unicity_certificate.round()
    }

    pub fn partition_shard(&self) -> PartitionShardId {
        PartitionShardId::new(self.header.partition.clone(), self.header.shard.clone())
    }

    /// The block hash is derived deterministically from the transactions
    /// and the UC (spec.md §3 "Block").
    pub fn hash(&self) -> HashValue {
        let mut h = DomainHasher::new("Block");
        h.update(self.header.previous_block_hash.as_bytes());
        for tx in &self.transactions {
            h.update(&tx.0);
        }
        h.update(self.unicity_certificate.hash().as_bytes());
        h.finish()
    }
}

/// A root-round block's payload that is visible to the round. Defined in
/// `payload.rs`; re-exported here to avoid a cycle with `block.rs`.
pub use crate::payload::Payload;

/// Root-side view of one root round's produced block, after it has been
/// executed against the IR-change buffer's snapshot (spec.md §3
/// "Executed Block (root side)").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutedBlock {
    pub round: Round,
    pub epoch: crate::ids::Epoch,
    pub timestamp: u64,
    pub author: NodeId,
    pub payload: Payload,
    /// Current input records per shard after applying this round's
    /// changes; carried forward unchanged for shards untouched this round.
    pub current_irs: std::collections::BTreeMap<PartitionShardId, crate::ir::InputRecord>,
    pub changed: BTreeSet<PartitionShardId>,
    pub root_hash: HashValue,
}

impl CryptoHash for ExecutedBlock {
    const DOMAIN: &'static str = "ExecutedBlock";

    fn hash(&self) -> HashValue {
        let mut h = DomainHasher::new(Self::DOMAIN);
        h.update(&self.round.to_be_bytes())
            .update(&self.epoch.to_be_bytes())
            .update(&self.timestamp.to_be_bytes())
            .update(self.author.0.as_bytes())
            .update(self.root_hash.as_bytes());
        for (psid, ir) in &self.current_irs {
            h.update(psid.partition.as_slice())
                .update(psid.shard.as_slice())
                .update(ir.hash().as_bytes());
        }
        h.finish()
    }
}

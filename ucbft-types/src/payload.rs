//! Root-round block payload: IR-change requests (spec.md §4.2.4 "IR-Change
//! Buffer") and the `BlockData` a root proposer broadcasts (spec.md §4.2.1).

use crate::hash::{CryptoHash, DomainHasher, HashValue};
use crate::ids::{Epoch, NodeId, PartitionShardId, Round};
use crate::ir::InputRecord;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub enum ChangeReason {
    Quorum,
    QuorumNotPossible,
    T2Timeout,
}

/// A validated shard input-record change request, buffered by C5 and
/// carried in a root block's payload.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct IrChangeReq {
    pub shard: PartitionShardId,
    pub input_record: InputRecord,
    pub reason: ChangeReason,
    /// Opaque bytes of the original certification requests that justified
    /// this change (e.g. the set of signed `CertificationRequest`s); not
    /// interpreted by the core beyond being carried and hashed.
    #[serde(with = "serde_bytes")]
    pub original_request: Vec<u8>,
}

#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug, Default)]
pub struct Payload {
    pub requests: Vec<IrChangeReq>,
}

impl Payload {
    pub fn empty() -> Self {
        Payload::default()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

impl CryptoHash for Payload {
    const DOMAIN: &'static str = "Payload";

    fn hash(&self) -> HashValue {
        let mut h = DomainHasher::new(Self::DOMAIN);
        for req in &self.requests {
            h.update(req.shard.partition.as_slice())
                .update(req.shard.shard.as_slice())
                .update(req.input_record.hash().as_bytes());
        }
        h.finish()
    }
}

/// Root round block (spec.md §4.2.1).
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct BlockData {
    pub version: u32,
    pub round: Round,
    pub epoch: Epoch,
    pub timestamp: u64,
    pub author: NodeId,
    pub qc: Option<crate::vote::QuorumCert>,
    pub payload: Payload,
}

impl CryptoHash for BlockData {
    const DOMAIN: &'static str = "BlockData";

    fn hash(&self) -> HashValue {
        let mut h = DomainHasher::new(Self::DOMAIN);
        h.update(&self.version.to_be_bytes())
            .update(&self.round.to_be_bytes())
            .update(&self.epoch.to_be_bytes())
            .update(&self.timestamp.to_be_bytes())
            .update(self.author.0.as_bytes())
            .update(self.payload.hash().as_bytes());
        if let Some(qc) = &self.qc {
            h.update(qc.hash().as_bytes());
        }
        h.finish()
    }
}

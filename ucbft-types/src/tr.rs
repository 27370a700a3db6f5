//! Technical Record (spec.md §3 "Technical Record").

use crate::hash::{CryptoHash, DomainHasher, HashValue};
use crate::ids::{Epoch, NodeId, Round};
use serde::{Deserialize, Serialize};

/// Per-shard round metadata. Bound into a `UnicityCertificate` through
/// `tr_hash` so that a UC commits to the leader/epoch that produced it
/// without embedding the full record.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct TechnicalRecord {
    pub round: Round,
    pub epoch: Epoch,
    pub leader: NodeId,
    pub stat_hash: HashValue,
    pub fee_hash: HashValue,
}

impl CryptoHash for TechnicalRecord {
    const DOMAIN: &'static str = "TechnicalRecord";

    fn hash(&self) -> HashValue {
        let mut h = DomainHasher::new(Self::DOMAIN);
        h.update(&self.round.to_be_bytes())
            .update(&self.epoch.to_be_bytes())
            .update(self.leader.0.as_bytes())
            .update(self.stat_hash.as_bytes())
            .update(self.fee_hash.as_bytes());
        h.finish()
    }
}

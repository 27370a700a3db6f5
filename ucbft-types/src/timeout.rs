//! Timeout / Timeout Certificate (spec.md §3).

use crate::crypto::{verify, Signature};
use crate::hash::{CryptoHash, DomainHasher, HashValue};
use crate::ids::{Epoch, NodeId, Round};
use crate::vote::QuorumCert;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct Timeout {
    pub round: Round,
    pub epoch: Epoch,
    pub high_qc: QuorumCert,
}

impl Timeout {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut h = DomainHasher::new("Timeout");
        h.update(&self.round.to_be_bytes())
            .update(&self.epoch.to_be_bytes())
            .update(self.high_qc.hash().as_bytes());
        h.finish().as_bytes().to_vec()
    }
}

/// One node's signed timeout vote, recording the `high_qc` round it had
/// seen at the time of timing out (needed by `isSafeToTimeout`).
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct TimeoutVote {
    pub author: NodeId,
    pub hqc_round: Round,
    pub signature: Signature,
}

impl TimeoutVote {
    /// Payload a validator signs for its own timeout vote; each signer
    /// reports its own `hqc_round` (spec.md §4.2.2 `SignTimeout`), so
    /// unlike `Timeout::signing_bytes` this is keyed per-vote rather than
    /// on the certificate's aggregate `high_qc`.
    pub fn signing_bytes(round: Round, epoch: Epoch, hqc_round: Round) -> Vec<u8> {
        let mut h = DomainHasher::new("TimeoutVote");
        h.update(&round.to_be_bytes())
            .update(&epoch.to_be_bytes())
            .update(&hqc_round.to_be_bytes());
        h.finish().as_bytes().to_vec()
    }
}

#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct TimeoutCertificate {
    pub timeout: Timeout,
    pub signatures: BTreeMap<NodeId, TimeoutVote>,
}

impl TimeoutCertificate {
    pub fn round(&self) -> Round {
        self.timeout.round
    }

    /// The highest `hqc_round` carried by any signer, used by the pacemaker
    /// and safety module to pick up the best known QC round (spec.md
    /// §4.2.2 `isSafeToVote`).
    pub fn high_qc_round(&self) -> Round {
        self.signatures
            .values()
            .map(|v| v.hqc_round)
            .max()
            .unwrap_or_else(|| self.timeout.high_qc.round())
    }

    pub fn has_quorum(&self, trusted: &[NodeId], quorum: usize) -> bool {
        let valid = self
            .signatures
            .iter()
            .filter(|(node, _)| trusted.contains(node))
            .filter(|(node, vote)| {
                let payload = TimeoutVote::signing_bytes(self.timeout.round, self.timeout.epoch, vote.hqc_round);
                verify(node, &payload, &vote.signature).is_ok()
            })
            .count();
        valid >= quorum
    }
}

impl CryptoHash for TimeoutCertificate {
    const DOMAIN: &'static str = "TimeoutCertificate";

    fn hash(&self) -> HashValue {
        let mut h = DomainHasher::new(Self::DOMAIN);
        h.update(&self.timeout.round.to_be_bytes())
            .update(&self.timeout.epoch.to_be_bytes())
            .update(self.timeout.high_qc.hash().as_bytes());
        h.finish()
    }
}

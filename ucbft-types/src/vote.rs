//! Votes and Quorum Certificates (spec.md §3 "Quorum Certificate",
//! §4.2.1/§4.2.2).

use crate::crypto::{verify, Signature};
use crate::hash::{CryptoHash, DomainHasher, HashValue};
use crate::ids::{Epoch, NodeId, Round, GENESIS_ROOT_ROUND};
use crate::uc::UnicitySeal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct VoteInfo {
    pub round: Round,
    pub parent_round: Round,
    pub epoch: Epoch,
    pub timestamp: u64,
    pub current_root_hash: HashValue,
}

impl CryptoHash for VoteInfo {
    const DOMAIN: &'static str = "VoteInfo";

    fn hash(&self) -> HashValue {
        let mut h = DomainHasher::new(Self::DOMAIN);
        h.update(&self.round.to_be_bytes())
            .update(&self.parent_round.to_be_bytes())
            .update(&self.epoch.to_be_bytes())
            .update(&self.timestamp.to_be_bytes())
            .update(self.current_root_hash.as_bytes());
        h.finish()
    }
}

/// A single node's vote: a signature over `vote_info` plus the
/// ledger-commit-info (a `UnicitySeal`) that the vote proposes to commit
/// to if it becomes part of a QC (spec.md §4.2.1).
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct Vote {
    pub vote_info: VoteInfo,
    pub ledger_commit_info: UnicitySeal,
    pub author: NodeId,
    pub signature: Signature,
}

impl Vote {
    pub fn signing_bytes(vote_info: &VoteInfo, ledger_commit_info: &UnicitySeal) -> Vec<u8> {
        let mut h = DomainHasher::new("Vote");
        h.update(vote_info.hash().as_bytes())
            .update(&ledger_commit_info.signing_bytes());
        h.finish().as_bytes().to_vec()
    }

    pub fn verify(&self) -> Result<(), crate::crypto::CryptoError> {
        let bytes = Self::signing_bytes(&self.vote_info, &self.ledger_commit_info);
        verify(&self.author, &bytes, &self.signature)
    }
}

/// Quorum Certificate: `quorum = ceil(2n/3) + 1` signatures over the same
/// ledger-commit-info (spec.md §4.2.1).
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct QuorumCert {
    pub vote_info: VoteInfo,
    pub ledger_commit_info: UnicitySeal,
    pub signatures: BTreeMap<NodeId, Signature>,
}

impl QuorumCert {
    pub fn round(&self) -> Round {
        self.vote_info.round
    }

    pub fn parent_round(&self) -> Round {
        self.vote_info.parent_round
    }

    /// The sentinel QC at genesis carries no real parent (spec.md §3
    /// "GenesisRootRound").
    pub fn is_genesis(&self) -> bool {
        self.vote_info.round == GENESIS_ROOT_ROUND
    }

    pub fn certified_signers(&self) -> Vec<NodeId> {
        self.signatures.keys().cloned().collect()
    }

    pub fn has_quorum(&self, trusted: &[NodeId], quorum: usize) -> bool {
        let payload = Vote::signing_bytes(&self.vote_info, &self.ledger_commit_info);
        let valid = self
            .signatures
            .iter()
            .filter(|(node, _)| trusted.contains(node))
            .filter(|(node, sig)| verify(node, &payload, sig).is_ok())
            .count();
        valid >= quorum
    }
}

impl CryptoHash for QuorumCert {
    const DOMAIN: &'static str = "QuorumCert";

    fn hash(&self) -> HashValue {
        let mut h = DomainHasher::new(Self::DOMAIN);
        h.update(self.vote_info.hash().as_bytes())
            .update(&self.ledger_commit_info.hash.0);
        h.finish()
    }
}

/// Helper to build the genesis QC/VoteInfo pair (SPEC_FULL.md §4.2.8).
pub fn genesis_qc(network_id: crate::ids::NetworkId, root_hash: HashValue) -> QuorumCert {
    let vote_info = VoteInfo {
        round: GENESIS_ROOT_ROUND,
        parent_round: GENESIS_ROOT_ROUND,
        epoch: 0,
        timestamp: 0,
        current_root_hash: root_hash,
    };
    let ledger_commit_info = UnicitySeal {
        network_id,
        root_round: GENESIS_ROOT_ROUND,
        epoch: 0,
        timestamp: 0,
        prev_hash: HashValue::zero(),
        hash: root_hash,
        signatures: BTreeMap::new(),
    };
    QuorumCert {
        vote_info,
        ledger_commit_info,
        signatures: BTreeMap::new(),
    }
}

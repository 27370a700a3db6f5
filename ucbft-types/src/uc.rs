//! Unicity Certificate (spec.md §3 "Unicity Certificate").
//!
//! The Unicity Tree / Shard Tree Merkle structures themselves are out of
//! scope (spec.md §1); a UC only carries their certificates (opaque
//! authentication paths) plus the signed `UnicitySeal` binding the whole
//! thing to a root round.

use crate::crypto::{verify, Signature};
use crate::hash::{CryptoHash, DomainHasher, HashValue};
use crate::ids::{Epoch, NetworkId, NodeId, Round};
use crate::ir::InputRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque Merkle authentication path within a shard's certificate tree.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug, Default)]
pub struct ShardTreeCertificate(#[serde(with = "serde_bytes")] pub Vec<u8>);

/// Opaque Merkle authentication path within the root-level unicity tree.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug, Default)]
pub struct UnicityTreeCertificate(#[serde(with = "serde_bytes")] pub Vec<u8>);

/// Root-signed attestation of one root round's unicity tree root hash.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct UnicitySeal {
    pub network_id: NetworkId,
    pub root_round: Round,
    pub epoch: Epoch,
    pub timestamp: u64,
    pub prev_hash: HashValue,
    pub hash: HashValue,
    pub signatures: BTreeMap<NodeId, Signature>,
}

impl UnicitySeal {
    /// The signing payload excludes `signatures` itself.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut h = DomainHasher::new("UnicitySeal");
        h.update(self.network_id.as_slice())
            .update(&self.root_round.to_be_bytes())
            .update(&self.epoch.to_be_bytes())
            .update(&self.timestamp.to_be_bytes())
            .update(self.prev_hash.as_bytes())
            .update(self.hash.as_bytes());
        h.finish().as_bytes().to_vec()
    }

    /// `true` once at least `quorum` distinct signatures from `trusted`
    /// validate against the signing payload.
    pub fn has_quorum(&self, trusted: &[NodeId], quorum: usize) -> bool {
        let payload = self.signing_bytes();
        let valid = self
            .signatures
            .iter()
            .filter(|(node, _)| trusted.contains(node))
            .filter(|(node, sig)| verify(node, &payload, sig).is_ok())
            .count();
        valid >= quorum
    }
}

#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct UnicityCertificate {
    pub input_record: InputRecord,
    pub tr_hash: HashValue,
    pub shard_conf_hash: HashValue,
    pub shard_tree_certificate: ShardTreeCertificate,
    pub unicity_tree_certificate: UnicityTreeCertificate,
    pub unicity_seal: UnicitySeal,
}

impl UnicityCertificate {
    pub fn is_initial(&self) -> bool {
        self.input_record.is_initial()
    }

    pub fn round(&self) -> Round {
        self.input_record.round
    }

    pub fn root_round(&self) -> Round {
        self.unicity_seal.root_round
    }

    /// Two UCs equivocate when they certify the same partition round with
    /// distinct input records (spec.md §3, §4.1.4 step 2).
    pub fn equivocates(&self, other: &UnicityCertificate) -> bool {
        self.input_record.equivocates(&other.input_record)
    }

    /// A UC is a repeat of `prev` when it recertifies the same IR round
    /// with the same previous-state hash but may reset pending work
    /// (spec.md §3 "Repeat UC").
    pub fn is_repeat_of(&self, prev: &UnicityCertificate) -> bool {
        self.input_record.round == prev.input_record.round
            && self.input_record.previous_state_hash == prev.input_record.previous_state_hash
    }

    pub fn is_successor_of(&self, prev: &UnicityCertificate) -> bool {
        self.input_record.is_successor_of(&prev.input_record)
    }
}

impl CryptoHash for UnicityCertificate {
    const DOMAIN: &'static str = "UnicityCertificate";

    fn hash(&self) -> HashValue {
        let mut h = DomainHasher::new(Self::DOMAIN);
        h.update(self.input_record.hash().as_bytes())
            .update(self.tr_hash.as_bytes())
            .update(self.shard_conf_hash.as_bytes())
            .update(&self.unicity_seal.hash.0);
        h.finish()
    }
}

//! Input Record (spec.md §3 "Input Record").

use crate::hash::{CryptoHash, DomainHasher, HashValue};
use crate::ids::{Epoch, Round};
use serde::{Deserialize, Serialize};

pub const IR_VERSION: u32 = 1;

/// Per-shard execution summary of one round.
///
/// Invariant: `state_hash == HashValue::zero()` marks the record
/// **initial** (spec.md §3). Non-initial successors must chain via
/// `previous_state_hash == prev.state_hash`.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct InputRecord {
    pub version: u32,
    pub epoch: Epoch,
    pub round: Round,
    pub previous_state_hash: HashValue,
    pub state_hash: HashValue,
    pub block_hash: HashValue,
    pub summary_value: Vec<u8>,
    pub sum_of_earned_fees: u64,
    /// Executed-tx-buffer hash.
    pub ethash: HashValue,
    pub timestamp: u64,
}

impl InputRecord {
    pub fn is_initial(&self) -> bool {
        self.state_hash.is_zero()
    }

    /// `true` iff `self` may legally follow `prev` in the same shard's
    /// history (spec.md §3 invariant, and the "no-gap commits" property of
    /// spec.md §8).
    pub fn is_successor_of(&self, prev: &InputRecord) -> bool {
        if self.round != prev.round + 1 {
            return false;
        }
        if self.is_initial() {
            return true;
        }
        self.previous_state_hash == prev.state_hash
    }

    /// `true` iff `self` certifies the exact same round as `other` but the
    /// two differ on executed content — the equivocation condition from
    /// spec.md §3/§4.1.4.
    pub fn equivocates(&self, other: &InputRecord) -> bool {
        self.round == other.round && self.hash() != other.hash()
    }

    /// `true` iff `self` is a repeat of `prev`: same round, same IR content
    /// (used to detect "repeat UC", spec.md §3/§4.1.4).
    pub fn is_repeat_of(&self, prev: &InputRecord) -> bool {
        self.round == prev.round && self.previous_state_hash == prev.previous_state_hash
    }
}


impl CryptoHash for InputRecord {
    const DOMAIN: &'static str = "InputRecord";

    fn hash(&self) -> HashValue {
        let mut h = DomainHasher::new(Self::DOMAIN);
        h.update(&self.version.to_be_bytes())
            .update(&self.epoch.to_be_bytes())
            .update(&self.round.to_be_bytes())
            .update(self.previous_state_hash.as_bytes())
            .update(self.state_hash.as_bytes())
            .update(self.block_hash.as_bytes())
            .update(&self.summary_value)
            .update(&self.sum_of_earned_fees.to_be_bytes())
            .update(self.ethash.as_bytes())
            .update(&self.timestamp.to_be_bytes());
        h.finish()
    }
}

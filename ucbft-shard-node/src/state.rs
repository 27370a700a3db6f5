//! Node state (spec.md §4.1.1 "States & transitions") and the persisted
//! pending proposal (spec.md §3 "Lifecycle & ownership": "exclusively
//! owned by the Shard Node between certification-request emission and UC
//! reception; persisted under a reserved key").

use serde::{Deserialize, Serialize};
use ucbft_types::{HashValue, InputRecord, NetworkId, NodeId, PartitionId, ShardId, Transaction};

/// Design Notes §9 "Control-flow state": a compact sum type rather than an
/// ambient `recovering: bool` flag plus a separately-tracked round.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ShardNodeState {
    Initializing,
    Normal,
    Recovering,
}

/// The block this node proposed (as leader) or accepted (as follower) and
/// sent a `CertificationRequest` for, kept until the matching UC arrives
/// (spec.md §4.1.3 step 4, §4.1.4 step 8).
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct PendingProposal {
    pub network: NetworkId,
    pub partition: PartitionId,
    pub shard: ShardId,
    pub proposer: NodeId,
    pub previous_block_hash: HashValue,
    pub transactions: Vec<Transaction>,
    pub input_record: InputRecord,
}

impl PendingProposal {
    /// `proposed_ir == uc.input_record` comparison from spec.md §4.1.4
    /// step 8: hash, previous_hash, summary_value, sum_of_earned_fees, ETH.
    pub fn matches(&self, ir: &InputRecord) -> bool {
        let ours = &self.input_record;
        ours.round == ir.round
            && ours.previous_state_hash == ir.previous_state_hash
            && ours.state_hash == ir.state_hash
            && ours.summary_value == ir.summary_value
            && ours.sum_of_earned_fees == ir.sum_of_earned_fees
            && ours.ethash == ir.ethash
    }
}

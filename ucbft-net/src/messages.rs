//! Wire messages (spec.md §6 "Validator P2P protocols" / "Root P2P
//! protocols"). Each protocol name from the spec is one enum variant,
//! dispatched with a single `match` in the event loop (SPEC_FULL.md §6).

use serde::{Deserialize, Serialize};
use ucbft_types::{
    Block, BlockData, ChangeReason, HashValue, InputRecord, LedgerReplicationRequest,
    LedgerReplicationResponse, NodeId, PartitionId, QuorumCert, ShardId, Signature,
    TechnicalRecord, Timeout, TimeoutCertificate, TimeoutVote, Transaction, UnicityCertificate,
    Vote,
};

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct BlockProposalMsg {
    pub partition: PartitionId,
    pub shard: ShardId,
    pub node_id: NodeId,
    pub uc: UnicityCertificate,
    pub tr: Option<TechnicalRecord>,
    pub transactions: Vec<Transaction>,
    pub signature: Signature,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct CertificationRequestMsg {
    pub partition: PartitionId,
    pub shard: ShardId,
    pub node: NodeId,
    pub input_record: InputRecord,
    pub block_size: u64,
    pub state_size: u64,
    pub signature: Signature,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct CertificationResponseMsg {
    pub partition: PartitionId,
    pub shard: ShardId,
    pub uc: UnicityCertificate,
    pub technical: TechnicalRecord,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct HandshakeMsg {
    pub node: NodeId,
    pub partition: PartitionId,
    pub shard: ShardId,
    pub luc_round: u64,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct InputForwardMsg {
    pub partition: PartitionId,
    pub shard: ShardId,
    pub transaction: Transaction,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub enum ValidatorMessage {
    BlockProposal(BlockProposalMsg),
    BlockCertificationRequest(CertificationRequestMsg),
    UnicityCertificates(CertificationResponseMsg),
    LedgerReplicationReq(LedgerReplicationRequest),
    LedgerReplicationResp(LedgerReplicationResponse),
    Handshake(HandshakeMsg),
    InputForward(InputForwardMsg),
    Block(Block),
}

/// Per-shard authenticated head state, sourced from `BlockTree::CurrentState`
/// (spec.md §4.2.6).
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct CommittedHead {
    pub shard_conf_hash: HashValue,
    pub executed_block: ucbft_types::ExecutedBlock,
    pub qc: QuorumCert,
    pub commit_qc: QuorumCert,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct PendingBlock {
    pub block_data: BlockData,
    pub qc: Option<QuorumCert>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct StateRequestMsg {
    pub node_id: NodeId,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct StateMsg {
    pub committed_head: CommittedHead,
    pub pending: Vec<PendingBlock>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct IrChangeReqMsg {
    pub partition: PartitionId,
    pub shard: ShardId,
    pub input_record: InputRecord,
    pub reason: ChangeReason,
    pub requester: NodeId,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct TimeoutMsg {
    pub timeout: Timeout,
    pub author: NodeId,
    pub hqc_round: u64,
    pub signature: Signature,
    /// Present once the sender already observed a quorum of timeout votes
    /// for this round, so the receiver can adopt it directly.
    pub tc: Option<TimeoutCertificate>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub enum RootMessage {
    IrChangeReq(IrChangeReqMsg),
    Proposal(BlockData),
    Vote(Vote),
    Timeout(TimeoutMsg),
    StateReq(StateRequestMsg),
    StateResp(StateMsg),
}

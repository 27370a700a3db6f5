//! Ledger replication wire types (spec.md §4.1.6).

use crate::block::Block;
use crate::ids::{NodeId, PartitionId, Round, ShardId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct LedgerReplicationRequest {
    pub uuid: Uuid,
    pub partition: PartitionId,
    pub shard: ShardId,
    pub node: NodeId,
    pub begin: Round,
    pub end: Round,
}

#[derive(Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub enum ReplicationStatus {
    Ok,
    BlocksNotFound,
    WrongShard,
    InvalidRequestParameters,
    Unknown,
}

#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct LedgerReplicationResponse {
    pub uuid: Uuid,
    pub status: ReplicationStatus,
    pub message: String,
    pub blocks: Vec<Block>,
    pub first: Option<Round>,
    pub last: Option<Round>,
}

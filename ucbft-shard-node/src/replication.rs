//! Ledger replication (spec.md §4.1.6). The server half streams persisted
//! blocks in round order; the client half (embedded in `ShardNode`) tracks
//! one in-flight request with a retry timer.

use std::time::Instant;
use ucbft_store::{codec, keys, PersistentStore};
use ucbft_types::{Block, LedgerReplicationRequest, LedgerReplicationResponse, PartitionId, ReplicationStatus, Round, ShardId};
use uuid::Uuid;

/// Server side of spec.md §4.1.6: "streams blocks in order starting at
/// `begin`, stopping when `transactions >= max_tx` OR `blocks >=
/// max_return_blocks` OR `round >= end>0`. Out-of-range -> `BlocksNotFound`."
pub fn serve_request(
    store: &dyn PersistentStore,
    own_partition: &PartitionId,
    own_shard: &ShardId,
    req: &LedgerReplicationRequest,
    max_return_blocks: u64,
    max_tx: u64,
) -> LedgerReplicationResponse {
    if &req.partition != own_partition || &req.shard != own_shard {
        return LedgerReplicationResponse {
            uuid: req.uuid,
            status: ReplicationStatus::WrongShard,
            message: "request is for a different partition/shard".to_string(),
            blocks: Vec::new(),
            first: None,
            last: None,
        };
    }
    if req.end != 0 && req.end < req.begin {
        return LedgerReplicationResponse {
            uuid: req.uuid,
            status: ReplicationStatus::InvalidRequestParameters,
            message: format!("end {} precedes begin {}", req.end, req.begin),
            blocks: Vec::new(),
            first: None,
            last: None,
        };
    }

    let mut blocks = Vec::new();
    let mut tx_count: u64 = 0;
    let mut round = req.begin;
    loop {
        if req.end != 0 && round >= req.end {
            break;
        }
        if blocks.len() as u64 >= max_return_blocks {
            break;
        }
        let Some(bytes) = store.get(&keys::block_key(round)).unwrap_or(None) else {
            break;
        };
        let block: Block = match codec::decode(&bytes) {
            Ok(b) => b,
            Err(_) => break,
        };
        tx_count += block.transactions.len() as u64;
        blocks.push(block);
        round += 1;
        if tx_count >= max_tx {
            break;
        }
    }

    if blocks.is_empty() {
        return LedgerReplicationResponse {
            uuid: req.uuid,
            status: ReplicationStatus::BlocksNotFound,
            message: format!("no blocks available from round {}", req.begin),
            blocks: Vec::new(),
            first: None,
            last: None,
        };
    }

    let first = blocks.first().map(|b| b.round());
    let last = blocks.last().map(|b| b.round());
    LedgerReplicationResponse {
        uuid: req.uuid,
        status: ReplicationStatus::Ok,
        message: String::new(),
        blocks,
        first,
        last,
    }
}

/// Client-side in-flight request state (spec.md §4.1.6 "a retry timer
/// re-sends on silence").
pub struct ReplicationInFlight {
    pub uuid: Uuid,
    pub begin: Round,
    pub end: Round,
    pub sent_at: Instant,
}

impl ReplicationInFlight {
    pub fn new(begin: Round, end: Round) -> Self {
        ReplicationInFlight {
            uuid: Uuid::new_v4(),
            begin,
            end,
            sent_at: Instant::now(),
        }
    }

    pub fn to_request(&self, partition: PartitionId, shard: ShardId, node: ucbft_types::NodeId) -> LedgerReplicationRequest {
        LedgerReplicationRequest {
            uuid: self.uuid,
            partition,
            shard,
            node,
            begin: self.begin,
            end: self.end,
        }
    }

    pub fn expired(&self, timeout: std::time::Duration) -> bool {
        self.sent_at.elapsed() >= timeout
    }
}

//! Core data model for the sharded BFT ledger (spec.md §3).
//!
//! Every type here is immutable once constructed: UCs and blocks are
//! signed/finalized once and never mutated in place (spec.md §3
//! "Lifecycle & ownership").

pub mod block;
pub mod crypto;
pub mod errors;
pub mod hash;
pub mod ids;
pub mod ir;
pub mod payload;
pub mod replication;
pub mod timeout;
pub mod tr;
pub mod uc;
pub mod vote;

pub use block::{Block, BlockHeader, ExecutedBlock, Transaction};
pub use crypto::{CryptoError, Signature, ValidatorSigner};
pub use errors::{StateError, ValidationError};
pub use hash::{CryptoHash, HashValue};
pub use ids::{
    Epoch, NetworkId, NodeId, PartitionId, PartitionShardId, Round, ShardId, GENESIS_ROOT_ROUND,
};
pub use ir::InputRecord;
pub use payload::{BlockData, ChangeReason, IrChangeReq, Payload};
pub use replication::{LedgerReplicationRequest, LedgerReplicationResponse, ReplicationStatus};
pub use timeout::{Timeout, TimeoutCertificate, TimeoutVote};
pub use tr::TechnicalRecord;
pub use uc::{ShardTreeCertificate, UnicityCertificate, UnicitySeal, UnicityTreeCertificate};
pub use vote::{genesis_qc, QuorumCert, Vote, VoteInfo};

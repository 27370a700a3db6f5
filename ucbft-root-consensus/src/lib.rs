//! Root Consensus Manager (spec.md §2 C6) and its two nearest
//! collaborators: the IR-Change Buffer (C5) and the shard-state-apply
//! capability the Consensus Manager needs to compute a proposal's new
//! root hash.

mod consensus_manager;
mod ir_buffer;
mod state_tree;

pub use consensus_manager::{ConsensusError, ConsensusManager, RecoveryAction, RecoveryState};
pub use ir_buffer::{IrBufferError, IrChangeBuffer};
pub use state_tree::{InMemoryShardStateTree, ShardStateTree};

//! Identifiers (spec.md §3 "Identifiers").

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! byte_id {
    ($name:ident) => {
        #[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize, Default)]
        pub struct $name(#[serde(with = "serde_bytes")] pub Vec<u8>);

        impl $name {
            pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
                $name(bytes.into())
            }

            pub fn as_slice(&self) -> &[u8] {
                &self.0
            }

            /// `true` if `self` is a hierarchical prefix of `other`, used by
            /// shard-id range checks. An empty id is the root of all shards.
            pub fn is_prefix_of(&self, other: &Self) -> bool {
                other.0.starts_with(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(&self.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(&self.0))
            }
        }
    };
}

byte_id!(NetworkId);
byte_id!(PartitionId);
byte_id!(ShardId);

/// Peer identity string, e.g. the hex-encoded ed25519 public key of a node.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize, Default)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(s: impl Into<String>) -> Self {
        NodeId(s.into())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The shard coordinate: a specific shard of a specific partition.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize, Debug)]
pub struct PartitionShardId {
    pub partition: PartitionId,
    pub shard: ShardId,
}

impl PartitionShardId {
    pub fn new(partition: PartitionId, shard: ShardId) -> Self {
        PartitionShardId { partition, shard }
    }
}

impl fmt::Display for PartitionShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition, self.shard)
    }
}

pub type Round = u64;
pub type Epoch = u64;

/// Root-round sentinel used to seed the genesis QC (spec.md §4.2.8).
pub const GENESIS_ROOT_ROUND: Round = 0;

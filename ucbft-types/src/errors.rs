//! Shared error taxonomy (spec.md §7). Each crate boundary refines these
//! with its own `thiserror` enum; these are the primitives common to more
//! than one crate so they don't get redefined at every seam.

use crate::ids::Round;
use thiserror::Error;

/// Validation errors: logged and dropped, never fatal (spec.md §7).
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ValidationError {
    #[error("invalid signature from {0}")]
    InvalidSignature(String),
    #[error("wrong partition/shard: expected {expected}, got {actual}")]
    WrongShard { expected: String, actual: String },
    #[error("invalid input record: {0}")]
    InvalidInputRecord(String),
    #[error("invalid proof: {0}")]
    InvalidProof(String),
    #[error("equivocating UC at round {0}")]
    EquivocatingUc(Round),
    #[error("equivocating block proposal at round {0}")]
    EquivocatingProposal(Round),
}

/// State errors: trigger a transition into `Recovering` rather than being
/// treated as fatal (spec.md §7).
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum StateError {
    #[error("state hash mismatch at round {round}")]
    StateHashMismatch { round: Round },
    #[error("missing block at round {0}")]
    MissingBlock(Round),
    #[error("successor gap: expected round {expected}, got {actual}")]
    SuccessorGap { expected: Round, actual: Round },
}

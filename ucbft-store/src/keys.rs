//! Key layout (spec.md §6 "Persistence").

/// Block keyed by round, big-endian 64-bit (spec.md §4.1.4 step 8, §6).
pub fn block_key(round: u64) -> Vec<u8> {
    let mut k = b"block/".to_vec();
    k.extend_from_slice(&round.to_be_bytes());
    k
}

/// The single reserved pending-proposal key (spec.md §6: `0u32 BE`).
pub fn pending_proposal_key() -> Vec<u8> {
    let mut k = b"pending/".to_vec();
    k.extend_from_slice(&0u32.to_be_bytes());
    k
}

pub const LATEST_ROUND_KEY: &[u8] = b"latestRoundNumber";

pub fn last_vote_key() -> Vec<u8> {
    b"safety/last_vote".to_vec()
}

pub fn last_tc_key() -> Vec<u8> {
    b"safety/last_tc".to_vec()
}

pub fn highest_voted_round_key() -> Vec<u8> {
    b"safety/hvr".to_vec()
}

pub fn highest_qc_round_key() -> Vec<u8> {
    b"safety/hqr".to_vec()
}

/// Per-round delete-index for proof-indexer history pruning (spec.md §4.3).
pub fn delete_index_key(round: u64) -> Vec<u8> {
    let mut k = b"delidx/".to_vec();
    k.extend_from_slice(&round.to_be_bytes());
    k
}

pub fn round_from_block_key(key: &[u8]) -> Option<u64> {
    let suffix = key.strip_prefix(b"block/")?;
    let bytes: [u8; 8] = suffix.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

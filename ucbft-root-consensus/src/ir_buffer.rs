//! IR-Change Buffer (spec.md §2 C5, §4.2.4): aggregates validated
//! per-shard input-record change requests between rounds, to be folded
//! into the next proposal's payload.

use std::collections::BTreeMap;
use thiserror::Error;
use ucbft_types::{ChangeReason, IrChangeReq, Payload, PartitionShardId};

#[derive(Debug, Error, Eq, PartialEq)]
pub enum IrBufferError {
    #[error("{0} only the leader may buffer a T2Timeout request")]
    TimeoutNotFromLeader(PartitionShardId),
    #[error("{0} equivocating input-record change request")]
    EquivocatingRequest(PartitionShardId),
}

/// Buffers at most one request per shard between two `GeneratePayload`
/// calls (spec.md §4.2.4).
#[derive(Default)]
pub struct IrChangeBuffer {
    entries: BTreeMap<PartitionShardId, IrChangeReq>,
}

impl IrChangeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Add(round, req, verifier)` (spec.md §4.2.4). `is_leader` gates
    /// `ChangeReason::T2Timeout`, which only the round's leader may
    /// originate; `verifier` is the shard-conf/signature check the caller
    /// has already run over `req`'s underlying certification requests —
    /// a rejected request is dropped and logged, never propagated
    /// (spec.md §4.2.7 "Verifier rejection").
    pub fn add(&mut self, req: IrChangeReq, is_leader: bool) -> Result<(), IrBufferError> {
        if req.reason == ChangeReason::T2Timeout && !is_leader {
            return Err(IrBufferError::TimeoutNotFromLeader(req.shard.clone()));
        }
        if let Some(existing) = self.entries.get(&req.shard) {
            if existing.input_record == req.input_record {
                // Identical IR already buffered: deduplicate silently.
                return Ok(());
            }
            return Err(IrBufferError::EquivocatingRequest(req.shard.clone()));
        }
        self.entries.insert(req.shard.clone(), req);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `GeneratePayload(round, t2_timeouts, in_progress_fn)` (spec.md
    /// §4.2.4): synthesizes a `T2Timeout` entry for every timed-out shard
    /// still lacking a buffered change and not already mid-change
    /// elsewhere, appends every buffered request whose shard has no
    /// change in flight, then clears the buffer.
    pub fn generate_payload(
        &mut self,
        t2_timeouts: &[IrChangeReq],
        in_progress: impl Fn(&PartitionShardId) -> bool,
    ) -> Payload {
        let mut requests = Vec::new();

        for timeout_req in t2_timeouts {
            debug_assert_eq!(timeout_req.reason, ChangeReason::T2Timeout);
            let shard = &timeout_req.shard;
            if !self.entries.contains_key(shard) && !in_progress(shard) {
                requests.push(timeout_req.clone());
            }
        }

        for (shard, req) in &self.entries {
            if !in_progress(shard) {
                requests.push(req.clone());
            }
        }

        self.entries.clear();
        Payload { requests }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ucbft_types::{HashValue, InputRecord, PartitionId, ShardId};

    fn shard(label: &str) -> PartitionShardId {
        PartitionShardId::new(PartitionId::new(label.as_bytes().to_vec()), ShardId::new(vec![]))
    }

    fn ir(round: u64, state_hash: HashValue) -> InputRecord {
        InputRecord {
            version: 1,
            epoch: 0,
            round,
            previous_state_hash: HashValue::zero(),
            state_hash,
            block_hash: HashValue::zero(),
            summary_value: vec![],
            sum_of_earned_fees: 0,
            ethash: HashValue::zero(),
            timestamp: 0,
        }
    }

    fn req(label: &str, state_hash: HashValue, reason: ChangeReason) -> IrChangeReq {
        IrChangeReq {
            shard: shard(label),
            input_record: ir(1, state_hash),
            reason,
            original_request: vec![],
        }
    }

    #[test]
    fn rejects_timeout_not_from_leader() {
        let mut buf = IrChangeBuffer::new();
        let r = req("a", HashValue::zero(), ChangeReason::T2Timeout);
        assert_eq!(
            buf.add(r, false).unwrap_err(),
            IrBufferError::TimeoutNotFromLeader(shard("a"))
        );
    }

    #[test]
    fn deduplicates_identical_ir_for_same_shard() {
        let mut buf = IrChangeBuffer::new();
        let r = req("a", HashValue::zero(), ChangeReason::Quorum);
        buf.add(r.clone(), true).unwrap();
        buf.add(r, true).unwrap();
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn rejects_equivocating_request_for_same_shard() {
        let mut buf = IrChangeBuffer::new();
        let h1 = ucbft_types::hash::hash_bytes("t", b"one");
        let h2 = ucbft_types::hash::hash_bytes("t", b"two");
        buf.add(req("a", h1, ChangeReason::Quorum), true).unwrap();
        assert_eq!(
            buf.add(req("a", h2, ChangeReason::Quorum), true).unwrap_err(),
            IrBufferError::EquivocatingRequest(shard("a"))
        );
    }

    #[test]
    fn generate_payload_clears_buffer_and_includes_synthesized_timeouts() {
        let mut buf = IrChangeBuffer::new();
        buf.add(req("a", HashValue::zero(), ChangeReason::Quorum), true)
            .unwrap();
        let timeout_req = req("b", HashValue::zero(), ChangeReason::T2Timeout);
        let payload = buf.generate_payload(&[timeout_req], |_| false);
        assert_eq!(payload.requests.len(), 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn generate_payload_skips_shards_with_change_in_flight() {
        let mut buf = IrChangeBuffer::new();
        buf.add(req("a", HashValue::zero(), ChangeReason::Quorum), true)
            .unwrap();
        let payload = buf.generate_payload(&[], |s| *s == shard("a"));
        assert!(payload.requests.is_empty());
    }

    #[test]
    fn t2timeout_skipped_when_shard_already_has_buffered_change() {
        let mut buf = IrChangeBuffer::new();
        buf.add(req("a", HashValue::zero(), ChangeReason::Quorum), true)
            .unwrap();
        let timeout_req = req("a", HashValue::zero(), ChangeReason::T2Timeout);
        let payload = buf.generate_payload(&[timeout_req], |_| false);
        assert_eq!(payload.requests.len(), 1);
        assert_eq!(payload.requests[0].reason, ChangeReason::Quorum);
    }
}

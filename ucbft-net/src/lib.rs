//! Network capability (Design Notes §9 "capability records
//! `{send, receive_channel, ...}`"). The core composes with any transport
//! satisfying `Network<M>`; real libp2p plumbing is out of scope
//! (spec.md §1) and is replaced here by an in-memory loopback used by
//! tests and by the test doubles in `ucbft-shard-node`/`ucbft-root-consensus`.

pub mod messages;

pub use messages::{
    BlockProposalMsg, CertificationRequestMsg, CertificationResponseMsg, CommittedHead,
    HandshakeMsg, InputForwardMsg, IrChangeReqMsg, PendingBlock, RootMessage, StateMsg,
    StateRequestMsg, TimeoutMsg, ValidatorMessage,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use ucbft_types::NodeId;

/// `{send, receive_channel}` per Design Notes §9. `M` is the protocol
/// family's message enum (`ValidatorMessage` or `RootMessage`).
#[async_trait]
pub trait Network<M>: Send + Sync {
    async fn send_to(&self, to: &NodeId, msg: M) -> Result<()>;

    async fn broadcast(&self, to: &[NodeId], msg: M) -> Result<()>;
}

/// In-memory loopback transport: every registered node gets an mpsc
/// channel; `send_to`/`broadcast` push onto the recipient's channel.
/// Never drops messages silently — an unreachable peer is a `send`
/// failure the caller handles per spec.md §7 ("Transport errors").
pub struct InMemoryNetwork<M> {
    peers: Mutex<HashMap<NodeId, mpsc::Sender<(NodeId, M)>>>,
    self_id: NodeId,
}

impl<M: Clone + Send + 'static> InMemoryNetwork<M> {
    pub fn new(self_id: NodeId) -> Arc<Self> {
        Arc::new(InMemoryNetwork {
            peers: Mutex::new(HashMap::new()),
            self_id,
        })
    }

    /// Registers `node` and returns its inbound receiver. Capacity mirrors
    /// the `event_channel_capacity` config knob (spec.md §6).
    pub async fn register(&self, node: NodeId, capacity: usize) -> mpsc::Receiver<(NodeId, M)> {
        let (tx, rx) = mpsc::channel(capacity);
        self.peers.lock().await.insert(node, tx);
        rx
    }
}

#[async_trait]
impl<M: Clone + Send + Sync + 'static> Network<M> for InMemoryNetwork<M> {
    async fn send_to(&self, to: &NodeId, msg: M) -> Result<()> {
        let peers = self.peers.lock().await;
        let tx = peers
            .get(to)
            .ok_or_else(|| anyhow!("peer {} unreachable", to))?;
        tx.send((self.self_id.clone(), msg))
            .await
            .map_err(|_| anyhow!("peer {} channel closed", to))
    }

    async fn broadcast(&self, to: &[NodeId], msg: M) -> Result<()> {
        for node in to {
            // Best-effort: one unreachable peer must not stop delivery to
            // the rest (spec.md §7 "try next peer").
            let _ = self.send_to(node, msg.clone()).await;
        }
        Ok(())
    }
}

//! Node identity and signatures (SPEC_FULL.md §3 "Signatures").
//!
//! A `NodeId` is the hex encoding of an ed25519 public key; verification is
//! a pure function of `(message_bytes, public_key, signature)` independent
//! of the transport, matching `aptos-crypto`'s signer/verifier split.

use crate::ids::NodeId;
use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature as DalekSignature, Signer, Verifier};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] pub Vec<u8>);

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0))
    }
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("malformed public key for node {0}")]
    MalformedPublicKey(NodeId),
    #[error("malformed signature")]
    MalformedSignature,
    #[error("signature verification failed for node {0}")]
    VerificationFailed(NodeId),
}

/// Signs messages on behalf of one node. Held by the leader/validator
/// process; never serialized or sent over the wire.
pub struct ValidatorSigner {
    node_id: NodeId,
    keypair: Keypair,
}

impl ValidatorSigner {
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = PublicKey::from(&secret);
        let keypair = Keypair { secret, public };
        let node_id = NodeId::new(hex::encode(keypair.public.as_bytes()));
        ValidatorSigner { node_id, keypair }
    }

    pub fn generate_for_testing(rng: &mut impl rand::RngCore) -> Self {
        let keypair = Keypair::generate(rng);
        let node_id = NodeId::new(hex::encode(keypair.public.as_bytes()));
        ValidatorSigner { node_id, keypair }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.keypair.sign(message).to_bytes().to_vec())
    }
}

/// Verifies signatures from known validator identities. Stateless: the
/// caller supplies the expected public key set (shard-conf / epoch
/// validator set) per call.
pub fn verify(node: &NodeId, message: &[u8], sig: &Signature) -> Result<(), CryptoError> {
    let pk_bytes =
        hex::decode(&node.0).map_err(|_| CryptoError::MalformedPublicKey(node.clone()))?;
    let public = PublicKey::from_bytes(&pk_bytes)
        .map_err(|_| CryptoError::MalformedPublicKey(node.clone()))?;
    let signature = DalekSignature::from_bytes(&sig.0).map_err(|_| CryptoError::MalformedSignature)?;
    public
        .verify(message, &signature)
        .map_err(|_| CryptoError::VerificationFailed(node.clone()))
}

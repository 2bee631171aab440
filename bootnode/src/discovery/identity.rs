//! Node identity for the discovery protocol.
//!
//! A node is identified by an Ed25519 key pair. The node ID used for
//! Kademlia distances is the SHA3-256 hash of the 32-byte public key.

use std::cmp::Ordering;
use std::fmt;

use tos_bootnode_common::crypto::{
    Ed25519KeyPair, Ed25519PublicKey, Ed25519SecretKey, Ed25519Signature, Hash,
};

/// Node ID is a 32-byte hash of the node's public key.
pub type NodeId = Hash;

/// Node identity containing the key pair and derived node ID.
#[derive(Clone)]
pub struct NodeIdentity {
    keypair: Ed25519KeyPair,
    node_id: NodeId,
}

impl NodeIdentity {
    /// Generate a new random node identity.
    pub fn generate() -> Self {
        Self::from_keypair(Ed25519KeyPair::generate())
    }

    pub fn from_keypair(keypair: Ed25519KeyPair) -> Self {
        let node_id = keypair.node_id();
        Self { keypair, node_id }
    }

    pub fn from_secret(secret: &Ed25519SecretKey) -> Self {
        Self::from_keypair(Ed25519KeyPair::from_secret(secret))
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn public_key(&self) -> Ed25519PublicKey {
        self.keypair.public_key()
    }

    pub fn secret_key(&self) -> Ed25519SecretKey {
        self.keypair.secret_key()
    }

    pub fn sign(&self, message: &[u8]) -> Ed25519Signature {
        self.keypair.sign(message)
    }

    /// Hex form of the node ID, printed by `--writeaddress` and used in
    /// `tosnode://` URLs.
    pub fn fingerprint(&self) -> String {
        self.node_id.to_hex()
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id.to_hex())
            .field("public_key", &self.public_key().to_hex())
            .finish()
    }
}

/// XOR distance between two node IDs.
pub fn xor_distance(a: &NodeId, b: &NodeId) -> [u8; 32] {
    let mut result = [0u8; 32];
    for (out, (x, y)) in result
        .iter_mut()
        .zip(a.as_bytes().iter().zip(b.as_bytes().iter()))
    {
        *out = x ^ y;
    }
    result
}

/// Index of the highest differing bit, which selects the k-bucket.
///
/// Bucket 255 holds nodes differing in the most significant bit, bucket 0
/// nodes differing only in the least significant one. `None` for equal IDs.
pub fn log2_distance(a: &NodeId, b: &NodeId) -> Option<u8> {
    let distance = xor_distance(a, b);
    let (index, byte) = distance.iter().enumerate().find(|(_, b)| **b != 0)?;
    let bit_position = index * 8 + byte.leading_zeros() as usize;
    Some(255u8.saturating_sub(bit_position as u8))
}

/// Orders `a` and `b` by their distance to `target`, closest first.
pub fn compare_distance(target: &NodeId, a: &NodeId, b: &NodeId) -> Ordering {
    xor_distance(target, a).cmp(&xor_distance(target, b))
}

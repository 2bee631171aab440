//! Ed25519 keys identifying bootnodes and discovery peers.
//!
//! A node is identified on the wire by its 32-byte public key; the node ID
//! used for Kademlia distances is the SHA3-256 hash of those bytes.

use ed25519_dalek::{
    Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH,
    SECRET_KEY_LENGTH, SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{hash, Hash};
use crate::serializer::{Reader, ReaderError, Serializer, Writer};

pub const ED25519_SECRET_KEY_SIZE: usize = SECRET_KEY_LENGTH;
pub const ED25519_PUBLIC_KEY_SIZE: usize = PUBLIC_KEY_LENGTH;
pub const ED25519_SIGNATURE_SIZE: usize = SIGNATURE_LENGTH;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Ed25519Error {
    #[error("invalid {kind} length: expected {expected} bytes, got {got}")]
    InvalidLength {
        kind: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("invalid hex string: {0}")]
    HexError(String),

    #[error("public key is not a valid curve point")]
    InvalidPublicKey,

    #[error("signature verification failed")]
    VerificationFailed,
}

fn decode_fixed<const N: usize>(kind: &'static str, hex_str: &str) -> Result<[u8; N], Ed25519Error> {
    let bytes = hex::decode(hex_str).map_err(|e| Ed25519Error::HexError(e.to_string()))?;
    fixed_from_slice(kind, &bytes)
}

fn fixed_from_slice<const N: usize>(kind: &'static str, slice: &[u8]) -> Result<[u8; N], Ed25519Error> {
    slice.try_into().map_err(|_| Ed25519Error::InvalidLength {
        kind,
        expected: N,
        got: slice.len(),
    })
}

/// Ed25519 secret key seed, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Ed25519SecretKey([u8; ED25519_SECRET_KEY_SIZE]);

impl Ed25519SecretKey {
    pub fn from_bytes(bytes: [u8; ED25519_SECRET_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, Ed25519Error> {
        fixed_from_slice("secret key", slice).map(Self)
    }

    /// Parse the hex form, tolerating a `0x` prefix and surrounding whitespace.
    pub fn from_hex(value: &str) -> Result<Self, Ed25519Error> {
        let trimmed = value.trim();
        let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        decode_fixed("secret key", trimmed).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; ED25519_SECRET_KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Ed25519SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Ed25519SecretKey([REDACTED])")
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ed25519PublicKey([u8; ED25519_PUBLIC_KEY_SIZE]);

impl Ed25519PublicKey {
    pub fn from_bytes(bytes: [u8; ED25519_PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, Ed25519Error> {
        fixed_from_slice("public key", slice).map(Self)
    }

    pub fn from_hex(value: &str) -> Result<Self, Ed25519Error> {
        decode_fixed("public key", value).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; ED25519_PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Node ID: SHA3-256 of the public key bytes.
    pub fn node_id(&self) -> Hash {
        hash(&self.0)
    }

    pub fn verify(&self, message: &[u8], signature: &Ed25519Signature) -> Result<(), Ed25519Error> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| Ed25519Error::InvalidPublicKey)?;
        verifying_key
            .verify(message, &DalekSignature::from_bytes(&signature.0))
            .map_err(|_| Ed25519Error::VerificationFailed)
    }
}

impl Serializer for Ed25519PublicKey {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self(reader.read_bytes_32()?))
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_bytes(&self.0);
    }

    fn size(&self) -> usize {
        ED25519_PUBLIC_KEY_SIZE
    }
}

impl fmt::Debug for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ed25519Signature([u8; ED25519_SIGNATURE_SIZE]);

impl Ed25519Signature {
    pub fn from_bytes(bytes: [u8; ED25519_SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, Ed25519Error> {
        fixed_from_slice("signature", slice).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; ED25519_SIGNATURE_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Serializer for Ed25519Signature {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self(reader.read_bytes::<ED25519_SIGNATURE_SIZE>()?))
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_bytes(&self.0);
    }

    fn size(&self) -> usize {
        ED25519_SIGNATURE_SIZE
    }
}

impl fmt::Debug for Ed25519Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Signature({}...)", &self.to_hex()[..16])
    }
}

/// Signing key plus its derived public key.
#[derive(Clone)]
pub struct Ed25519KeyPair {
    signing_key: SigningKey,
}

impl Ed25519KeyPair {
    /// Fresh key from the OS random number generator.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret(secret: &Ed25519SecretKey) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret.as_bytes()),
        }
    }

    pub fn secret_key(&self) -> Ed25519SecretKey {
        Ed25519SecretKey::from_bytes(self.signing_key.to_bytes())
    }

    pub fn public_key(&self) -> Ed25519PublicKey {
        Ed25519PublicKey::from_bytes(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Ed25519Signature {
        Ed25519Signature::from_bytes(self.signing_key.sign(message).to_bytes())
    }

    pub fn node_id(&self) -> Hash {
        self.public_key().node_id()
    }
}

impl fmt::Debug for Ed25519KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519KeyPair")
            .field("public_key", &self.public_key())
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

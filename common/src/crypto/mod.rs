mod hash;

pub mod ed25519;

pub use hash::*;

pub use ed25519::{
    Ed25519Error, Ed25519KeyPair, Ed25519PublicKey, Ed25519SecretKey, Ed25519Signature,
};

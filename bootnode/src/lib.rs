//! TOS Network discovery bootnode.
//!
//! The bootnode provisions a node identity, opens a UDP listening socket
//! (optionally plus a path-aware socket), attaches a NAT mapping and then
//! hands control to one of the two discovery engines:
//!
//! | Mode | Engine | Transports |
//! |------|--------|------------|
//! | legacy (default) | [`discovery::legacy`] | UDP, optionally path-aware |
//! | topic (`--v5`) | [`discovery::topic`] | UDP only |
//!
//! The startup sequence lives in [`bootstrap`].

pub mod bootstrap;
pub mod config;
pub mod discovery;
pub mod error;
pub mod nat;
pub mod scion;

pub use error::{BootnodeError, BootnodeResult, ErrorKind};

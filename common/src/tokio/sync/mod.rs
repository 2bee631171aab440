//! Tokio synchronization primitives used across the bootnode.
//!
//! Everything is re-exported from `tokio::sync` so callers depend on one path
//! whatever the runtime flavour.

pub use ::tokio::sync::*;

//! Fatal startup errors of the bootnode.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::bootstrap::DiscoveryMode;
use crate::discovery::DiscoveryError;
use crate::scion::ScionError;

/// Coarse classification of a [`BootnodeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or contradictory options; nothing was acquired yet.
    Configuration,
    /// A file, address or socket could not be obtained.
    ResourceAcquisition,
    EngineStart,
}

#[derive(Debug, Error)]
pub enum BootnodeError {
    #[error("--nodekey, --nodekeyhex: one of them (or --genkey) must be given")]
    MissingIdentitySource,

    #[error("--nodekey, --nodekeyhex: options are mutually exclusive")]
    ConflictingIdentitySource,

    #[error("{option}: invalid key material: {reason}")]
    InvalidKeyMaterial { option: &'static str, reason: String },

    #[error("--netrestrict: {0}")]
    InvalidNetlist(String),

    #[error("--nat: {0}")]
    InvalidNatDescriptor(String),

    #[error("--scion: {0}")]
    InvalidAlternateAddress(String),

    #[error("--bootnodes: {0}")]
    InvalidBootnode(#[source] DiscoveryError),

    #[error("--config-file: {}: {reason}", path.display())]
    InvalidConfigFile { path: PathBuf, reason: String },

    #[error("--genkey: could not write {}: {source}", path.display())]
    KeyPersistenceFailed { path: PathBuf, source: io::Error },

    #[error("--addr: could not resolve '{addr}': {reason}")]
    AddressResolutionFailed { addr: String, reason: String },

    #[error("--addr: could not bind {addr}: {source}")]
    SocketBindFailed { addr: String, source: io::Error },

    #[error("--scion: {0}")]
    AlternateTransportInitFailed(#[source] ScionError),

    #[error("{mode} discovery engine failed to start: {source}")]
    EngineStartFailed { mode: DiscoveryMode, source: DiscoveryError },
}

impl BootnodeError {
    pub fn kind(&self) -> ErrorKind {
        use BootnodeError::*;
        match self {
            MissingIdentitySource
            | ConflictingIdentitySource
            | InvalidKeyMaterial { .. }
            | InvalidNetlist(_)
            | InvalidNatDescriptor(_)
            | InvalidAlternateAddress(_)
            | InvalidBootnode(_)
            | InvalidConfigFile { .. } => ErrorKind::Configuration,
            KeyPersistenceFailed { .. }
            | AddressResolutionFailed { .. }
            | SocketBindFailed { .. }
            | AlternateTransportInitFailed(_) => ErrorKind::ResourceAcquisition,
            EngineStartFailed { .. } => ErrorKind::EngineStart,
        }
    }
}

pub type BootnodeResult<T> = Result<T, BootnodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_option() {
        assert_eq!(
            BootnodeError::InvalidNetlist("invalid CIDR 'not-a-cidr'".to_string()).to_string(),
            "--netrestrict: invalid CIDR 'not-a-cidr'"
        );
        assert!(BootnodeError::InvalidKeyMaterial {
            option: "--nodekeyhex",
            reason: "odd length".to_string()
        }
        .to_string()
        .starts_with("--nodekeyhex: "));
    }

    #[test]
    fn test_kinds() {
        assert_eq!(BootnodeError::MissingIdentitySource.kind(), ErrorKind::Configuration);
        assert_eq!(
            BootnodeError::SocketBindFailed {
                addr: "127.0.0.1:1".to_string(),
                source: io::Error::from(io::ErrorKind::AddrInUse)
            }
            .kind(),
            ErrorKind::ResourceAcquisition
        );
        assert_eq!(
            BootnodeError::EngineStartFailed {
                mode: DiscoveryMode::Topic,
                source: DiscoveryError::TopicLimit(1)
            }
            .kind(),
            ErrorKind::EngineStart
        );
    }
}

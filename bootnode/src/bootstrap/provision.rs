//! Node key generation, persistence and loading.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use log::{debug, info};
use tos_bootnode_common::crypto::Ed25519SecretKey;

use crate::discovery::NodeIdentity;
use crate::error::{BootnodeError, BootnodeResult};

const KEY_FILE_PERMS: u32 = 0o600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidSource {
    Missing,
    Conflicting,
}

/// Where the node key comes from, decided once from the startup options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySource {
    /// Create a fresh key, write it to the path and exit.
    Generate(PathBuf),
    FromFile(PathBuf),
    FromHex(String),
    Invalid(InvalidSource),
}

impl IdentitySource {
    /// Empty values count as absent.
    pub fn from_options(genkey: Option<&Path>, nodekey: Option<&Path>, nodekeyhex: Option<&str>) -> Self {
        let genkey = genkey.filter(|p| !p.as_os_str().is_empty());
        let nodekey = nodekey.filter(|p| !p.as_os_str().is_empty());
        let nodekeyhex = nodekeyhex.filter(|h| !h.trim().is_empty());

        if let Some(path) = genkey {
            return Self::Generate(path.to_path_buf());
        }
        match (nodekey, nodekeyhex) {
            (Some(path), None) => Self::FromFile(path.to_path_buf()),
            (None, Some(hex)) => Self::FromHex(hex.to_string()),
            (None, None) => Self::Invalid(InvalidSource::Missing),
            (Some(_), Some(_)) => Self::Invalid(InvalidSource::Conflicting),
        }
    }
}

#[derive(Debug)]
pub enum Provisioned {
    /// A key was written to `path`; the process is done.
    Generated { path: PathBuf, identity: NodeIdentity },
    Loaded(NodeIdentity),
}

impl Provisioned {
    pub fn identity(&self) -> &NodeIdentity {
        match self {
            Self::Generated { identity, .. } | Self::Loaded(identity) => identity,
        }
    }
}

pub fn provision(source: &IdentitySource) -> BootnodeResult<Provisioned> {
    match source {
        IdentitySource::Generate(path) => {
            let identity = generate_key(path)?;
            Ok(Provisioned::Generated {
                path: path.clone(),
                identity,
            })
        }
        IdentitySource::FromFile(path) => load_key_file(path).map(Provisioned::Loaded),
        IdentitySource::FromHex(hex) => load_key_hex(hex).map(Provisioned::Loaded),
        IdentitySource::Invalid(InvalidSource::Missing) => Err(BootnodeError::MissingIdentitySource),
        IdentitySource::Invalid(InvalidSource::Conflicting) => Err(BootnodeError::ConflictingIdentitySource),
    }
}

pub fn generate_key(path: &Path) -> BootnodeResult<NodeIdentity> {
    let identity = NodeIdentity::generate();
    save_key(path, &identity.secret_key()).map_err(|source| BootnodeError::KeyPersistenceFailed {
        path: path.to_path_buf(),
        source,
    })?;
    if log::log_enabled!(log::Level::Info) {
        info!("Generated node key {} in {}", identity.fingerprint(), path.display());
    }
    Ok(identity)
}

/// Write the secret as lowercase hex followed by a newline, readable by the
/// owner only.
pub fn save_key(path: &Path, secret: &Ed25519SecretKey) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut options = OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        options.mode(KEY_FILE_PERMS);
    }
    let mut file = options.open(path)?;

    // The mode above only applies to newly created files
    #[cfg(unix)]
    {
        fs::set_permissions(path, fs::Permissions::from_mode(KEY_FILE_PERMS))?;
    }

    file.write_all(secret.to_hex().as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()
}

pub fn load_key_file(path: &Path) -> BootnodeResult<NodeIdentity> {
    let invalid = |reason: String| BootnodeError::InvalidKeyMaterial {
        option: "--nodekey",
        reason,
    };
    let content = fs::read_to_string(path).map_err(|e| invalid(format!("{}: {}", path.display(), e)))?;
    let secret = Ed25519SecretKey::from_hex(content.trim()).map_err(|e| invalid(format!("{}: {}", path.display(), e)))?;
    let identity = NodeIdentity::from_secret(&secret);
    if log::log_enabled!(log::Level::Debug) {
        debug!("Loaded node key {} from {}", identity.fingerprint(), path.display());
    }
    Ok(identity)
}

pub fn load_key_hex(value: &str) -> BootnodeResult<NodeIdentity> {
    let secret = Ed25519SecretKey::from_hex(value.trim()).map_err(|e| BootnodeError::InvalidKeyMaterial {
        option: "--nodekeyhex",
        reason: e.to_string(),
    })?;
    Ok(NodeIdentity::from_secret(&secret))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_source_combinations() {
        let key = Path::new("node.key");
        assert_eq!(
            IdentitySource::from_options(None, None, None),
            IdentitySource::Invalid(InvalidSource::Missing)
        );
        assert_eq!(
            IdentitySource::from_options(None, Some(key), Some("ab")),
            IdentitySource::Invalid(InvalidSource::Conflicting)
        );
        assert_eq!(
            IdentitySource::from_options(None, Some(key), None),
            IdentitySource::FromFile(key.to_path_buf())
        );
        assert_eq!(
            IdentitySource::from_options(None, Some(Path::new("")), Some("ab")),
            IdentitySource::FromHex("ab".to_string())
        );
        // Generation wins over everything else
        assert_eq!(
            IdentitySource::from_options(Some(key), Some(key), Some("ab")),
            IdentitySource::Generate(key.to_path_buf())
        );
    }

    #[test]
    fn test_invalid_sources_are_fatal() {
        assert!(matches!(
            provision(&IdentitySource::Invalid(InvalidSource::Missing)),
            Err(BootnodeError::MissingIdentitySource)
        ));
        assert!(matches!(
            provision(&IdentitySource::Invalid(InvalidSource::Conflicting)),
            Err(BootnodeError::ConflictingIdentitySource)
        ));
    }

    #[test]
    fn test_generate_then_load() {
        let dir = TempDir::new("tos-bootnode-key").unwrap();
        let path = dir.path().join("nested").join("node.key");

        let generated = match provision(&IdentitySource::Generate(path.clone())).unwrap() {
            Provisioned::Generated { path: written, identity } => {
                assert_eq!(written, path);
                identity
            }
            other => panic!("unexpected {:?}", other),
        };

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.len(), 65);
        assert!(content.ends_with('\n'));
        #[cfg(unix)]
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);

        let loaded = provision(&IdentitySource::FromFile(path)).unwrap();
        assert_eq!(loaded.identity().node_id(), generated.node_id());
        assert_eq!(loaded.identity().secret_key().as_bytes(), generated.secret_key().as_bytes());

        let from_hex = load_key_hex(&format!("  {}  ", content.trim())).unwrap();
        assert_eq!(from_hex.fingerprint(), generated.fingerprint());
    }

    #[test]
    fn test_invalid_key_material() {
        match load_key_hex("abcd") {
            Err(BootnodeError::InvalidKeyMaterial { option, .. }) => assert_eq!(option, "--nodekeyhex"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(load_key_hex("zz").is_err());

        let dir = TempDir::new("tos-bootnode-key").unwrap();
        match load_key_file(&dir.path().join("missing.key")) {
            Err(BootnodeError::InvalidKeyMaterial { option, .. }) => assert_eq!(option, "--nodekey"),
            other => panic!("unexpected {:?}", other),
        }

        let garbage = dir.path().join("garbage.key");
        fs::write(&garbage, "not hex at all\n").unwrap();
        assert!(load_key_file(&garbage).is_err());
    }

    #[test]
    fn test_persistence_failure() {
        let dir = TempDir::new("tos-bootnode-key").unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();
        // Parent is a regular file
        let result = generate_key(&blocker.join("node.key"));
        assert!(matches!(result, Err(BootnodeError::KeyPersistenceFailed { .. })));
    }
}

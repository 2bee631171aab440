//! `tosnode://<node_id_hex>@<ip>:<port>` addresses of other bootnodes.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use tos_bootnode_common::crypto::Hash;

use super::error::{DiscoveryError, DiscoveryResult};
use super::identity::NodeId;

pub const TOSNODE_URL_SCHEME: &str = "tosnode://";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TosNodeUrl {
    pub node_id: NodeId,
    pub address: SocketAddr,
}

impl TosNodeUrl {
    pub fn new(node_id: NodeId, address: SocketAddr) -> Self {
        Self { node_id, address }
    }

    pub fn parse(s: &str) -> DiscoveryResult<Self> {
        let s = s.trim();
        let invalid = |reason: String| DiscoveryError::InvalidUrl(format!("{}: {}", s, reason));

        let rest = s
            .strip_prefix(TOSNODE_URL_SCHEME)
            .ok_or_else(|| invalid(format!("expected the {} scheme", TOSNODE_URL_SCHEME)))?;
        let (node_id, address) = rest
            .split_once('@')
            .ok_or_else(|| invalid("missing '@' between node ID and address".to_string()))?;

        let bytes: [u8; 32] = hex::decode(node_id)
            .map_err(|e| invalid(format!("node ID is not hex ({})", e)))?
            .try_into()
            .map_err(|v: Vec<u8>| invalid(format!("node ID is {} bytes, expected 32", v.len())))?;

        let address = address
            .parse::<SocketAddr>()
            .map_err(|e| invalid(format!("bad address '{}' ({})", address, e)))?;

        Ok(Self {
            node_id: Hash::new(bytes),
            address,
        })
    }
}

impl fmt::Display for TosNodeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}@{}", TOSNODE_URL_SCHEME, self.node_id.to_hex(), self.address)
    }
}

impl FromStr for TosNodeUrl {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_id() -> NodeId {
        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(7);
        }
        Hash::new(bytes)
    }

    #[test]
    fn test_parse_and_display() {
        let text = format!("tosnode://{}@192.168.1.1:2126", node_id().to_hex());
        let url: TosNodeUrl = text.parse().unwrap();
        assert_eq!(url.node_id, node_id());
        assert_eq!(url.address, "192.168.1.1:2126".parse().unwrap());
        assert_eq!(url.to_string(), text);
    }

    #[test]
    fn test_parse_ipv6() {
        let url = TosNodeUrl::parse(&format!("tosnode://{}@[::1]:30301", node_id().to_hex())).unwrap();
        assert_eq!(url.address, "[::1]:30301".parse().unwrap());
    }

    #[test]
    fn test_rejects_malformed() {
        let hex = node_id().to_hex();
        for value in [
            format!("enode://{}@127.0.0.1:2126", hex),
            format!("tosnode://{}127.0.0.1:2126", hex),
            format!("tosnode://{}@127.0.0.1:2126", &hex[..62]),
            format!("tosnode://{}zz@127.0.0.1:2126", &hex[..62]),
            format!("tosnode://{}@127.0.0.1", hex),
            format!("tosnode://{}@host:2126", hex),
        ] {
            assert!(
                matches!(TosNodeUrl::parse(&value), Err(DiscoveryError::InvalidUrl(_))),
                "{} should be rejected",
                value
            );
        }
    }
}

//! Legacy discovery engine.
//!
//! Only PING/PONG/FINDNODE/NEIGHBORS are understood. The engine serves a UDP
//! socket and, optionally, a path-aware socket under the same identity.

use std::net::SocketAddr;
use std::sync::Arc;

use log::debug;
use tos_bootnode_common::tokio::net::UdpSocket;

use super::error::DiscoveryResult;
use super::identity::NodeIdentity;
use super::routing_table::DEFAULT_BUCKET_SIZE;
use super::server::{DiscoveryServer, EngineSettings};
use super::transport::PacketTransport;
use super::url::TosNodeUrl;
use crate::bootstrap::Netlist;
use crate::scion::PathAwareSocket;

/// Startup configuration of the legacy engine.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub identity: Arc<NodeIdentity>,
    pub announce_addr: SocketAddr,
    /// String form of the path-aware address, empty when there is none.
    pub alternate_announce_addr: String,
    pub netrestrict: Option<Arc<Netlist>>,
    pub bootnodes: Vec<TosNodeUrl>,
    pub bucket_size: usize,
}

impl DiscoveryConfig {
    pub fn new(identity: Arc<NodeIdentity>, announce_addr: SocketAddr) -> Self {
        Self {
            identity,
            announce_addr,
            alternate_announce_addr: String::new(),
            netrestrict: None,
            bootnodes: Vec::new(),
            bucket_size: DEFAULT_BUCKET_SIZE,
        }
    }

    fn into_settings(self) -> (Arc<NodeIdentity>, EngineSettings) {
        let alternate_announce =
            Some(self.alternate_announce_addr).filter(|addr| !addr.is_empty());
        let settings = EngineSettings {
            announce_addr: self.announce_addr,
            alternate_announce,
            netrestrict: self.netrestrict,
            bootnodes: self.bootnodes,
            bucket_size: self.bucket_size,
            network_id: String::new(),
            topics_enabled: false,
        };
        (self.identity, settings)
    }
}

async fn start(
    config: DiscoveryConfig,
    transports: Vec<Arc<dyn PacketTransport>>,
) -> DiscoveryResult<Arc<DiscoveryServer>> {
    for transport in &transports {
        let local = transport.local_address()?;
        if log::log_enabled!(log::Level::Debug) {
            debug!("Legacy engine listening on {} ({})", local, transport.kind());
        }
    }

    let (identity, settings) = config.into_settings();
    let server = DiscoveryServer::new(identity, transports, settings)?;
    server.start().await;
    Ok(server)
}

/// Start the legacy engine on a UDP socket.
pub async fn listen_udp(
    socket: Arc<UdpSocket>,
    config: DiscoveryConfig,
) -> DiscoveryResult<Arc<DiscoveryServer>> {
    let transports: Vec<Arc<dyn PacketTransport>> = vec![socket];
    start(config, transports).await
}

/// Start the legacy engine on a UDP socket and a path-aware socket.
pub async fn listen_udp_with_path_aware(
    socket: Arc<UdpSocket>,
    path_socket: Arc<PathAwareSocket>,
    config: DiscoveryConfig,
) -> DiscoveryResult<Arc<DiscoveryServer>> {
    let transports: Vec<Arc<dyn PacketTransport>> = vec![socket, path_socket];
    start(config, transports).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::transport::{PeerAddress, TransportKind};
    use crate::scion::{testing::FakeControlPlane, IsdAs, ScionStack};

    #[tokio::test]
    async fn test_listen_udp_only() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let server = listen_udp(socket, DiscoveryConfig::new(Arc::new(NodeIdentity::generate()), addr))
            .await
            .unwrap();

        assert!(!server.topics_enabled());
        assert_eq!(server.transport_kinds(), vec![TransportKind::Udp]);
        assert!(server.local_node_info().alternate_address.is_none());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_listen_with_path_aware_socket() {
        let ia: IsdAs = "1-ff00:0:110".parse().unwrap();
        let plane = FakeControlPlane::start(ia).await;
        let stack = ScionStack::new();
        stack
            .init(ia, &plane.daemon_socket(), &plane.paths.dispatcher_socket)
            .await
            .unwrap();
        let path_socket = Arc::new(
            stack
                .bind(&"1-ff00:0:110,[127.0.0.1]:40000".parse().unwrap())
                .await
                .unwrap(),
        );
        let path_addr = path_socket.local_addr().clone();

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let mut config = DiscoveryConfig::new(Arc::new(NodeIdentity::generate()), addr);
        config.alternate_announce_addr = path_addr.to_string();

        let server = listen_udp_with_path_aware(socket, path_socket, config)
            .await
            .unwrap();

        assert_eq!(
            server.transport_kinds(),
            vec![TransportKind::Udp, TransportKind::PathAware]
        );
        assert_eq!(
            server.local_node_info().alternate_address.as_deref(),
            Some("1-ff00:0:110,[127.0.0.1]:40000")
        );
        assert!(matches!(
            server.local_address(TransportKind::PathAware),
            Some(Ok(PeerAddress::PathAware(ref a))) if a == &path_addr
        ));

        // A peer on the same AS reaches the engine over the dispatcher
        let peer_socket = Arc::new(
            stack
                .bind(&"1-ff00:0:110,[127.0.0.1]:40001".parse().unwrap())
                .await
                .unwrap(),
        );
        let peer_addr = "127.0.0.1:45100".parse().unwrap();
        let peer = DiscoveryServer::new(
            Arc::new(NodeIdentity::generate()),
            vec![peer_socket as Arc<dyn PacketTransport>],
            DiscoveryConfig::new(Arc::new(NodeIdentity::generate()), peer_addr)
                .into_settings()
                .1,
        )
        .unwrap();
        peer.start().await;
        peer.ping_node(server.identity().node_id(), PeerAddress::PathAware(path_addr))
            .await
            .unwrap();

        let mut known = false;
        for _ in 0..100 {
            if server.routing_table().contains(peer.identity().node_id()).await {
                known = true;
                break;
            }
            tos_bootnode_common::tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert!(known);

        server.stop().await;
        peer.stop().await;
    }
}

//! Topic discovery engine.
//!
//! Speaks the full message set, including topic registration and queries,
//! over a single UDP socket. Signatures are bound to the network ID.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use tos_bootnode_common::tokio::net::UdpSocket;

use super::error::{DiscoveryError, DiscoveryResult};
use super::identity::NodeIdentity;
use super::messages::NodeInfo;
use super::routing_table::DEFAULT_BUCKET_SIZE;
use super::server::{DiscoveryServer, EngineSettings};
use super::transport::PacketTransport;
use super::url::TosNodeUrl;
use crate::bootstrap::Netlist;

/// How long a registration stays valid.
pub const REGISTRATION_TTL: Duration = Duration::from_secs(15 * 60);

/// Registrations kept per topic; the oldest is evicted first.
pub const MAX_REGISTRATIONS_PER_TOPIC: usize = 64;

pub const MAX_TOPICS: usize = 1024;

#[derive(Debug, Clone)]
struct Registration {
    node: NodeInfo,
    registered_at: Instant,
}

impl Registration {
    fn is_expired(&self) -> bool {
        self.registered_at.elapsed() >= REGISTRATION_TTL
    }
}

/// Nodes registered under each topic, oldest first.
#[derive(Debug, Default)]
pub struct TopicTable {
    topics: HashMap<String, VecDeque<Registration>>,
}

impl TopicTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh `node` under `topic`.
    pub fn register(&mut self, topic: &str, node: NodeInfo) -> DiscoveryResult<()> {
        if topic.is_empty() {
            return Err(DiscoveryError::InvalidTopic("empty topic".to_string()));
        }
        if !self.topics.contains_key(topic) && self.topics.len() >= MAX_TOPICS {
            return Err(DiscoveryError::TopicLimit(MAX_TOPICS));
        }

        let registrations = self.topics.entry(topic.to_string()).or_default();
        registrations.retain(|r| r.node.node_id != node.node_id);
        registrations.push_back(Registration {
            node,
            registered_at: Instant::now(),
        });
        while registrations.len() > MAX_REGISTRATIONS_PER_TOPIC {
            registrations.pop_front();
        }
        Ok(())
    }

    /// Up to `limit` live registrations, most recent first.
    pub fn query(&self, topic: &str, limit: usize) -> Vec<NodeInfo> {
        self.topics
            .get(topic)
            .map(|registrations| {
                registrations
                    .iter()
                    .rev()
                    .filter(|r| !r.is_expired())
                    .take(limit)
                    .map(|r| r.node.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop expired registrations and topics left empty.
    pub fn purge(&mut self) {
        for registrations in self.topics.values_mut() {
            registrations.retain(|r| !r.is_expired());
        }
        self.topics.retain(|_, registrations| !registrations.is_empty());
    }

    /// Number of topics with at least one registration.
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

/// Startup configuration of the topic engine.
#[derive(Debug, Clone)]
pub struct TopicConfig {
    pub identity: Arc<NodeIdentity>,
    pub announce_addr: SocketAddr,
    /// Signing domain; the bootnode uses an empty one.
    pub network_id: String,
    pub netrestrict: Option<Arc<Netlist>>,
    pub bootnodes: Vec<TosNodeUrl>,
    pub bucket_size: usize,
}

impl TopicConfig {
    pub fn new(identity: Arc<NodeIdentity>, announce_addr: SocketAddr) -> Self {
        Self {
            identity,
            announce_addr,
            network_id: String::new(),
            netrestrict: None,
            bootnodes: Vec::new(),
            bucket_size: DEFAULT_BUCKET_SIZE,
        }
    }
}

/// Start the topic engine on `socket`.
pub async fn listen_udp(
    socket: Arc<UdpSocket>,
    config: TopicConfig,
) -> DiscoveryResult<Arc<DiscoveryServer>> {
    let local = socket.local_addr()?;
    if log::log_enabled!(log::Level::Debug) {
        debug!("Starting topic engine on {} (network id '{}')", local, config.network_id);
    }

    let settings = EngineSettings {
        announce_addr: config.announce_addr,
        alternate_announce: None,
        netrestrict: config.netrestrict,
        bootnodes: config.bootnodes,
        bucket_size: config.bucket_size,
        network_id: config.network_id,
        topics_enabled: true,
    };
    let transports: Vec<Arc<dyn PacketTransport>> = vec![socket];
    let server = DiscoveryServer::new(config.identity, transports, settings)?;
    server.start().await;
    Ok(server)
}

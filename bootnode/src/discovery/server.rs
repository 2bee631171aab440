//! Discovery engine core shared by the legacy and topic front-ends.
//!
//! The server handles:
//! - PING/PONG for liveness checks and endpoint validation
//! - FINDNODE/NEIGHBORS for peer discovery
//! - REGTOPIC/TOPICQUERY/TOPICNODES when topics are enabled
//! - periodic pings of the configured bootnodes

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use tos_bootnode_common::{
    crypto::Hash,
    tokio::{
        select, spawn_task,
        sync::{Mutex, RwLock, Semaphore},
        time::{interval_at, sleep, Instant as TokioInstant},
        JoinHandle,
    },
};

use super::error::{DiscoveryError, DiscoveryResult};
use super::identity::{NodeId, NodeIdentity};
use super::messages::{
    message_type, FindNode, Message, Neighbors, NodeInfo, Ping, Pong, RegTopic, SignedPacket, TopicNodes,
    TopicQuery, MAX_NEIGHBORS, MAX_PACKET_SIZE,
};
use super::routing_table::{InsertResult, RoutingTable, ALPHA};
use super::topic::TopicTable;
use super::transport::{PacketTransport, PeerAddress, TransportKind};
use super::url::TosNodeUrl;
use crate::bootstrap::Netlist;

/// Interval between pings of the configured bootnodes.
const BOOTSTRAP_INTERVAL: Duration = Duration::from_secs(60);

/// Interval between random lookups.
const REFRESH_INTERVAL: Duration = Duration::from_secs(300);

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_PENDING_PINGS: usize = 256;

const MAX_PENDING_FINDNODES: usize = 256;

const MAX_PENDING_TOPIC_QUERIES: usize = 256;

/// Maximum concurrent packet handlers.
const MAX_CONCURRENT_HANDLERS: usize = 64;

/// How long a PING/PONG round trip keeps an endpoint validated.
const ENDPOINT_VALIDATION_DURATION: Duration = Duration::from_secs(300);

const MAX_VALIDATED_ENDPOINTS: usize = 1024;

const MAX_PROCESSED_PONGS: usize = 512;

/// Rounds of an iterative lookup.
const LOOKUP_ROUNDS: usize = 3;

const LOOKUP_ROUND_WAIT: Duration = Duration::from_millis(500);

struct PendingPing {
    node_id: NodeId,
    address: PeerAddress,
    sent: Instant,
}

/// A reply may span several packets; it is complete once a full bucket
/// of nodes arrived or the request timed out.
struct PendingRequest {
    address: PeerAddress,
    sent: Instant,
    received: usize,
}

impl PendingRequest {
    fn new(address: PeerAddress) -> Self {
        Self {
            address,
            sent: Instant::now(),
            received: 0,
        }
    }
}

/// Account for one reply packet of a pending request. Returns how many nodes
/// had already arrived, or `None` when nothing is pending.
fn take_reply<K>(pending: &mut HashMap<K, PendingRequest>, key: &K, nodes: usize) -> Option<usize>
where
    K: std::hash::Hash + Eq,
{
    let request = pending.get_mut(key)?;
    if request.sent.elapsed() > RESPONSE_TIMEOUT {
        pending.remove(key);
        return None;
    }
    let before = request.received;
    request.received += nodes;
    if request.received >= MAX_NEIGHBORS {
        pending.remove(key);
    }
    Some(before)
}

struct ValidatedEndpoint {
    node_id: NodeId,
    validated_at: Instant,
}

/// Runtime settings of a discovery server.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// UDP address advertised to peers.
    pub announce_addr: SocketAddr,
    /// Path-aware address advertised alongside the UDP one.
    pub alternate_announce: Option<String>,
    pub netrestrict: Option<Arc<Netlist>>,
    pub bootnodes: Vec<TosNodeUrl>,
    pub bucket_size: usize,
    /// Signing domain of the topic engine.
    pub network_id: String,
    pub topics_enabled: bool,
}

pub struct DiscoveryServer {
    identity: Arc<NodeIdentity>,
    transports: Vec<Arc<dyn PacketTransport>>,
    routing_table: Arc<RoutingTable>,
    settings: EngineSettings,
    /// Prefix mixed into every signature.
    domain: Vec<u8>,
    running: AtomicBool,
    seq_counter: AtomicU64,
    handler_semaphore: Arc<Semaphore>,
    pending_pings: RwLock<HashMap<Hash, PendingPing>>,
    /// Only validated endpoints get answers that are larger than the request.
    validated_endpoints: RwLock<HashMap<PeerAddress, ValidatedEndpoint>>,
    /// Keyed by the node we sent FINDNODE to.
    pending_findnodes: RwLock<HashMap<NodeId, PendingRequest>>,
    pending_topic_queries: RwLock<HashMap<(NodeId, String), PendingRequest>>,
    processed_pongs: RwLock<HashMap<Hash, Instant>>,
    topics: Option<RwLock<TopicTable>>,
    topic_results: RwLock<HashMap<String, Vec<NodeInfo>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryServer {
    pub fn new(
        identity: Arc<NodeIdentity>,
        transports: Vec<Arc<dyn PacketTransport>>,
        settings: EngineSettings,
    ) -> DiscoveryResult<Arc<Self>> {
        if transports.is_empty() {
            return Err(DiscoveryError::ConfigError(
                "at least one transport is required".to_string(),
            ));
        }
        if settings.bucket_size == 0 {
            return Err(DiscoveryError::ConfigError(
                "bucket size must be greater than zero".to_string(),
            ));
        }
        let mut kinds = HashSet::new();
        for transport in &transports {
            if !kinds.insert(transport.kind()) {
                return Err(DiscoveryError::ConfigError(format!(
                    "more than one {} transport",
                    transport.kind()
                )));
            }
        }

        let domain = if settings.topics_enabled {
            settings.network_id.as_bytes().to_vec()
        } else {
            Vec::new()
        };
        let routing_table = Arc::new(RoutingTable::new(
            identity.node_id().clone(),
            settings.bucket_size,
        ));
        let topics = settings
            .topics_enabled
            .then(|| RwLock::new(TopicTable::new()));

        Ok(Arc::new(Self {
            identity,
            transports,
            routing_table,
            settings,
            domain,
            running: AtomicBool::new(false),
            seq_counter: AtomicU64::new(0),
            handler_semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_HANDLERS)),
            pending_pings: RwLock::new(HashMap::new()),
            validated_endpoints: RwLock::new(HashMap::new()),
            pending_findnodes: RwLock::new(HashMap::new()),
            pending_topic_queries: RwLock::new(HashMap::new()),
            processed_pongs: RwLock::new(HashMap::new()),
            topics,
            topic_results: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.routing_table
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn topics_enabled(&self) -> bool {
        self.topics.is_some()
    }

    pub fn transport_kinds(&self) -> Vec<TransportKind> {
        self.transports.iter().map(|t| t.kind()).collect()
    }

    /// Local address of the transport of the given kind.
    pub fn local_address(&self, kind: TransportKind) -> Option<io::Result<PeerAddress>> {
        self.transport(kind).map(|t| t.local_address())
    }

    /// URL other nodes can use to reach this one.
    pub fn node_url(&self) -> TosNodeUrl {
        TosNodeUrl::new(self.identity.node_id().clone(), self.settings.announce_addr)
    }

    /// Our own record, as advertised to peers.
    pub fn local_node_info(&self) -> NodeInfo {
        NodeInfo::new(
            self.identity.node_id().clone(),
            self.settings.announce_addr,
            self.identity.public_key(),
        )
        .with_alternate_address(self.settings.alternate_announce.clone())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn one receive loop per transport plus the maintenance loop.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            if log::log_enabled!(log::Level::Warn) {
                warn!("Discovery server already running");
            }
            return;
        }

        if log::log_enabled!(log::Level::Info) {
            info!(
                "Starting discovery server {} on {:?} (topics: {})",
                self.node_url(),
                self.transport_kinds(),
                self.topics_enabled()
            );
        }

        self.ping_bootnodes().await;

        let mut tasks = self.tasks.lock().await;
        for transport in &self.transports {
            let server = Arc::clone(self);
            let transport = Arc::clone(transport);
            tasks.push(spawn_task(
                format!("discovery-receive-{}", transport.kind()),
                async move { server.receive_loop(transport).await },
            ));
        }

        let server = Arc::clone(self);
        tasks.push(spawn_task("discovery-maintenance", async move {
            server.maintenance_loop().await
        }));
    }

    /// Stop every loop of the server. In-flight handlers run to completion.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if log::log_enabled!(log::Level::Info) {
            info!("Discovery server stopped");
        }
    }

    fn transport(&self, kind: TransportKind) -> Option<&Arc<dyn PacketTransport>> {
        self.transports.iter().find(|t| t.kind() == kind)
    }

    fn is_allowed(&self, ip: IpAddr) -> bool {
        self.settings
            .netrestrict
            .as_ref()
            .map_or(true, |netlist| netlist.contains(ip))
    }

    /// Address a node can be reached at over one of our transports.
    fn peer_address_for(&self, node: &NodeInfo) -> Option<PeerAddress> {
        if self.transport(TransportKind::Udp).is_some() && node.address.port() != 0 {
            return Some(PeerAddress::Udp(node.address));
        }
        if self.transport(TransportKind::PathAware).is_some() {
            return node
                .alternate_address
                .as_deref()
                .and_then(|addr| addr.parse().ok())
                .map(PeerAddress::PathAware);
        }
        None
    }

    /// The sender's record with the address its packet actually came from.
    fn sender_record(source: &NodeInfo, from: &PeerAddress) -> NodeInfo {
        match from {
            PeerAddress::Udp(addr) => NodeInfo {
                address: *addr,
                ..source.clone()
            },
            PeerAddress::PathAware(addr) => source
                .clone()
                .with_alternate_address(Some(addr.to_string())),
        }
    }

    async fn ping_bootnodes(&self) {
        for url in &self.settings.bootnodes {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Pinging bootnode {}", url);
            }
            if let Err(e) = self.ping_node(&url.node_id, PeerAddress::Udp(url.address)).await {
                if log::log_enabled!(log::Level::Warn) {
                    warn!("Failed to ping bootnode {}: {}", url, e);
                }
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, transport: Arc<dyn PacketTransport>) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        while self.is_running() {
            let (len, from) = match transport.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    if log::log_enabled!(log::Level::Error) {
                        error!("{} transport closed, stopping its receive loop", transport.kind());
                    }
                    break;
                }
                Err(e) => {
                    if log::log_enabled!(log::Level::Debug) {
                        debug!("Error receiving on {} transport: {}", transport.kind(), e);
                    }
                    continue;
                }
            };

            if log::log_enabled!(log::Level::Trace) {
                trace!("Received {} bytes from {}", len, from);
            }

            let Ok(permit) = self.handler_semaphore.clone().try_acquire_owned() else {
                if log::log_enabled!(log::Level::Debug) {
                    debug!(
                        "Dropping packet from {} (at handler capacity {})",
                        from, MAX_CONCURRENT_HANDLERS
                    );
                }
                continue;
            };

            let data = buf[..len].to_vec();
            let server = Arc::clone(&self);
            spawn_task("discovery-handle", async move {
                let _permit = permit;
                if let Err(e) = server.handle_packet(&data, from.clone()).await {
                    if log::log_enabled!(log::Level::Debug) {
                        debug!("Error handling packet from {}: {}", from, e);
                    }
                }
            });
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let now = TokioInstant::now();
        let mut refresh_timer = interval_at(now + REFRESH_INTERVAL, REFRESH_INTERVAL);
        let mut bootstrap_timer = interval_at(now + BOOTSTRAP_INTERVAL, BOOTSTRAP_INTERVAL);
        let mut cleanup_timer = interval_at(now + CLEANUP_INTERVAL, CLEANUP_INTERVAL);

        while self.is_running() {
            select! {
                _ = refresh_timer.tick() => self.refresh().await,
                _ = bootstrap_timer.tick() => self.ping_bootnodes().await,
                _ = cleanup_timer.tick() => self.cleanup().await,
            }
        }
    }

    async fn handle_packet(&self, data: &[u8], from: PeerAddress) -> DiscoveryResult<()> {
        if !self.is_allowed(from.ip()) {
            return Err(DiscoveryError::Restricted(from.to_string()));
        }

        let packet = SignedPacket::decode(data)?;
        if !packet.message.is_expiration_valid() {
            return Err(DiscoveryError::MessageExpired(packet.message.expiration()));
        }
        if packet.message.is_topic_message() && self.topics.is_none() {
            return Err(DiscoveryError::UnsupportedMessage(packet.message.message_type()));
        }

        packet.verify(&self.domain)?;
        let source = packet.message.source();
        if !source.verify_node_id() {
            return Err(DiscoveryError::InvalidNodeId(source.node_id.to_hex()));
        }
        if source.node_id == *self.identity.node_id() {
            return Ok(());
        }

        match &packet.message {
            Message::Ping(ping) => self.handle_ping(&packet, ping, from).await,
            Message::Pong(pong) => self.handle_pong(pong, from).await,
            Message::FindNode(find_node) => self.handle_find_node(find_node, from).await,
            Message::Neighbors(neighbors) => self.handle_neighbors(neighbors, from).await,
            Message::RegTopic(reg) => self.handle_reg_topic(reg, from).await,
            Message::TopicQuery(query) => self.handle_topic_query(query, from).await,
            Message::TopicNodes(nodes) => self.handle_topic_nodes(nodes, from).await,
        }
    }

    async fn handle_ping(&self, packet: &SignedPacket, ping: &Ping, from: PeerAddress) -> DiscoveryResult<()> {
        if log::log_enabled!(log::Level::Debug) {
            debug!("Received PING from {} (node_id: {})", from, ping.source.node_id);
        }

        self.add_node(Self::sender_record(&ping.source, &from)).await;

        let pong = Pong::new(packet.hash(), self.local_node_info());
        self.send_message(Message::Pong(pong), &from).await?;

        // Bond in the other direction so the sender may query us afterwards
        if !self.is_validated(&from, &ping.source.node_id).await && !self.has_pending_ping(&from).await {
            self.ping_node(&ping.source.node_id, from).await?;
        }
        Ok(())
    }

    async fn handle_pong(&self, pong: &Pong, from: PeerAddress) -> DiscoveryResult<()> {
        if log::log_enabled!(log::Level::Debug) {
            debug!("Received PONG from {} (node_id: {})", from, pong.source.node_id);
        }

        if self.processed_pongs.read().await.contains_key(&pong.ping_hash) {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Ignoring replayed PONG from {}", from);
            }
            return Ok(());
        }

        // A PONG from the wrong node or address leaves the PING pending
        {
            let mut pending = self.pending_pings.write().await;
            let Some(expected) = pending.get(&pong.ping_hash) else {
                return Err(DiscoveryError::UnsolicitedResponse("PONG", from.to_string()));
            };
            if expected.node_id != pong.source.node_id || expected.address != from {
                if log::log_enabled!(log::Level::Warn) {
                    warn!(
                        "PONG from {} ({}) does not match the PING sent to {} ({})",
                        from, pong.source.node_id, expected.address, expected.node_id
                    );
                }
                return Err(DiscoveryError::UnsolicitedResponse("PONG", from.to_string()));
            }
            pending.remove(&pong.ping_hash);
        }

        {
            let mut processed = self.processed_pongs.write().await;
            if processed.len() >= MAX_PROCESSED_PONGS {
                processed.retain(|_, seen| seen.elapsed() <= RESPONSE_TIMEOUT);
            }
            if processed.len() < MAX_PROCESSED_PONGS {
                processed.insert(pong.ping_hash.clone(), Instant::now());
            }
        }

        {
            let mut validated = self.validated_endpoints.write().await;
            if validated.len() >= MAX_VALIDATED_ENDPOINTS {
                validated.retain(|_, v| v.validated_at.elapsed() < ENDPOINT_VALIDATION_DURATION);
            }
            if validated.len() < MAX_VALIDATED_ENDPOINTS {
                if log::log_enabled!(log::Level::Trace) {
                    trace!("Validated endpoint {} ({})", from, pong.source.node_id);
                }
                validated.insert(
                    from.clone(),
                    ValidatedEndpoint {
                        node_id: pong.source.node_id.clone(),
                        validated_at: Instant::now(),
                    },
                );
            }
        }

        self.add_node(Self::sender_record(&pong.source, &from)).await;
        self.routing_table.touch(&pong.source.node_id).await;
        Ok(())
    }

    async fn handle_find_node(&self, find_node: &FindNode, from: PeerAddress) -> DiscoveryResult<()> {
        if log::log_enabled!(log::Level::Debug) {
            debug!("Received FINDNODE from {} (target: {})", from, find_node.target);
        }

        self.require_validated(&from, &find_node.source.node_id).await?;
        self.add_node(Self::sender_record(&find_node.source, &from)).await;

        let requester = &find_node.source.node_id;
        let nodes = self
            .routing_table
            .closest(&find_node.target, MAX_NEIGHBORS, |n| {
                &n.node_id != requester && self.is_allowed(n.address.ip())
            })
            .await;

        for neighbors in Neighbors::split(self.local_node_info(), nodes) {
            self.send_message(Message::Neighbors(neighbors), &from).await?;
        }
        Ok(())
    }

    async fn handle_neighbors(&self, neighbors: &Neighbors, from: PeerAddress) -> DiscoveryResult<()> {
        if log::log_enabled!(log::Level::Debug) {
            debug!("Received NEIGHBORS from {} ({} nodes)", from, neighbors.nodes.len());
        }

        {
            let mut pending = self.pending_findnodes.write().await;
            if let Some(request) = pending.get(&neighbors.source.node_id) {
                if request.address != from && log::log_enabled!(log::Level::Debug) {
                    debug!("NEIGHBORS expected from {}, got it from {}", request.address, from);
                }
            }
            if take_reply(&mut pending, &neighbors.source.node_id, neighbors.nodes.len()).is_none() {
                return Err(DiscoveryError::UnsolicitedResponse("NEIGHBORS", from.to_string()));
            }
        }

        self.add_node(Self::sender_record(&neighbors.source, &from)).await;

        for node in &neighbors.nodes {
            if node.node_id == *self.identity.node_id() || !node.verify_node_id() {
                continue;
            }
            if !self.is_allowed(node.address.ip()) {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Skipping neighbor {} outside of the netlist", node.address);
                }
                continue;
            }
            if self.routing_table.contains(&node.node_id).await {
                continue;
            }

            match self.routing_table.insert(node.clone()).await {
                InsertResult::Inserted => {
                    let sent = match self.peer_address_for(node) {
                        Some(address) => self.ping_node(&node.node_id, address).await,
                        None => Err(DiscoveryError::NoTransport(node.address.to_string())),
                    };
                    if let Err(e) = sent {
                        if log::log_enabled!(log::Level::Debug) {
                            debug!("Failed to ping new node {}: {}", node.address, e);
                        }
                        self.routing_table.remove(&node.node_id).await;
                    }
                }
                InsertResult::BucketFull(oldest) => self.contest_bucket(oldest, node.clone()).await,
                InsertResult::Updated | InsertResult::SelfInsert => {}
            }
        }
        Ok(())
    }

    async fn handle_reg_topic(&self, reg: &RegTopic, from: PeerAddress) -> DiscoveryResult<()> {
        if log::log_enabled!(log::Level::Debug) {
            debug!("Received REGTOPIC '{}' from {}", reg.topic, from);
        }

        self.require_validated(&from, &reg.source.node_id).await?;
        let Some(topics) = &self.topics else {
            return Err(DiscoveryError::UnsupportedMessage(message_type::REGTOPIC));
        };
        topics
            .write()
            .await
            .register(&reg.topic, Self::sender_record(&reg.source, &from))
    }

    async fn handle_topic_query(&self, query: &TopicQuery, from: PeerAddress) -> DiscoveryResult<()> {
        if log::log_enabled!(log::Level::Debug) {
            debug!("Received TOPICQUERY '{}' from {}", query.topic, from);
        }

        self.require_validated(&from, &query.source.node_id).await?;
        let nodes: Vec<NodeInfo> = match &self.topics {
            Some(topics) => topics
                .read()
                .await
                .query(&query.topic, MAX_NEIGHBORS)
                .into_iter()
                .filter(|n| n.node_id != query.source.node_id && self.is_allowed(n.address.ip()))
                .collect(),
            None => Vec::new(),
        };

        for reply in TopicNodes::split(self.local_node_info(), query.topic.clone(), nodes) {
            self.send_message(Message::TopicNodes(reply), &from).await?;
        }
        Ok(())
    }

    async fn handle_topic_nodes(&self, reply: &TopicNodes, from: PeerAddress) -> DiscoveryResult<()> {
        if log::log_enabled!(log::Level::Debug) {
            debug!(
                "Received TOPICNODES '{}' from {} ({} nodes)",
                reply.topic,
                from,
                reply.nodes.len()
            );
        }

        let key = (reply.source.node_id.clone(), reply.topic.clone());
        let Some(before) = take_reply(&mut *self.pending_topic_queries.write().await, &key, reply.nodes.len()) else {
            return Err(DiscoveryError::UnsolicitedResponse("TOPICNODES", from.to_string()));
        };

        let nodes: Vec<NodeInfo> = reply
            .nodes
            .iter()
            .filter(|n| n.verify_node_id() && self.is_allowed(n.address.ip()))
            .cloned()
            .collect();
        let mut results = self.topic_results.write().await;
        if before == 0 {
            results.insert(reply.topic.clone(), nodes);
        } else {
            results.entry(reply.topic.clone()).or_default().extend(nodes);
        }
        Ok(())
    }

    async fn is_validated(&self, from: &PeerAddress, node_id: &NodeId) -> bool {
        self.validated_endpoints
            .read()
            .await
            .get(from)
            .map_or(false, |v| {
                v.validated_at.elapsed() < ENDPOINT_VALIDATION_DURATION && &v.node_id == node_id
            })
    }

    /// Reject a request from an endpoint that has not answered a PING yet,
    /// and start the validation.
    async fn require_validated(&self, from: &PeerAddress, node_id: &NodeId) -> DiscoveryResult<()> {
        if self.is_validated(from, node_id).await {
            return Ok(());
        }
        if !self.has_pending_ping(from).await {
            if let Err(e) = self.ping_node(node_id, from.clone()).await {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Failed to ping unvalidated endpoint {}: {}", from, e);
                }
            }
        }
        Err(DiscoveryError::EndpointNotValidated(from.to_string()))
    }

    async fn has_pending_ping(&self, to: &PeerAddress) -> bool {
        self.pending_pings
            .read()
            .await
            .values()
            .any(|p| &p.address == to && p.sent.elapsed() <= RESPONSE_TIMEOUT)
    }

    async fn add_node(&self, node: NodeInfo) {
        if let InsertResult::BucketFull(oldest) = self.routing_table.insert(node.clone()).await {
            self.contest_bucket(oldest, node).await;
        }
    }

    /// Ping the least recently seen node of a full bucket; it is replaced
    /// by `candidate` right away when it cannot even be pinged, otherwise
    /// when it stops answering.
    async fn contest_bucket(&self, oldest: NodeInfo, candidate: NodeInfo) {
        let pinged = match self.peer_address_for(&oldest) {
            Some(address) => self.ping_node(&oldest.node_id, address).await.is_ok(),
            None => false,
        };
        if !pinged {
            self.routing_table
                .replace_oldest(&oldest.node_id, candidate)
                .await;
        }
    }

    /// Sign and encode a message. Returns the packet bytes and hash.
    fn seal(&self, message: Message) -> DiscoveryResult<(Vec<u8>, Hash)> {
        let packet = SignedPacket::sign(message, &self.identity, &self.domain);
        let data = packet.encode();
        if data.len() > MAX_PACKET_SIZE {
            return Err(DiscoveryError::PacketTooLarge(data.len(), MAX_PACKET_SIZE));
        }
        Ok((data, packet.hash()))
    }

    async fn transmit(&self, data: &[u8], to: &PeerAddress) -> DiscoveryResult<()> {
        let transport = self
            .transport(to.kind())
            .ok_or_else(|| DiscoveryError::NoTransport(to.to_string()))?;
        transport.send_to(data, to).await?;
        if log::log_enabled!(log::Level::Trace) {
            trace!("Sent {} bytes to {}", data.len(), to);
        }
        Ok(())
    }

    async fn send_message(&self, message: Message, to: &PeerAddress) -> DiscoveryResult<()> {
        let (data, _) = self.seal(message)?;
        self.transmit(&data, to).await
    }

    pub async fn ping_node(&self, node_id: &NodeId, to: PeerAddress) -> DiscoveryResult<()> {
        let seq = self.seq_counter.fetch_add(1, Ordering::SeqCst);
        let (data, ping_hash) = self.seal(Message::Ping(Ping::new(self.local_node_info(), seq)))?;

        {
            let mut pending = self.pending_pings.write().await;
            if pending.len() >= MAX_PENDING_PINGS {
                pending.retain(|_, p| p.sent.elapsed() <= RESPONSE_TIMEOUT);
            }
            if pending.len() >= MAX_PENDING_PINGS {
                if log::log_enabled!(log::Level::Warn) {
                    warn!("Pending pings at capacity ({}), dropping ping to {}", MAX_PENDING_PINGS, to);
                }
                return Ok(());
            }
            pending.insert(
                ping_hash,
                PendingPing {
                    node_id: node_id.clone(),
                    address: to.clone(),
                    sent: Instant::now(),
                },
            );
        }

        self.transmit(&data, &to).await
    }

    /// Ask `to` for the nodes it knows closest to `target`.
    pub async fn find_node(&self, target: &NodeId, node_id: &NodeId, to: PeerAddress) -> DiscoveryResult<()> {
        {
            let mut pending = self.pending_findnodes.write().await;
            if pending.len() >= MAX_PENDING_FINDNODES {
                pending.retain(|_, p| p.sent.elapsed() <= RESPONSE_TIMEOUT);
            }
            if pending.len() < MAX_PENDING_FINDNODES {
                pending.insert(
                    node_id.clone(),
                    PendingRequest::new(to.clone()),
                );
            }
        }

        let find_node = FindNode::new(self.local_node_info(), target.clone());
        self.send_message(Message::FindNode(find_node), &to).await
    }

    /// Iterative lookup of the nodes closest to `target`.
    pub async fn lookup(&self, target: &NodeId) -> Vec<NodeInfo> {
        let mut seen = HashSet::new();
        let mut closest = self.routing_table.closest(target, ALPHA, |_| true).await;

        for _ in 0..LOOKUP_ROUNDS {
            for node in &closest {
                if !seen.insert(node.node_id.clone()) {
                    continue;
                }
                let Some(address) = self.peer_address_for(node) else {
                    continue;
                };
                if let Err(e) = self.find_node(target, &node.node_id, address).await {
                    if log::log_enabled!(log::Level::Debug) {
                        debug!("FINDNODE to {} failed: {}", node.address, e);
                    }
                }
            }

            sleep(LOOKUP_ROUND_WAIT).await;

            let next = self.routing_table.closest(target, MAX_NEIGHBORS, |_| true).await;
            if next.is_empty() {
                break;
            }
            closest = next;
        }
        closest
    }

    /// Register this node under `topic` at the registrar `to`.
    pub async fn register_topic(&self, topic: &str, to: PeerAddress) -> DiscoveryResult<()> {
        self.require_topics()?;
        let reg = RegTopic::new(self.local_node_info(), topic.to_string());
        self.send_message(Message::RegTopic(reg), &to).await
    }

    /// Ask the registrar `node_id` at `to` for the nodes registered under
    /// `topic`. The answer shows up in [`Self::topic_results`].
    pub async fn query_topic(&self, topic: &str, node_id: &NodeId, to: PeerAddress) -> DiscoveryResult<()> {
        self.require_topics()?;
        {
            let mut pending = self.pending_topic_queries.write().await;
            if pending.len() >= MAX_PENDING_TOPIC_QUERIES {
                pending.retain(|_, p| p.sent.elapsed() <= RESPONSE_TIMEOUT);
            }
            if pending.len() < MAX_PENDING_TOPIC_QUERIES {
                pending.insert(
                    (node_id.clone(), topic.to_string()),
                    PendingRequest::new(to.clone()),
                );
            }
        }

        let query = TopicQuery::new(self.local_node_info(), topic.to_string());
        self.send_message(Message::TopicQuery(query), &to).await
    }

    /// Nodes registered here under `topic`.
    pub async fn topic_registrations(&self, topic: &str) -> Vec<NodeInfo> {
        match &self.topics {
            Some(topics) => topics.read().await.query(topic, usize::MAX),
            None => Vec::new(),
        }
    }

    /// Latest answer to [`Self::query_topic`] for `topic`.
    pub async fn topic_results(&self, topic: &str) -> Vec<NodeInfo> {
        self.topic_results
            .read()
            .await
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    fn require_topics(&self) -> DiscoveryResult<()> {
        if self.topics.is_none() {
            return Err(DiscoveryError::ConfigError(
                "topics are not enabled on this engine".to_string(),
            ));
        }
        Ok(())
    }

    async fn refresh(&self) {
        if log::log_enabled!(log::Level::Debug) {
            debug!("Refreshing routing table with a random lookup");
        }
        let target = Hash::new(rand::random());
        self.lookup(&target).await;
    }

    async fn cleanup(&self) {
        let expired: Vec<NodeId> = {
            let mut pending = self.pending_pings.write().await;
            let keys: Vec<Hash> = pending
                .iter()
                .filter(|(_, p)| p.sent.elapsed() > RESPONSE_TIMEOUT)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| pending.remove(&k).map(|p| p.node_id))
                .collect()
        };
        for node_id in expired {
            if self.routing_table.record_failure(&node_id).await && log::log_enabled!(log::Level::Debug) {
                debug!("Removed unresponsive node {}", node_id);
            }
        }

        self.pending_findnodes
            .write()
            .await
            .retain(|_, p| p.sent.elapsed() <= RESPONSE_TIMEOUT);
        self.pending_topic_queries
            .write()
            .await
            .retain(|_, p| p.sent.elapsed() <= RESPONSE_TIMEOUT);
        self.processed_pongs
            .write()
            .await
            .retain(|_, seen| seen.elapsed() <= RESPONSE_TIMEOUT);
        self.validated_endpoints
            .write()
            .await
            .retain(|_, v| v.validated_at.elapsed() < ENDPOINT_VALIDATION_DURATION);

        if let Some(topics) = &self.topics {
            topics.write().await.purge();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use tos_bootnode_common::tokio::net::UdpSocket;

    fn settings(addr: SocketAddr, topics_enabled: bool) -> EngineSettings {
        EngineSettings {
            announce_addr: addr,
            alternate_announce: None,
            netrestrict: None,
            bootnodes: Vec::new(),
            bucket_size: 16,
            network_id: String::new(),
            topics_enabled,
        }
    }

    async fn spawn_server(topics_enabled: bool) -> Arc<DiscoveryServer> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let server = DiscoveryServer::new(
            Arc::new(NodeIdentity::generate()),
            vec![socket as Arc<dyn PacketTransport>],
            settings(addr, topics_enabled),
        )
        .unwrap();
        server.start().await;
        server
    }

    fn peer(server: &DiscoveryServer) -> PeerAddress {
        PeerAddress::Udp(server.settings().announce_addr)
    }

    async fn wait_for<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return true;
            }
            sleep(Duration::from_millis(50)).await;
        }
        false
    }

    async fn bond(a: &Arc<DiscoveryServer>, b: &Arc<DiscoveryServer>) {
        a.ping_node(b.identity().node_id(), peer(b)).await.unwrap();
        let (a2, b2) = (a.clone(), b.clone());
        assert!(
            wait_for(|| {
                let (a, b) = (a2.clone(), b2.clone());
                async move {
                    a.is_validated(&peer(&b), b.identity().node_id()).await
                        && b.is_validated(&peer(&a), a.identity().node_id()).await
                }
            })
            .await
        );
    }

    fn foreign_packet(message: Message, identity: &NodeIdentity) -> Vec<u8> {
        SignedPacket::sign(message, identity, b"").encode()
    }

    #[tokio::test]
    async fn test_rejects_invalid_settings() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let identity = Arc::new(NodeIdentity::generate());

        let transport: Arc<dyn PacketTransport> = socket;

        let mut bad = settings(addr, false);
        bad.bucket_size = 0;
        assert!(DiscoveryServer::new(identity.clone(), vec![transport.clone()], bad).is_err());
        assert!(DiscoveryServer::new(identity.clone(), Vec::new(), settings(addr, false)).is_err());
        assert!(DiscoveryServer::new(
            identity,
            vec![transport.clone(), transport],
            settings(addr, false)
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_ping_pong_bonds_both_ways() {
        let a = spawn_server(false).await;
        let b = spawn_server(false).await;

        bond(&a, &b).await;

        assert!(a.routing_table().contains(b.identity().node_id()).await);
        assert!(b.routing_table().contains(a.identity().node_id()).await);
        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_find_node_discovers_neighbors() {
        let a = spawn_server(false).await;
        let b = spawn_server(false).await;
        let c = spawn_server(false).await;

        bond(&c, &b).await;
        bond(&a, &b).await;

        a.find_node(c.identity().node_id(), b.identity().node_id(), peer(&b))
            .await
            .unwrap();

        let (a2, c_id) = (a.clone(), c.identity().node_id().clone());
        assert!(
            wait_for(|| {
                let (a, c_id) = (a2.clone(), c_id.clone());
                async move { a.routing_table().contains(&c_id).await }
            })
            .await
        );

        for server in [a, b, c] {
            server.stop().await;
        }
    }

    #[tokio::test]
    async fn test_find_node_requires_validated_endpoint() {
        let server = spawn_server(false).await;
        let stranger = NodeIdentity::generate();
        let from: SocketAddr = "127.0.0.1:45000".parse().unwrap();

        let find = FindNode::new(NodeInfo::from_identity(&stranger, from), Hash::zero());
        let data = foreign_packet(Message::FindNode(find), &stranger);
        let err = server.handle_packet(&data, from.into()).await.unwrap_err();

        assert!(matches!(err, DiscoveryError::EndpointNotValidated(_)));
        assert!(server.has_pending_ping(&PeerAddress::Udp(from)).await);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_unsolicited_neighbors_rejected() {
        let server = spawn_server(false).await;
        let stranger = NodeIdentity::generate();
        let from: SocketAddr = "127.0.0.1:45001".parse().unwrap();

        let neighbors = Neighbors::new(NodeInfo::from_identity(&stranger, from), Vec::new());
        let data = foreign_packet(Message::Neighbors(neighbors), &stranger);
        let err = server.handle_packet(&data, from.into()).await.unwrap_err();

        assert!(matches!(err, DiscoveryError::UnsolicitedResponse("NEIGHBORS", _)));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_legacy_engine_rejects_topic_messages() {
        let server = spawn_server(false).await;
        let stranger = NodeIdentity::generate();
        let from: SocketAddr = "127.0.0.1:45002".parse().unwrap();

        let reg = RegTopic::new(NodeInfo::from_identity(&stranger, from), "tos".to_string());
        let data = foreign_packet(Message::RegTopic(reg), &stranger);
        let err = server.handle_packet(&data, from.into()).await.unwrap_err();

        assert!(matches!(err, DiscoveryError::UnsupportedMessage(0x05)));
        assert!(server.register_topic("tos", from.into()).await.is_err());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_netrestrict_drops_foreign_sources() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let mut restricted = settings(socket.local_addr().unwrap(), false);
        restricted.netrestrict = Netlist::parse("127.0.0.0/8").unwrap().map(Arc::new);
        let server = DiscoveryServer::new(
            Arc::new(NodeIdentity::generate()),
            vec![socket as Arc<dyn PacketTransport>],
            restricted,
        )
        .unwrap();

        let stranger = NodeIdentity::generate();
        let from: SocketAddr = "10.0.0.1:2126".parse().unwrap();
        let ping = Ping::new(NodeInfo::from_identity(&stranger, from), 0);
        let data = foreign_packet(Message::Ping(ping), &stranger);

        let err = server.handle_packet(&data, from.into()).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Restricted(_)));
        assert!(server.routing_table().is_empty().await);
    }

    #[tokio::test]
    async fn test_forged_node_id_rejected() {
        let server = spawn_server(false).await;
        let stranger = NodeIdentity::generate();
        let from: SocketAddr = "127.0.0.1:45003".parse().unwrap();

        let mut source = NodeInfo::from_identity(&stranger, from);
        source.node_id = Hash::new([7u8; 32]);
        let data = foreign_packet(Message::Ping(Ping::new(source, 0)), &stranger);

        let err = server.handle_packet(&data, from.into()).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidNodeId(_)));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_mismatched_pong_keeps_ping_pending() {
        let server = spawn_server(false).await;
        let target = NodeIdentity::generate();
        let target_addr: SocketAddr = "127.0.0.1:45005".parse().unwrap();
        let other = NodeIdentity::generate();
        let other_addr: SocketAddr = "127.0.0.1:45006".parse().unwrap();

        server.ping_node(target.node_id(), target_addr.into()).await.unwrap();
        let ping_hash = server.pending_pings.read().await.keys().next().cloned().unwrap();

        // Another node answering with the hash of our PING
        let wrong_node = Pong::new(ping_hash.clone(), NodeInfo::from_identity(&other, other_addr));
        let err = server
            .handle_packet(&foreign_packet(Message::Pong(wrong_node), &other), other_addr.into())
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::UnsolicitedResponse("PONG", _)));

        // The right node, but from another address
        let wrong_addr = Pong::new(ping_hash.clone(), NodeInfo::from_identity(&target, other_addr));
        let err = server
            .handle_packet(&foreign_packet(Message::Pong(wrong_addr), &target), other_addr.into())
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::UnsolicitedResponse("PONG", _)));

        assert!(!server.is_validated(&other_addr.into(), other.node_id()).await);
        assert!(server.has_pending_ping(&target_addr.into()).await);

        let genuine = Pong::new(ping_hash, NodeInfo::from_identity(&target, target_addr));
        server
            .handle_packet(&foreign_packet(Message::Pong(genuine), &target), target_addr.into())
            .await
            .unwrap();
        assert!(server.is_validated(&target_addr.into(), target.node_id()).await);
        assert!(!server.has_pending_ping(&target_addr.into()).await);
        assert!(server.routing_table().contains(target.node_id()).await);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_neighbors_reply_spans_packets() {
        let server = spawn_server(false).await;
        let responder = NodeIdentity::generate();
        let from: SocketAddr = "127.0.0.1:45007".parse().unwrap();

        server
            .find_node(&Hash::zero(), responder.node_id(), from.into())
            .await
            .unwrap();

        let nodes: Vec<NodeInfo> = (0..MAX_NEIGHBORS as u16)
            .map(|i| NodeInfo::from_identity(&NodeIdentity::generate(), SocketAddr::from(([127, 0, 0, 1], 46000 + i))))
            .collect();
        let replies = Neighbors::split(NodeInfo::from_identity(&responder, from), nodes.clone());
        assert!(replies.len() > 1);
        for reply in replies {
            let data = foreign_packet(Message::Neighbors(reply), &responder);
            server.handle_packet(&data, from.into()).await.unwrap();
        }
        for node in &nodes {
            assert!(server.routing_table().contains(&node.node_id).await);
        }

        // A full bucket completes the request
        let extra = Neighbors::new(NodeInfo::from_identity(&responder, from), Vec::new());
        let err = server
            .handle_packet(&foreign_packet(Message::Neighbors(extra), &responder), from.into())
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::UnsolicitedResponse("NEIGHBORS", _)));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_topic_register_and_query() {
        let registrar = spawn_server(true).await;
        let member = spawn_server(true).await;
        let seeker = spawn_server(true).await;

        bond(&member, &registrar).await;
        bond(&seeker, &registrar).await;

        member.register_topic("tos-mainnet", peer(&registrar)).await.unwrap();
        let (r, member_id) = (registrar.clone(), member.identity().node_id().clone());
        assert!(
            wait_for(|| {
                let (r, id) = (r.clone(), member_id.clone());
                async move {
                    r.topic_registrations("tos-mainnet")
                        .await
                        .iter()
                        .any(|n| n.node_id == id)
                }
            })
            .await
        );

        seeker
            .query_topic("tos-mainnet", registrar.identity().node_id(), peer(&registrar))
            .await
            .unwrap();
        let s = seeker.clone();
        assert!(
            wait_for(|| {
                let (s, id) = (s.clone(), member_id.clone());
                async move {
                    s.topic_results("tos-mainnet")
                        .await
                        .iter()
                        .any(|n| n.node_id == id)
                }
            })
            .await
        );

        for server in [registrar, member, seeker] {
            server.stop().await;
        }
    }

    #[tokio::test]
    async fn test_stop_clears_running_flag() {
        let server = spawn_server(false).await;
        assert!(server.is_running());
        server.stop().await;
        assert!(!server.is_running());
        assert!(server.tasks.lock().await.is_empty());
    }
}

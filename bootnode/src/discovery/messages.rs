//! Protocol messages for the discovery engines.
//!
//! | Type | ID | Engines |
//! |------|----|---------|
//! | PING | 0x01 | legacy, topic |
//! | PONG | 0x02 | legacy, topic |
//! | FINDNODE | 0x03 | legacy, topic |
//! | NEIGHBORS | 0x04 | legacy, topic |
//! | REGTOPIC | 0x05 | topic |
//! | TOPICQUERY | 0x06 | topic |
//! | TOPICNODES | 0x07 | topic |

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use tos_bootnode_common::crypto::{self, Ed25519PublicKey, Ed25519Signature, Hash};
use tos_bootnode_common::serializer::{Reader, ReaderError, Serializer, Writer};
use tos_bootnode_common::time::get_current_time_in_seconds;

use super::error::{DiscoveryError, DiscoveryResult};
use super::identity::{NodeId, NodeIdentity};

/// Message type identifiers.
pub mod message_type {
    pub const PING: u8 = 0x01;
    pub const PONG: u8 = 0x02;
    pub const FINDNODE: u8 = 0x03;
    pub const NEIGHBORS: u8 = 0x04;
    pub const REGTOPIC: u8 = 0x05;
    pub const TOPICQUERY: u8 = 0x06;
    pub const TOPICNODES: u8 = 0x07;
}

/// Maximum packet size in bytes.
pub const MAX_PACKET_SIZE: usize = 1280;

/// Signature size on the wire.
pub const SIGNATURE_SIZE: usize = 64;

/// Expiration window in seconds for message validity.
pub const EXPIRATION_WINDOW: u64 = 20;

/// Maximum acceptable clock drift in seconds (2x expiration window).
/// Messages expiring later than this are rejected to prevent long-lived replay.
pub const MAX_CLOCK_DRIFT: u64 = EXPIRATION_WINDOW * 2;

/// Maximum number of nodes in a NEIGHBORS or TOPICNODES response.
pub const MAX_NEIGHBORS: usize = 16;

/// Expiration timestamp for a message created now.
pub fn new_expiration() -> u64 {
    get_current_time_in_seconds().saturating_add(EXPIRATION_WINDOW)
}

/// Not expired, and not too far in the future.
pub fn is_expiration_valid(expiration: u64) -> bool {
    let now = get_current_time_in_seconds();
    expiration > now && expiration <= now.saturating_add(MAX_CLOCK_DRIFT)
}

fn write_socket_addr(writer: &mut Writer, address: &SocketAddr) {
    match address.ip() {
        IpAddr::V4(ip) => {
            writer.write_u8(4);
            writer.write_bytes(&ip.octets());
        }
        IpAddr::V6(ip) => {
            writer.write_u8(6);
            writer.write_bytes(&ip.octets());
        }
    }
    writer.write_u16(address.port());
}

fn read_socket_addr(reader: &mut Reader) -> Result<SocketAddr, ReaderError> {
    let ip = match reader.read_u8()? {
        4 => IpAddr::V4(Ipv4Addr::from(reader.read_bytes::<4>()?)),
        6 => IpAddr::V6(Ipv6Addr::from(reader.read_bytes::<16>()?)),
        _ => return Err(ReaderError::InvalidValue),
    };
    Ok(SocketAddr::new(ip, reader.read_u16()?))
}

fn socket_addr_size(address: &SocketAddr) -> usize {
    1 + if address.is_ipv4() { 4 } else { 16 } + 2
}

/// Information about a discovery node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node ID (SHA3-256 hash of public key).
    pub node_id: NodeId,
    /// UDP address.
    pub address: SocketAddr,
    pub public_key: Ed25519PublicKey,
    /// Path-aware address (`ISD-AS,[host]:port`) when the node has one.
    pub alternate_address: Option<String>,
}

impl NodeInfo {
    pub fn new(node_id: NodeId, address: SocketAddr, public_key: Ed25519PublicKey) -> Self {
        Self {
            node_id,
            address,
            public_key,
            alternate_address: None,
        }
    }

    pub fn from_identity(identity: &NodeIdentity, address: SocketAddr) -> Self {
        Self::new(identity.node_id().clone(), address, identity.public_key())
    }

    pub fn with_alternate_address(mut self, alternate: Option<String>) -> Self {
        self.alternate_address = alternate.filter(|a| !a.is_empty());
        self
    }

    /// Verify that the node_id matches the public key.
    pub fn verify_node_id(&self) -> bool {
        self.node_id == crypto::hash(self.public_key.as_bytes())
    }
}

impl Serializer for NodeInfo {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            node_id: Hash::read(reader)?,
            address: read_socket_addr(reader)?,
            public_key: Ed25519PublicKey::read(reader)?,
            alternate_address: Option::read(reader)?,
        })
    }

    fn write(&self, writer: &mut Writer) {
        self.node_id.write(writer);
        write_socket_addr(writer, &self.address);
        self.public_key.write(writer);
        self.alternate_address.write(writer);
    }

    fn size(&self) -> usize {
        32 + socket_addr_size(&self.address) + 32 + self.alternate_address.size()
    }
}

fn read_nodes(reader: &mut Reader) -> Result<Vec<NodeInfo>, ReaderError> {
    let count = reader.read_u8()? as usize;
    if count > MAX_NEIGHBORS {
        return Err(ReaderError::InvalidSize);
    }
    (0..count).map(|_| NodeInfo::read(reader)).collect()
}

fn write_nodes(writer: &mut Writer, nodes: &[NodeInfo]) {
    writer.write_u8(nodes.len() as u8);
    for node in nodes {
        node.write(writer);
    }
}

fn nodes_size(nodes: &[NodeInfo]) -> usize {
    1 + nodes.iter().map(Serializer::size).sum::<usize>()
}

/// Split `nodes` into groups that each fit in one packet next to `fixed`
/// bytes, at most [`MAX_NEIGHBORS`] per group. A node too large for any
/// packet is dropped. There is always at least one group.
fn chunk_nodes(fixed: usize, nodes: Vec<NodeInfo>) -> Vec<Vec<NodeInfo>> {
    let budget = MAX_PACKET_SIZE.saturating_sub(SIGNATURE_SIZE + 1 + fixed + 1);
    let mut chunks = vec![Vec::new()];
    let mut used = 0;
    for node in nodes {
        let size = node.size();
        if size > budget {
            continue;
        }
        let full = chunks.last().map_or(true, |c| c.len() >= MAX_NEIGHBORS || used + size > budget);
        if full {
            chunks.push(Vec::new());
            used = 0;
        }
        used += size;
        if let Some(chunk) = chunks.last_mut() {
            chunk.push(node);
        }
    }
    chunks
}

fn validate_topic(topic: &str) -> Result<(), ReaderError> {
    if topic.is_empty() {
        return Err(ReaderError::InvalidValue);
    }
    Ok(())
}

/// PING message for liveness check and node info exchange.
#[derive(Debug, Clone)]
pub struct Ping {
    pub source: NodeInfo,
    pub expiration: u64,
    /// Sequence number for request/response matching.
    pub seq: u64,
}

impl Ping {
    pub fn new(source: NodeInfo, seq: u64) -> Self {
        Self {
            source,
            expiration: new_expiration(),
            seq,
        }
    }
}

impl Serializer for Ping {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            source: NodeInfo::read(reader)?,
            expiration: reader.read_u64()?,
            seq: reader.read_u64()?,
        })
    }

    fn write(&self, writer: &mut Writer) {
        self.source.write(writer);
        writer.write_u64(&self.expiration);
        writer.write_u64(&self.seq);
    }

    fn size(&self) -> usize {
        self.source.size() + 8 + 8
    }
}

/// PONG message as response to PING.
#[derive(Debug, Clone)]
pub struct Pong {
    /// Hash of the PING packet this responds to.
    pub ping_hash: Hash,
    pub source: NodeInfo,
    pub expiration: u64,
}

impl Pong {
    pub fn new(ping_hash: Hash, source: NodeInfo) -> Self {
        Self {
            ping_hash,
            source,
            expiration: new_expiration(),
        }
    }
}

impl Serializer for Pong {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            ping_hash: Hash::read(reader)?,
            source: NodeInfo::read(reader)?,
            expiration: reader.read_u64()?,
        })
    }

    fn write(&self, writer: &mut Writer) {
        self.ping_hash.write(writer);
        self.source.write(writer);
        writer.write_u64(&self.expiration);
    }

    fn size(&self) -> usize {
        32 + self.source.size() + 8
    }
}

/// FINDNODE message to request nodes close to a target.
#[derive(Debug, Clone)]
pub struct FindNode {
    pub source: NodeInfo,
    pub target: NodeId,
    pub expiration: u64,
}

impl FindNode {
    pub fn new(source: NodeInfo, target: NodeId) -> Self {
        Self {
            source,
            target,
            expiration: new_expiration(),
        }
    }
}

impl Serializer for FindNode {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            source: NodeInfo::read(reader)?,
            target: Hash::read(reader)?,
            expiration: reader.read_u64()?,
        })
    }

    fn write(&self, writer: &mut Writer) {
        self.source.write(writer);
        self.target.write(writer);
        writer.write_u64(&self.expiration);
    }

    fn size(&self) -> usize {
        self.source.size() + 32 + 8
    }
}

/// NEIGHBORS message containing a list of nodes.
#[derive(Debug, Clone)]
pub struct Neighbors {
    pub source: NodeInfo,
    pub nodes: Vec<NodeInfo>,
    pub expiration: u64,
}

impl Neighbors {
    /// Only the nodes that fit in a single packet are kept.
    pub fn new(source: NodeInfo, nodes: Vec<NodeInfo>) -> Self {
        let mut replies = Self::split(source, nodes);
        replies.swap_remove(0)
    }

    /// One reply per packet-sized group of nodes.
    pub fn split(source: NodeInfo, nodes: Vec<NodeInfo>) -> Vec<Self> {
        let expiration = new_expiration();
        chunk_nodes(source.size() + 8, nodes)
            .into_iter()
            .map(|nodes| Self {
                source: source.clone(),
                nodes,
                expiration,
            })
            .collect()
    }
}

impl Serializer for Neighbors {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            source: NodeInfo::read(reader)?,
            nodes: read_nodes(reader)?,
            expiration: reader.read_u64()?,
        })
    }

    fn write(&self, writer: &mut Writer) {
        self.source.write(writer);
        write_nodes(writer, &self.nodes);
        writer.write_u64(&self.expiration);
    }

    fn size(&self) -> usize {
        self.source.size() + nodes_size(&self.nodes) + 8
    }
}

/// REGTOPIC: register the sender under a topic.
#[derive(Debug, Clone)]
pub struct RegTopic {
    pub source: NodeInfo,
    pub topic: String,
    pub expiration: u64,
}

impl RegTopic {
    pub fn new(source: NodeInfo, topic: String) -> Self {
        Self {
            source,
            topic,
            expiration: new_expiration(),
        }
    }
}

impl Serializer for RegTopic {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let source = NodeInfo::read(reader)?;
        let topic = reader.read_string()?;
        validate_topic(&topic)?;
        Ok(Self {
            source,
            topic,
            expiration: reader.read_u64()?,
        })
    }

    fn write(&self, writer: &mut Writer) {
        self.source.write(writer);
        writer.write_string(&self.topic);
        writer.write_u64(&self.expiration);
    }

    fn size(&self) -> usize {
        self.source.size() + self.topic.size() + 8
    }
}

/// TOPICQUERY: ask for nodes registered under a topic.
#[derive(Debug, Clone)]
pub struct TopicQuery {
    pub source: NodeInfo,
    pub topic: String,
    pub expiration: u64,
}

impl TopicQuery {
    pub fn new(source: NodeInfo, topic: String) -> Self {
        Self {
            source,
            topic,
            expiration: new_expiration(),
        }
    }
}

impl Serializer for TopicQuery {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let source = NodeInfo::read(reader)?;
        let topic = reader.read_string()?;
        validate_topic(&topic)?;
        Ok(Self {
            source,
            topic,
            expiration: reader.read_u64()?,
        })
    }

    fn write(&self, writer: &mut Writer) {
        self.source.write(writer);
        writer.write_string(&self.topic);
        writer.write_u64(&self.expiration);
    }

    fn size(&self) -> usize {
        self.source.size() + self.topic.size() + 8
    }
}

/// TOPICNODES: answer to a TOPICQUERY.
#[derive(Debug, Clone)]
pub struct TopicNodes {
    pub source: NodeInfo,
    pub topic: String,
    pub nodes: Vec<NodeInfo>,
    pub expiration: u64,
}

impl TopicNodes {
    pub fn new(source: NodeInfo, topic: String, nodes: Vec<NodeInfo>) -> Self {
        let mut replies = Self::split(source, topic, nodes);
        replies.swap_remove(0)
    }

    pub fn split(source: NodeInfo, topic: String, nodes: Vec<NodeInfo>) -> Vec<Self> {
        let expiration = new_expiration();
        chunk_nodes(source.size() + topic.size() + 8, nodes)
            .into_iter()
            .map(|nodes| Self {
                source: source.clone(),
                topic: topic.clone(),
                nodes,
                expiration,
            })
            .collect()
    }
}

impl Serializer for TopicNodes {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let source = NodeInfo::read(reader)?;
        let topic = reader.read_string()?;
        validate_topic(&topic)?;
        Ok(Self {
            source,
            topic,
            nodes: read_nodes(reader)?,
            expiration: reader.read_u64()?,
        })
    }

    fn write(&self, writer: &mut Writer) {
        self.source.write(writer);
        writer.write_string(&self.topic);
        write_nodes(writer, &self.nodes);
        writer.write_u64(&self.expiration);
    }

    fn size(&self) -> usize {
        self.source.size() + self.topic.size() + nodes_size(&self.nodes) + 8
    }
}

/// Discovery message types.
#[derive(Debug, Clone)]
pub enum Message {
    Ping(Ping),
    Pong(Pong),
    FindNode(FindNode),
    Neighbors(Neighbors),
    RegTopic(RegTopic),
    TopicQuery(TopicQuery),
    TopicNodes(TopicNodes),
}

impl Message {
    pub fn message_type(&self) -> u8 {
        match self {
            Message::Ping(_) => message_type::PING,
            Message::Pong(_) => message_type::PONG,
            Message::FindNode(_) => message_type::FINDNODE,
            Message::Neighbors(_) => message_type::NEIGHBORS,
            Message::RegTopic(_) => message_type::REGTOPIC,
            Message::TopicQuery(_) => message_type::TOPICQUERY,
            Message::TopicNodes(_) => message_type::TOPICNODES,
        }
    }

    pub fn source(&self) -> &NodeInfo {
        match self {
            Message::Ping(m) => &m.source,
            Message::Pong(m) => &m.source,
            Message::FindNode(m) => &m.source,
            Message::Neighbors(m) => &m.source,
            Message::RegTopic(m) => &m.source,
            Message::TopicQuery(m) => &m.source,
            Message::TopicNodes(m) => &m.source,
        }
    }

    pub fn expiration(&self) -> u64 {
        match self {
            Message::Ping(m) => m.expiration,
            Message::Pong(m) => m.expiration,
            Message::FindNode(m) => m.expiration,
            Message::Neighbors(m) => m.expiration,
            Message::RegTopic(m) => m.expiration,
            Message::TopicQuery(m) => m.expiration,
            Message::TopicNodes(m) => m.expiration,
        }
    }

    /// Topic messages are only understood by the topic engine.
    pub fn is_topic_message(&self) -> bool {
        matches!(
            self,
            Message::RegTopic(_) | Message::TopicQuery(_) | Message::TopicNodes(_)
        )
    }

    pub fn is_expiration_valid(&self) -> bool {
        is_expiration_valid(self.expiration())
    }
}

impl Serializer for Message {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(match reader.read_u8()? {
            message_type::PING => Message::Ping(Ping::read(reader)?),
            message_type::PONG => Message::Pong(Pong::read(reader)?),
            message_type::FINDNODE => Message::FindNode(FindNode::read(reader)?),
            message_type::NEIGHBORS => Message::Neighbors(Neighbors::read(reader)?),
            message_type::REGTOPIC => Message::RegTopic(RegTopic::read(reader)?),
            message_type::TOPICQUERY => Message::TopicQuery(TopicQuery::read(reader)?),
            message_type::TOPICNODES => Message::TopicNodes(TopicNodes::read(reader)?),
            _ => return Err(ReaderError::InvalidValue),
        })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_u8(self.message_type());
        match self {
            Message::Ping(m) => m.write(writer),
            Message::Pong(m) => m.write(writer),
            Message::FindNode(m) => m.write(writer),
            Message::Neighbors(m) => m.write(writer),
            Message::RegTopic(m) => m.write(writer),
            Message::TopicQuery(m) => m.write(writer),
            Message::TopicNodes(m) => m.write(writer),
        }
    }

    fn size(&self) -> usize {
        1 + match self {
            Message::Ping(m) => m.size(),
            Message::Pong(m) => m.size(),
            Message::FindNode(m) => m.size(),
            Message::Neighbors(m) => m.size(),
            Message::RegTopic(m) => m.size(),
            Message::TopicQuery(m) => m.size(),
            Message::TopicNodes(m) => m.size(),
        }
    }
}

/// Bytes covered by the signature: `domain || message`.
///
/// The topic engine uses its network ID as domain so that packets from
/// other networks fail verification. The legacy engine uses no domain.
fn signing_payload(domain: &[u8], message: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(domain.len() + message.len());
    payload.extend_from_slice(domain);
    payload.extend_from_slice(message);
    payload
}

/// A signed packet: `signature (64) || message_type (1) || body`.
#[derive(Debug, Clone)]
pub struct SignedPacket {
    pub signature: Ed25519Signature,
    pub message: Message,
}

impl SignedPacket {
    pub fn sign(message: Message, identity: &NodeIdentity, domain: &[u8]) -> Self {
        let signature = identity.sign(&signing_payload(domain, &message.to_bytes()));
        Self { signature, message }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SIGNATURE_SIZE + self.message.size());
        let mut writer = Writer::new(&mut bytes);
        self.signature.write(&mut writer);
        self.message.write(&mut writer);
        bytes
    }

    /// Decode a packet, rejecting trailing data after the message.
    pub fn decode(data: &[u8]) -> DiscoveryResult<Self> {
        if data.len() < SIGNATURE_SIZE + 1 {
            return Err(DiscoveryError::InvalidPacketSize(
                SIGNATURE_SIZE + 1,
                data.len(),
            ));
        }
        if data.len() > MAX_PACKET_SIZE {
            return Err(DiscoveryError::PacketTooLarge(data.len(), MAX_PACKET_SIZE));
        }

        let mut reader = Reader::new(data);
        let signature = Ed25519Signature::read(&mut reader)?;
        let message = Message::read(&mut reader)?;

        let remaining = reader.size();
        if remaining > 0 {
            return Err(DiscoveryError::TrailingData(remaining));
        }

        Ok(Self { signature, message })
    }

    /// Hash of the encoded packet, echoed back in PONG.
    pub fn hash(&self) -> Hash {
        crypto::hash(&self.encode())
    }

    /// Verify against the sender's own public key under `domain`.
    pub fn verify(&self, domain: &[u8]) -> DiscoveryResult<()> {
        let payload = signing_payload(domain, &self.message.to_bytes());
        self.message
            .source()
            .public_key
            .verify(&payload, &self.signature)
            .map_err(|_| DiscoveryError::InvalidSignature)
    }
}

//! Peer discovery engines served by the bootnode.
//!
//! Both engines share one Kademlia-style core ([`DiscoveryServer`]) and the
//! same signed packet format:
//!
//! ```text
//! signature (64) || message_type (1) || body
//! ```
//!
//! | Type | ID | Legacy | Topic |
//! |------|-----|--------|-------|
//! | PING | 0x01 | yes | yes |
//! | PONG | 0x02 | yes | yes |
//! | FINDNODE | 0x03 | yes | yes |
//! | NEIGHBORS | 0x04 | yes | yes |
//! | REGTOPIC | 0x05 | | yes |
//! | TOPICQUERY | 0x06 | | yes |
//! | TOPICNODES | 0x07 | | yes |
//!
//! The legacy engine may additionally serve a path-aware socket; the topic
//! engine binds its signatures to a network ID.
//!
//! ## Node URL Format
//!
//! ```text
//! tosnode://<node_id_hex>@<ip>:<port>
//! ```

pub mod error;
pub mod identity;
pub mod legacy;
pub mod messages;
pub mod routing_table;
pub mod server;
pub mod topic;
pub mod transport;
pub mod url;

pub use error::{DiscoveryError, DiscoveryResult};
pub use identity::{NodeId, NodeIdentity};
pub use legacy::DiscoveryConfig;
pub use messages::{Message, NodeInfo, SignedPacket};
pub use routing_table::RoutingTable;
pub use server::{DiscoveryServer, EngineSettings};
pub use topic::{TopicConfig, TopicTable};
pub use transport::{PacketTransport, PeerAddress, TransportKind};
pub use url::TosNodeUrl;

//! Error types for the discovery engines.

use std::io::Error as IoError;
use thiserror::Error;
use tos_bootnode_common::serializer::ReaderError;

/// Error type for discovery protocol operations.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Message serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] ReaderError),

    /// Invalid URL format.
    #[error("Invalid tosnode URL: {0}")]
    InvalidUrl(String),

    /// Message type not handled by this engine.
    #[error("Unsupported message type: {0:#04x}")]
    UnsupportedMessage(u8),

    /// Message has expired or expires too far in the future.
    #[error("Message expiration {0} outside of the accepted window")]
    MessageExpired(u64),

    /// Invalid packet size.
    #[error("Invalid packet size: expected at least {0} bytes, got {1}")]
    InvalidPacketSize(usize, usize),

    /// Bytes left over after the message was decoded.
    #[error("Packet has {0} bytes of trailing data")]
    TrailingData(usize),

    /// Signature verification failed.
    #[error("Signature verification failed")]
    InvalidSignature,

    /// Node ID does not match the advertised public key.
    #[error("Node ID {0} does not match its public key")]
    InvalidNodeId(String),

    /// Packet too large.
    #[error("Packet too large: {0} bytes exceeds maximum {1}")]
    PacketTooLarge(usize, usize),

    /// Request from an endpoint that did not complete a PING/PONG round trip.
    #[error("Endpoint {0} is not validated")]
    EndpointNotValidated(String),

    /// Response without a matching request.
    #[error("Unsolicited {0} from {1}")]
    UnsolicitedResponse(&'static str, String),

    /// Peer outside of the configured netlist.
    #[error("Peer {0} is outside of the allowed networks")]
    Restricted(String),

    /// No transport able to reach a peer address.
    #[error("No transport available for {0}")]
    NoTransport(String),

    /// Topic table limits reached.
    #[error("Topic table is full ({0} topics)")]
    TopicLimit(usize),

    /// Topic name rejected.
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type alias for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

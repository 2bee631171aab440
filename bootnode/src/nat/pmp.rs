//! NAT-PMP client (RFC 6886).

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use log::trace;
use tos_bootnode_common::tokio::{
    net::UdpSocket,
    time::timeout,
};

use super::{NatError, NatMechanism, NatResult, Protocol};

pub const PMP_PORT: u16 = 5351;

const OP_EXTERNAL_ADDRESS: u8 = 0;
const OP_MAP_UDP: u8 = 1;
const OP_MAP_TCP: u8 = 2;
const RESPONSE_BIT: u8 = 128;

/// First retransmission delay, doubled on every attempt.
const INITIAL_TIMEOUT: Duration = Duration::from_millis(250);
const MAX_ATTEMPTS: u32 = 4;

fn opcode(protocol: Protocol) -> u8 {
    match protocol {
        Protocol::Udp => OP_MAP_UDP,
        Protocol::Tcp => OP_MAP_TCP,
    }
}

fn encode_map_request(protocol: Protocol, internal_port: u16, external_port: u16, lifetime: u32) -> [u8; 12] {
    let mut request = [0u8; 12];
    request[1] = opcode(protocol);
    request[4..6].copy_from_slice(&internal_port.to_be_bytes());
    request[6..8].copy_from_slice(&external_port.to_be_bytes());
    request[8..12].copy_from_slice(&lifetime.to_be_bytes());
    request
}

/// Check version, opcode and result code; returns the payload after the
/// 8-byte header.
fn check_response(response: &[u8], op: u8, len: usize) -> NatResult<&[u8]> {
    if response.len() < len || response[0] != 0 || response[1] != op | RESPONSE_BIT {
        return Err(NatError::Gateway(format!(
            "malformed NAT-PMP response of {} bytes",
            response.len()
        )));
    }
    let result = u16::from_be_bytes([response[2], response[3]]);
    if result != 0 {
        return Err(NatError::PmpResult(result));
    }
    Ok(&response[8..len])
}

fn parse_external_address(response: &[u8]) -> NatResult<Ipv4Addr> {
    let payload = check_response(response, OP_EXTERNAL_ADDRESS, 12)?;
    Ok(Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]))
}

/// Returns the mapped external port.
fn parse_map_response(response: &[u8], protocol: Protocol) -> NatResult<u16> {
    let payload = check_response(response, opcode(protocol), 16)?;
    Ok(u16::from_be_bytes([payload[2], payload[3]]))
}

/// `a.b.c.1` of the interface used for outbound traffic.
async fn guess_gateway() -> NatResult<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect("8.8.8.8:80").await?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() && !ip.is_loopback() => {
            let [a, b, c, _] = ip.octets();
            Ok(Ipv4Addr::new(a, b, c, 1))
        }
        _ => Err(NatError::NoGateway),
    }
}

#[derive(Debug, Clone)]
pub struct Pmp {
    gateway: Option<Ipv4Addr>,
    port: u16,
}

impl Pmp {
    /// Without a gateway the `a.b.c.1` address of the outbound interface is
    /// tried.
    pub fn new(gateway: Option<Ipv4Addr>) -> Self {
        Self {
            gateway,
            port: PMP_PORT,
        }
    }

    async fn gateway(&self) -> NatResult<Ipv4Addr> {
        match self.gateway {
            Some(gateway) => Ok(gateway),
            None => guess_gateway().await,
        }
    }

    async fn request(&self, request: &[u8]) -> NatResult<Vec<u8>> {
        let gateway = SocketAddr::new(IpAddr::V4(self.gateway().await?), self.port);
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(gateway).await?;

        let mut wait = INITIAL_TIMEOUT;
        let mut buf = [0u8; 16];
        for attempt in 1..=MAX_ATTEMPTS {
            socket.send(request).await?;
            match timeout(wait, socket.recv(&mut buf)).await {
                Ok(Ok(len)) => return Ok(buf[..len].to_vec()),
                Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    return Err(NatError::Io(e))
                }
                Ok(Err(e)) => {
                    if log::log_enabled!(log::Level::Trace) {
                        trace!("NAT-PMP attempt {} to {} failed: {}", attempt, gateway, e);
                    }
                }
                Err(_) => {
                    if log::log_enabled!(log::Level::Trace) {
                        trace!("NAT-PMP attempt {} to {} timed out", attempt, gateway);
                    }
                }
            }
            wait *= 2;
        }
        Err(NatError::Timeout)
    }
}

impl fmt::Display for Pmp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.gateway {
            Some(gateway) => write!(f, "NAT-PMP({})", gateway),
            None => f.write_str("NAT-PMP"),
        }
    }
}

#[async_trait]
impl NatMechanism for Pmp {
    async fn external_ip(&self) -> NatResult<IpAddr> {
        let response = self.request(&[0, OP_EXTERNAL_ADDRESS]).await?;
        parse_external_address(&response).map(IpAddr::V4)
    }

    async fn add_mapping(
        &self,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        _name: &str,
        lifetime: Duration,
    ) -> NatResult<u16> {
        let lifetime = u32::try_from(lifetime.as_secs()).unwrap_or(u32::MAX);
        let request = encode_map_request(protocol, internal_port, external_port, lifetime);
        let response = self.request(&request).await?;
        parse_map_response(&response, protocol)
    }

    async fn delete_mapping(&self, protocol: Protocol, _external_port: u16, internal_port: u16) -> NatResult<()> {
        // Lifetime 0 with external port 0 removes the mapping
        let request = encode_map_request(protocol, internal_port, 0, 0);
        let response = self.request(&request).await?;
        parse_map_response(&response, protocol).map(|_| ())
    }
}

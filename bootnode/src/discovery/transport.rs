//! Datagram transports the discovery engines run on.
//!
//! The legacy engine can serve a UDP socket and a path-aware socket under
//! one identity; both are driven through [`PacketTransport`]. Replies leave
//! on the transport matching the peer address kind.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use tos_bootnode_common::tokio::net::UdpSocket;

use crate::scion::{PathAwareSocket, ScionAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    PathAware,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Udp => f.write_str("udp"),
            TransportKind::PathAware => f.write_str("path-aware"),
        }
    }
}

/// Where a packet came from or goes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerAddress {
    Udp(SocketAddr),
    PathAware(ScionAddr),
}

impl PeerAddress {
    pub fn kind(&self) -> TransportKind {
        match self {
            PeerAddress::Udp(_) => TransportKind::Udp,
            PeerAddress::PathAware(_) => TransportKind::PathAware,
        }
    }

    /// Host IP, checked against the netlist.
    pub fn ip(&self) -> IpAddr {
        match self {
            PeerAddress::Udp(addr) => addr.ip(),
            PeerAddress::PathAware(addr) => addr.host,
        }
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        PeerAddress::Udp(addr)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddress::Udp(addr) => write!(f, "{}", addr),
            PeerAddress::PathAware(addr) => write!(f, "{}", addr),
        }
    }
}

#[async_trait]
pub trait PacketTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn local_address(&self) -> io::Result<PeerAddress>;

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, PeerAddress)>;

    async fn send_to(&self, buf: &[u8], to: &PeerAddress) -> io::Result<usize>;
}

fn wrong_kind(expected: TransportKind, to: &PeerAddress) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("cannot send to {} over a {} transport", to, expected),
    )
}

#[async_trait]
impl PacketTransport for UdpSocket {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn local_address(&self) -> io::Result<PeerAddress> {
        self.local_addr().map(PeerAddress::Udp)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, PeerAddress)> {
        let (len, from) = UdpSocket::recv_from(self, buf).await?;
        Ok((len, PeerAddress::Udp(from)))
    }

    async fn send_to(&self, buf: &[u8], to: &PeerAddress) -> io::Result<usize> {
        match to {
            PeerAddress::Udp(addr) => UdpSocket::send_to(self, buf, *addr).await,
            other => Err(wrong_kind(TransportKind::Udp, other)),
        }
    }
}

#[async_trait]
impl PacketTransport for PathAwareSocket {
    fn kind(&self) -> TransportKind {
        TransportKind::PathAware
    }

    fn local_address(&self) -> io::Result<PeerAddress> {
        Ok(PeerAddress::PathAware(self.local_addr().clone()))
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, PeerAddress)> {
        let (len, from) = PathAwareSocket::recv_from(self, buf).await?;
        Ok((len, PeerAddress::PathAware(from)))
    }

    async fn send_to(&self, buf: &[u8], to: &PeerAddress) -> io::Result<usize> {
        match to {
            PeerAddress::PathAware(addr) => PathAwareSocket::send_to(self, buf, addr).await,
            other => Err(wrong_kind(TransportKind::PathAware, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_transport_roundtrip() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_addr = PacketTransport::local_address(&b).unwrap();

        PacketTransport::send_to(&a, b"hello", &b_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (len, from) = PacketTransport::recv_from(&b, &mut buf).await.unwrap();

        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, PeerAddress::Udp(a.local_addr().unwrap()));
    }

    #[tokio::test]
    async fn test_udp_transport_rejects_path_aware_peer() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = PeerAddress::PathAware("1-ff00:0:110,[127.0.0.1]:40000".parse().unwrap());
        let err = PacketTransport::send_to(&socket, b"x", &peer).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_peer_address_ip() {
        let udp: PeerAddress = "10.1.2.3:2126".parse::<SocketAddr>().unwrap().into();
        assert_eq!(udp.ip(), "10.1.2.3".parse::<IpAddr>().unwrap());
        assert_eq!(udp.kind(), TransportKind::Udp);

        let path = PeerAddress::PathAware("1-64512,[192.168.1.7]:40000".parse().unwrap());
        assert_eq!(path.ip(), "192.168.1.7".parse::<IpAddr>().unwrap());
        assert_eq!(path.kind(), TransportKind::PathAware);
    }
}

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info};
use tos_bootnode_common::tokio::net::{lookup_host, UdpSocket};

use crate::error::{BootnodeError, BootnodeResult};
use crate::scion::{self, PathAwareSocket, ScionAddr, ScionStack, StackPaths};

/// The primary UDP socket and the address it is bound to.
#[derive(Debug, Clone)]
pub struct ListenEndpoint {
    pub addr: SocketAddr,
    pub socket: Arc<UdpSocket>,
}

#[derive(Debug, Clone)]
pub struct AlternateEndpoint {
    pub addr: ScionAddr,
    pub socket: Arc<PathAwareSocket>,
}

/// Opens the sockets the engines listen on.
pub struct TransportBuilder {
    paths: StackPaths,
    stack: Arc<ScionStack>,
}

impl Default for TransportBuilder {
    fn default() -> Self {
        Self::new(StackPaths::default(), scion::global())
    }
}

impl TransportBuilder {
    pub fn new(paths: StackPaths, stack: Arc<ScionStack>) -> Self {
        Self { paths, stack }
    }

    /// Resolve a listen address; `:port` means every interface.
    pub async fn resolve(addr: &str) -> BootnodeResult<SocketAddr> {
        let target = match addr.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{}", port),
            None => addr.to_string(),
        };
        let failed = |reason: String| BootnodeError::AddressResolutionFailed {
            addr: addr.to_string(),
            reason,
        };

        let resolved = lookup_host(target.as_str())
            .await
            .map_err(|e| failed(e.to_string()))?
            .next()
            .ok_or_else(|| failed("no address found".to_string()));
        resolved
    }

    pub async fn build(
        &self,
        listen: &str,
        alternate: Option<&ScionAddr>,
    ) -> BootnodeResult<(ListenEndpoint, Option<AlternateEndpoint>)> {
        let resolved = Self::resolve(listen).await?;
        let socket = UdpSocket::bind(resolved)
            .await
            .map_err(|source| BootnodeError::SocketBindFailed {
                addr: resolved.to_string(),
                source,
            })?;
        let addr = socket.local_addr().map_err(|source| BootnodeError::SocketBindFailed {
            addr: resolved.to_string(),
            source,
        })?;
        if log::log_enabled!(log::Level::Debug) {
            debug!("UDP socket bound to {}", addr);
        }

        let primary = ListenEndpoint {
            addr,
            socket: Arc::new(socket),
        };

        let alternate = match alternate {
            Some(requested) => Some(self.bind_alternate(requested).await?),
            None => None,
        };
        Ok((primary, alternate))
    }

    async fn bind_alternate(&self, requested: &ScionAddr) -> BootnodeResult<AlternateEndpoint> {
        let daemon_socket = self.paths.daemon_socket(&requested.ia);
        self.stack
            .init(requested.ia, &daemon_socket, &self.paths.dispatcher_socket)
            .await
            .map_err(BootnodeError::AlternateTransportInitFailed)?;

        let socket = self
            .stack
            .bind(requested)
            .await
            .map_err(BootnodeError::AlternateTransportInitFailed)?;
        let addr = socket.local_addr().clone();
        if log::log_enabled!(log::Level::Info) {
            info!("Path-aware socket bound to {}", addr);
        }

        Ok(AlternateEndpoint {
            addr,
            socket: Arc::new(socket),
        })
    }
}

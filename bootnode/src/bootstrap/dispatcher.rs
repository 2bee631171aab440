use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use tos_bootnode_common::tokio::net::UdpSocket;

use super::netlist::Netlist;
use super::transport::{AlternateEndpoint, ListenEndpoint};
use crate::discovery::{
    legacy, topic, DiscoveryConfig, DiscoveryResult, DiscoveryServer, NodeIdentity, TopicConfig, TosNodeUrl,
};
use crate::error::{BootnodeError, BootnodeResult};
use crate::scion::PathAwareSocket;

/// Which discovery engine serves the node, chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    Legacy,
    Topic,
}

impl fmt::Display for DiscoveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => f.write_str("legacy"),
            Self::Topic => f.write_str("topic"),
        }
    }
}

/// Handle on a started engine.
#[async_trait]
pub trait RunningEngine: Send + Sync {
    fn mode(&self) -> DiscoveryMode;

    fn announce_addr(&self) -> SocketAddr;

    async fn stop(&self);
}

/// Starts the engines. Tests swap in their own launcher.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn start_legacy(
        &self,
        config: DiscoveryConfig,
        primary: Arc<UdpSocket>,
        alternate: Option<Arc<PathAwareSocket>>,
    ) -> DiscoveryResult<Box<dyn RunningEngine>>;

    async fn start_topic(&self, config: TopicConfig, primary: Arc<UdpSocket>) -> DiscoveryResult<Box<dyn RunningEngine>>;
}

struct ServerHandle {
    mode: DiscoveryMode,
    server: Arc<DiscoveryServer>,
}

#[async_trait]
impl RunningEngine for ServerHandle {
    fn mode(&self) -> DiscoveryMode {
        self.mode
    }

    fn announce_addr(&self) -> SocketAddr {
        self.server.settings().announce_addr
    }

    async fn stop(&self) {
        self.server.stop().await;
    }
}

/// Launches the engines of the `discovery` module.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultLauncher;

#[async_trait]
impl EngineLauncher for DefaultLauncher {
    async fn start_legacy(
        &self,
        config: DiscoveryConfig,
        primary: Arc<UdpSocket>,
        alternate: Option<Arc<PathAwareSocket>>,
    ) -> DiscoveryResult<Box<dyn RunningEngine>> {
        let server = match alternate {
            Some(alternate) => legacy::listen_udp_with_path_aware(primary, alternate, config).await?,
            None => legacy::listen_udp(primary, config).await?,
        };
        Ok(Box::new(ServerHandle {
            mode: DiscoveryMode::Legacy,
            server,
        }))
    }

    async fn start_topic(&self, config: TopicConfig, primary: Arc<UdpSocket>) -> DiscoveryResult<Box<dyn RunningEngine>> {
        let server = topic::listen_udp(primary, config).await?;
        Ok(Box::new(ServerHandle {
            mode: DiscoveryMode::Topic,
            server,
        }))
    }
}

/// Everything an engine is started with.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub mode: DiscoveryMode,
    pub identity: Arc<NodeIdentity>,
    pub primary: ListenEndpoint,
    pub alternate: Option<AlternateEndpoint>,
    pub announce_addr: SocketAddr,
    pub netrestrict: Option<Arc<Netlist>>,
    pub bootnodes: Vec<TosNodeUrl>,
    pub bucket_size: usize,
}

pub async fn dispatch(launcher: &dyn EngineLauncher, request: DispatchRequest) -> BootnodeResult<Box<dyn RunningEngine>> {
    let DispatchRequest {
        mode,
        identity,
        primary,
        alternate,
        announce_addr,
        netrestrict,
        bootnodes,
        bucket_size,
    } = request;

    let started = match mode {
        DiscoveryMode::Topic => {
            if let Some(alternate) = alternate.as_ref() {
                if log::log_enabled!(log::Level::Warn) {
                    warn!(
                        "Path-aware endpoint {} is not used by the topic engine",
                        alternate.addr
                    );
                }
            }
            let config = TopicConfig {
                identity,
                announce_addr,
                network_id: String::new(),
                netrestrict,
                bootnodes,
                bucket_size,
            };
            launcher.start_topic(config, primary.socket).await
        }
        DiscoveryMode::Legacy => {
            let config = DiscoveryConfig {
                identity,
                announce_addr,
                alternate_announce_addr: alternate
                    .as_ref()
                    .map(|alternate| alternate.addr.to_string())
                    .unwrap_or_default(),
                netrestrict,
                bootnodes,
                bucket_size,
            };
            launcher
                .start_legacy(config, primary.socket, alternate.map(|alternate| alternate.socket))
                .await
        }
    };

    let engine = started.map_err(|source| BootnodeError::EngineStartFailed { mode, source })?;
    if log::log_enabled!(log::Level::Info) {
        info!("Started {} discovery engine on {}, announcing {}", mode, primary.addr, engine.announce_addr());
    }
    Ok(engine)
}

/// Serve until `shutdown` completes, then stop the engine.
pub async fn run_until<F>(engine: Box<dyn RunningEngine>, shutdown: F)
where
    F: Future<Output = ()>,
{
    shutdown.await;
    if log::log_enabled!(log::Level::Info) {
        info!("Shutting down {} discovery engine", engine.mode());
    }
    engine.stop().await;
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tos_bootnode_common::tokio::{spawn_task, sync::Notify, time::timeout};

use crate::nat::{self, NatMechanism, Protocol};

/// How long startup waits for the external IP.
pub const EXTERNAL_IP_TIMEOUT: Duration = Duration::from_secs(5);

const MAPPING_NAME: &str = "tos discovery";

/// Turns the local listen address into the address announced to peers.
pub struct NatAttacher {
    mechanism: Option<Arc<dyn NatMechanism>>,
    external_ip_timeout: Duration,
    release: Arc<Notify>,
}

impl NatAttacher {
    pub fn new(mechanism: Option<Arc<dyn NatMechanism>>) -> Self {
        Self {
            mechanism,
            external_ip_timeout: EXTERNAL_IP_TIMEOUT,
            release: Arc::new(Notify::new()),
        }
    }

    pub fn with_timeout(mut self, external_ip_timeout: Duration) -> Self {
        self.external_ip_timeout = external_ip_timeout;
        self
    }

    /// Start keeping a UDP mapping for `local` alive in the background and
    /// return the announce address.
    ///
    /// The port is kept; the IP is replaced by the external one when the
    /// mechanism reports it in time. Changes of the external IP after this
    /// call are not picked up.
    pub async fn attach(&self, local: SocketAddr) -> SocketAddr {
        let Some(mechanism) = self.mechanism.as_ref() else {
            return local;
        };

        if local.ip().is_loopback() {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Not mapping loopback address {} via {}", local, mechanism);
            }
        } else {
            spawn_task(
                "nat-map",
                nat::map(
                    mechanism.clone(),
                    Protocol::Udp,
                    local.port(),
                    local.port(),
                    MAPPING_NAME.to_string(),
                    self.release.clone(),
                ),
            );
        }

        match timeout(self.external_ip_timeout, mechanism.external_ip()).await {
            Ok(Ok(ip)) => {
                let announce = SocketAddr::new(ip, local.port());
                if log::log_enabled!(log::Level::Info) {
                    info!("Announcing external address {} (via {})", announce, mechanism);
                }
                announce
            }
            Ok(Err(e)) => {
                if log::log_enabled!(log::Level::Warn) {
                    warn!("Couldn't get external IP via {}: {}", mechanism, e);
                }
                local
            }
            Err(_) => {
                if log::log_enabled!(log::Level::Warn) {
                    warn!("Timed out waiting for external IP via {}", mechanism);
                }
                local
            }
        }
    }

    /// Ask the mapping task to delete its mapping and stop.
    pub fn release(&self) {
        if self.mechanism.is_some() {
            self.release.notify_one();
        }
    }
}

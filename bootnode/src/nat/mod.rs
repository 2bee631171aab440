//! NAT traversal mechanisms.
//!
//! A mechanism is chosen with a descriptor string:
//!
//! | Descriptor | Mechanism |
//! |---|---|
//! | `""`, `none`, `off` | no NAT handling |
//! | `any`, `auto`, `on` | first of UPnP / NAT-PMP that answers |
//! | `upnp` | UPnP Internet Gateway Device |
//! | `pmp`, `natpmp`, `nat-pmp` (`:<gateway>`) | NAT-PMP |
//! | `extip:<ip>`, `ip:<ip>` | fixed external IP, no mapping |

mod any;
mod extip;
mod pmp;
mod upnp;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use thiserror::Error;
use tos_bootnode_common::tokio::{
    select,
    sync::Notify,
    time::{interval_at, Instant},
};

pub use any::Any;
pub use extip::ExtIp;
pub use pmp::Pmp;
pub use upnp::Upnp;

/// Lifetime requested for every mapping.
pub const MAPPING_LIFETIME: Duration = Duration::from_secs(20 * 60);

/// Mappings are renewed this long after being added.
pub const MAPPING_RENEWAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum NatError {
    #[error("invalid IP address '{0}'")]
    InvalidIp(String),

    #[error("missing IP address for mechanism '{0}'")]
    MissingIp(String),

    #[error("unknown mechanism '{0}'")]
    UnknownMechanism(String),

    #[error("no gateway found")]
    NoGateway,

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("NAT-PMP request failed with result code {0}")]
    PmpResult(u16),

    #[error("request timed out")]
    Timeout,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type NatResult<T> = Result<T, NatError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "UDP",
            Protocol::Tcp => "TCP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A way of making a local port reachable from outside the NAT.
#[async_trait]
pub trait NatMechanism: Send + Sync + fmt::Display {
    async fn external_ip(&self) -> NatResult<IpAddr>;

    /// Map `external_port` to `internal_port`. Returns the external port
    /// actually mapped.
    async fn add_mapping(
        &self,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        name: &str,
        lifetime: Duration,
    ) -> NatResult<u16>;

    async fn delete_mapping(
        &self,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
    ) -> NatResult<()>;
}

/// Parse a mechanism descriptor. `Ok(None)` means no NAT handling.
pub fn parse(descriptor: &str) -> NatResult<Option<Arc<dyn NatMechanism>>> {
    let (mechanism, ip) = match descriptor.split_once(':') {
        Some((mechanism, ip)) => {
            let ip = ip
                .parse::<IpAddr>()
                .map_err(|_| NatError::InvalidIp(ip.to_string()))?;
            (mechanism, Some(ip))
        }
        None => (descriptor, None),
    };

    let nat: Arc<dyn NatMechanism> = match mechanism.to_lowercase().as_str() {
        "" | "none" | "off" => return Ok(None),
        "any" | "auto" | "on" => Arc::new(Any::new()),
        "extip" | "ip" => {
            let ip = ip.ok_or_else(|| NatError::MissingIp(mechanism.to_string()))?;
            Arc::new(ExtIp::new(ip))
        }
        "upnp" => Arc::new(Upnp::new()),
        "pmp" | "natpmp" | "nat-pmp" => match ip {
            Some(IpAddr::V4(gateway)) => Arc::new(Pmp::new(Some(gateway))),
            Some(other) => return Err(NatError::InvalidIp(other.to_string())),
            None => Arc::new(Pmp::new(None)),
        },
        _ => return Err(NatError::UnknownMechanism(mechanism.to_string())),
    };
    Ok(Some(nat))
}

/// Keep a port mapping alive until `release` is notified, then delete it.
///
/// Failures are only logged.
pub async fn map(
    nat: Arc<dyn NatMechanism>,
    protocol: Protocol,
    external_port: u16,
    internal_port: u16,
    name: String,
    release: Arc<Notify>,
) {
    match nat
        .add_mapping(protocol, external_port, internal_port, &name, MAPPING_LIFETIME)
        .await
    {
        Ok(mapped) => {
            if log::log_enabled!(log::Level::Info) {
                info!("Mapped network port {} {} -> {} via {}", protocol, mapped, internal_port, nat);
            }
        }
        Err(e) => {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Couldn't add port mapping via {}: {}", nat, e);
            }
        }
    }

    let mut refresh = interval_at(Instant::now() + MAPPING_RENEWAL, MAPPING_RENEWAL);
    loop {
        select! {
            _ = release.notified() => break,
            _ = refresh.tick() => {
                if let Err(e) = nat
                    .add_mapping(protocol, external_port, internal_port, &name, MAPPING_LIFETIME)
                    .await
                {
                    if log::log_enabled!(log::Level::Warn) {
                        warn!("Couldn't renew port mapping via {}: {}", nat, e);
                    }
                }
            }
        }
    }

    let deleted = nat.delete_mapping(protocol, external_port, internal_port).await;
    if log::log_enabled!(log::Level::Debug) {
        match deleted {
            Ok(()) => debug!("Deleted port mapping {} {} via {}", protocol, external_port, nat),
            Err(e) => debug!("Couldn't delete port mapping via {}: {}", nat, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::testing::Recorder;
    use tos_bootnode_common::tokio::{spawn_task, time::sleep};

    #[test]
    fn test_parse_none() {
        for descriptor in ["", "none", "off", "NONE", "off:1.2.3.4"] {
            assert!(parse(descriptor).unwrap().is_none(), "{}", descriptor);
        }
    }

    #[test]
    fn test_parse_mechanisms() {
        assert_eq!(parse("any").unwrap().unwrap().to_string(), "any");
        assert_eq!(parse("AUTO").unwrap().unwrap().to_string(), "any");
        assert_eq!(parse("upnp").unwrap().unwrap().to_string(), "UPnP");
        assert_eq!(parse("extip:1.2.3.4").unwrap().unwrap().to_string(), "ExtIP(1.2.3.4)");
        assert_eq!(parse("ip:2001:db8::1").unwrap().unwrap().to_string(), "ExtIP(2001:db8::1)");
        assert_eq!(parse("pmp").unwrap().unwrap().to_string(), "NAT-PMP");
        assert_eq!(
            parse("nat-pmp:192.168.1.1").unwrap().unwrap().to_string(),
            "NAT-PMP(192.168.1.1)"
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse("extip"), Err(NatError::MissingIp(_))));
        assert!(matches!(parse("extip:nope"), Err(NatError::InvalidIp(_))));
        assert!(matches!(parse("pmp:::1"), Err(NatError::InvalidIp(_))));
        assert!(matches!(parse("stun"), Err(NatError::UnknownMechanism(_))));
        // The IP is checked before the mechanism name
        assert!(matches!(parse("stun:bad"), Err(NatError::InvalidIp(_))));
    }

    #[tokio::test]
    async fn test_map_adds_then_deletes_on_release() {
        let recorder = Arc::new(Recorder::default());
        let release = Arc::new(Notify::new());
        release.notify_one();

        map(recorder.clone(), Protocol::Udp, 30301, 30301, "test".to_string(), release).await;

        assert_eq!(recorder.calls().await, vec!["add", "delete"]);
    }

    #[tokio::test]
    async fn test_map_survives_refused_mapping() {
        let recorder = Arc::new(Recorder {
            fail_mapping: true,
            ..Default::default()
        });
        let release = Arc::new(Notify::new());
        let task = spawn_task(
            "nat-map-test",
            map(recorder.clone(), Protocol::Udp, 30301, 30301, "test".to_string(), release.clone()),
        );

        sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        assert_eq!(recorder.calls().await, vec!["add"]);

        release.notify_one();
        task.await.unwrap();
        assert_eq!(recorder.calls().await, vec!["add", "delete"]);
    }

    #[tokio::test]
    async fn test_extip_resolves_without_mapping() {
        let nat = parse("extip:203.0.113.7").unwrap().unwrap();
        assert_eq!(nat.external_ip().await.unwrap(), "203.0.113.7".parse::<IpAddr>().unwrap());
        assert_eq!(
            nat.add_mapping(Protocol::Udp, 2126, 2126, "test", MAPPING_LIFETIME).await.unwrap(),
            2126
        );
    }
}

//! Startup sequence of the bootnode.
//!
//! Options are validated before anything is acquired: the identity source
//! is decided first (key generation exits right away), then the NAT
//! descriptor, key material, netlist, path-aware address and bootnode URLs
//! are parsed. Only then are sockets bound, the NAT mapping attached and an
//! engine started.

mod dispatcher;
mod nat;
mod netlist;
mod provision;
mod transport;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info};

pub use dispatcher::{
    dispatch, run_until, DefaultLauncher, DiscoveryMode, DispatchRequest, EngineLauncher, RunningEngine,
};
pub use nat::{NatAttacher, EXTERNAL_IP_TIMEOUT};
pub use netlist::{IpNet, Netlist, NetlistError};
pub use provision::{
    generate_key, load_key_file, load_key_hex, provision, save_key, IdentitySource, InvalidSource, Provisioned,
};
pub use transport::{AlternateEndpoint, ListenEndpoint, TransportBuilder};

use crate::config::BootnodeConfig;
use crate::discovery::TosNodeUrl;
use crate::error::{BootnodeError, BootnodeResult};
use crate::nat as nat_mechanism;
use crate::scion::ScionAddr;

/// How a run ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// `--genkey` wrote a fresh key.
    KeyGenerated { path: PathBuf, fingerprint: String },
    /// `--writeaddress` computed the node fingerprint.
    AddressWritten(String),
    /// The engine ran until shutdown was requested.
    Shutdown,
}

fn parse_alternate(value: Option<&str>) -> BootnodeResult<Option<ScionAddr>> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|e| BootnodeError::InvalidAlternateAddress(format!("'{}': {}", value, e))),
        None => Ok(None),
    }
}

fn parse_bootnodes(values: &[String]) -> BootnodeResult<Vec<TosNodeUrl>> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| TosNodeUrl::parse(v).map_err(BootnodeError::InvalidBootnode))
        .collect()
}

/// Run the bootnode with the default transports.
pub async fn run<F>(config: &BootnodeConfig, launcher: &dyn EngineLauncher, shutdown: F) -> BootnodeResult<Outcome>
where
    F: Future<Output = ()>,
{
    run_with(config, &TransportBuilder::default(), launcher, shutdown).await
}

pub async fn run_with<F>(
    config: &BootnodeConfig,
    transports: &TransportBuilder,
    launcher: &dyn EngineLauncher,
    shutdown: F,
) -> BootnodeResult<Outcome>
where
    F: Future<Output = ()>,
{
    let source = IdentitySource::from_options(
        config.genkey.as_deref(),
        config.nodekey.as_deref(),
        config.nodekeyhex.as_deref(),
    );
    if let IdentitySource::Generate(path) = &source {
        let identity = generate_key(path)?;
        return Ok(Outcome::KeyGenerated {
            path: path.clone(),
            fingerprint: identity.fingerprint(),
        });
    }

    let mechanism =
        nat_mechanism::parse(&config.nat).map_err(|e| BootnodeError::InvalidNatDescriptor(e.to_string()))?;
    start(config, &source, NatAttacher::new(mechanism), transports, launcher, shutdown).await
}

/// Provision the key, bind and serve once the NAT mechanism is known.
async fn start<F>(
    config: &BootnodeConfig,
    source: &IdentitySource,
    nat: NatAttacher,
    transports: &TransportBuilder,
    launcher: &dyn EngineLauncher,
    shutdown: F,
) -> BootnodeResult<Outcome>
where
    F: Future<Output = ()>,
{
    let identity = match provision(source)? {
        Provisioned::Loaded(identity) | Provisioned::Generated { identity, .. } => Arc::new(identity),
    };
    if config.writeaddress {
        return Ok(Outcome::AddressWritten(identity.fingerprint()));
    }

    let netrestrict = match config.netrestrict.as_deref() {
        Some(list) => Netlist::parse(list)
            .map_err(|e| BootnodeError::InvalidNetlist(e.to_string()))?
            .map(Arc::new),
        None => None,
    };
    if let Some(netlist) = netrestrict.as_ref() {
        if log::log_enabled!(log::Level::Debug) {
            debug!("Restricting peers to {}", netlist);
        }
    }
    let alternate = parse_alternate(config.scion.as_deref())?;
    let bootnodes = parse_bootnodes(&config.bootnodes)?;

    let (primary, alternate) = transports.build(&config.addr, alternate.as_ref()).await?;

    let announce_addr = nat.attach(primary.addr).await;

    let request = DispatchRequest {
        mode: config.mode(),
        identity: identity.clone(),
        primary,
        alternate,
        announce_addr,
        netrestrict,
        bootnodes,
        bucket_size: config.bucket_size,
    };
    let engine = match dispatch(launcher, request).await {
        Ok(engine) => engine,
        Err(e) => {
            nat.release();
            return Err(e);
        }
    };
    if log::log_enabled!(log::Level::Info) {
        info!("Node {} is up", identity.fingerprint());
    }

    run_until(engine, shutdown).await;
    nat.release();
    Ok(Outcome::Shutdown)
}

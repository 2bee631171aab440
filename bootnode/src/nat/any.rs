use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{select_ok, BoxFuture, FutureExt};
use log::info;
use tos_bootnode_common::tokio::sync::OnceCell;

use super::{NatError, NatMechanism, NatResult, Pmp, Protocol, Upnp};

type Candidate = BoxFuture<'static, NatResult<Arc<dyn NatMechanism>>>;

/// A mechanism is usable once it reports an external IP.
fn candidate<M: NatMechanism + 'static>(mechanism: M) -> Candidate {
    async move {
        mechanism.external_ip().await?;
        Ok::<_, NatError>(Arc::new(mechanism) as Arc<dyn NatMechanism>)
    }
    .boxed()
}

/// Uses whichever of UPnP and NAT-PMP answers first.
#[derive(Default)]
pub struct Any {
    found: OnceCell<Arc<dyn NatMechanism>>,
}

impl Any {
    pub fn new() -> Self {
        Self::default()
    }

    async fn mechanism(&self) -> NatResult<&Arc<dyn NatMechanism>> {
        self.found
            .get_or_try_init(|| async {
                let (found, _) = select_ok([candidate(Upnp::new()), candidate(Pmp::new(None))]).await?;
                if log::log_enabled!(log::Level::Info) {
                    info!("Using {} for NAT traversal", found);
                }
                Ok::<_, NatError>(found)
            })
            .await
    }
}

impl fmt::Display for Any {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.found.get() {
            Some(found) => write!(f, "any({})", found),
            None => f.write_str("any"),
        }
    }
}

#[async_trait]
impl NatMechanism for Any {
    async fn external_ip(&self) -> NatResult<IpAddr> {
        self.mechanism().await?.external_ip().await
    }

    async fn add_mapping(
        &self,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        name: &str,
        lifetime: Duration,
    ) -> NatResult<u16> {
        self.mechanism()
            .await?
            .add_mapping(protocol, external_port, internal_port, name, lifetime)
            .await
    }

    async fn delete_mapping(&self, protocol: Protocol, external_port: u16, internal_port: u16) -> NatResult<()> {
        self.mechanism()
            .await?
            .delete_mapping(protocol, external_port, internal_port)
            .await
    }
}

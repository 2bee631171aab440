//! Scripted NAT mechanism for tests.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tos_bootnode_common::tokio::{sync::Mutex, time::sleep};

use super::{NatError, NatMechanism, NatResult, Protocol};

/// Records every call. `external` is what the gateway reports, `stall`
/// makes the external IP lookup hang, `fail_mapping` makes the gateway
/// refuse every mapping.
#[derive(Default)]
pub(crate) struct Recorder {
    pub external: Option<IpAddr>,
    pub stall: bool,
    pub fail_mapping: bool,
    pub calls: Mutex<Vec<&'static str>>,
}

impl Recorder {
    pub async fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().await.clone()
    }
}

impl fmt::Display for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("recorder")
    }
}

#[async_trait]
impl NatMechanism for Recorder {
    async fn external_ip(&self) -> NatResult<IpAddr> {
        self.calls.lock().await.push("external_ip");
        if self.stall {
            sleep(Duration::from_secs(60)).await;
        }
        self.external.ok_or(NatError::NoGateway)
    }

    async fn add_mapping(&self, _: Protocol, external_port: u16, _: u16, _: &str, _: Duration) -> NatResult<u16> {
        self.calls.lock().await.push("add");
        if self.fail_mapping {
            return Err(NatError::Gateway("mapping refused".to_string()));
        }
        Ok(external_port)
    }

    async fn delete_mapping(&self, _: Protocol, _: u16, _: u16) -> NatResult<()> {
        self.calls.lock().await.push("delete");
        Ok(())
    }
}

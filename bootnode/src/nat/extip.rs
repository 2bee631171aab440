use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;

use super::{NatMechanism, NatResult, Protocol};

/// Externally reachable IP configured by hand. Ports are assumed to be
/// forwarded already.
#[derive(Debug, Clone, Copy)]
pub struct ExtIp(IpAddr);

impl ExtIp {
    pub fn new(ip: IpAddr) -> Self {
        Self(ip)
    }
}

impl fmt::Display for ExtIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExtIP({})", self.0)
    }
}

#[async_trait]
impl NatMechanism for ExtIp {
    async fn external_ip(&self) -> NatResult<IpAddr> {
        Ok(self.0)
    }

    async fn add_mapping(&self, _: Protocol, external_port: u16, _: u16, _: &str, _: Duration) -> NatResult<u16> {
        Ok(external_port)
    }

    async fn delete_mapping(&self, _: Protocol, _: u16, _: u16) -> NatResult<()> {
        Ok(())
    }
}

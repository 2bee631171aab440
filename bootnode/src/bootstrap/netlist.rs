//! CIDR lists used to restrict which peers the engines talk to.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetlistError {
    #[error("invalid CIDR '{0}'")]
    InvalidCidr(String),

    #[error("prefix length {prefix} too long for '{cidr}'")]
    PrefixTooLong { cidr: String, prefix: u8 },
}

/// A network in CIDR notation. Host bits are cleared on parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpNet {
    V4(Ipv4Addr, u8),
    V6(Ipv6Addr, u8),
}

fn mask_v4(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - p as u32),
    }
}

fn mask_v6(prefix: u8) -> u128 {
    match prefix {
        0 => 0,
        p => u128::MAX << (128 - p as u32),
    }
}

impl IpNet {
    pub fn prefix(&self) -> u8 {
        match self {
            Self::V4(_, prefix) | Self::V6(_, prefix) => *prefix,
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self, ip) {
            (Self::V4(net, prefix), IpAddr::V4(ip)) => {
                u32::from(ip) & mask_v4(*prefix) == u32::from(*net)
            }
            (Self::V4(..), IpAddr::V6(ip)) => match ip.to_ipv4_mapped() {
                Some(v4) => self.contains(IpAddr::V4(v4)),
                None => false,
            },
            (Self::V6(net, prefix), IpAddr::V6(ip)) => {
                u128::from(ip) & mask_v6(*prefix) == u128::from(*net)
            }
            (Self::V6(..), IpAddr::V4(ip)) => self.contains(IpAddr::V6(ip.to_ipv6_mapped())),
        }
    }
}

impl FromStr for IpNet {
    type Err = NetlistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetlistError::InvalidCidr(s.to_string());
        let (ip, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let ip: IpAddr = ip.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;

        match ip {
            IpAddr::V4(ip) if prefix <= 32 => Ok(Self::V4(Ipv4Addr::from(u32::from(ip) & mask_v4(prefix)), prefix)),
            IpAddr::V6(ip) if prefix <= 128 => {
                Ok(Self::V6(Ipv6Addr::from(u128::from(ip) & mask_v6(prefix)), prefix))
            }
            _ => Err(NetlistError::PrefixTooLong {
                cidr: s.to_string(),
                prefix,
            }),
        }
    }
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(ip, prefix) => write!(f, "{}/{}", ip, prefix),
            Self::V6(ip, prefix) => write!(f, "{}/{}", ip, prefix),
        }
    }
}

/// Immutable set of networks. An address is allowed when any of them
/// contains it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Netlist {
    networks: Vec<IpNet>,
}

impl Netlist {
    /// Parse a comma separated list of CIDRs.
    ///
    /// Returns `None` when the list holds no entries, meaning no restriction.
    pub fn parse(list: &str) -> Result<Option<Netlist>, NetlistError> {
        let networks = list
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(IpNet::from_str)
            .collect::<Result<Vec<_>, _>>()?;

        if networks.is_empty() {
            return Ok(None);
        }
        Ok(Some(Netlist { networks }))
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|net| net.contains(ip))
    }

    pub fn networks(&self) -> &[IpNet] {
        &self.networks
    }
}

impl fmt::Display for Netlist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, net) in self.networks.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", net)?;
        }
        Ok(())
    }
}

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use tos_bootnode_common::serializer::{Reader, ReaderError, Serializer, Writer};

use super::error::ScionError;

/// AS numbers are 48 bits wide.
pub const MAX_AS: u64 = (1 << 48) - 1;

/// Largest AS number that may be written in decimal (BGP range).
const MAX_BGP_AS: u64 = u32::MAX as u64;

/// Isolation domain and autonomous system of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IsdAs {
    pub isd: u16,
    pub asn: u64,
}

impl IsdAs {
    pub fn new(isd: u16, asn: u64) -> Self {
        Self { isd, asn }
    }

    fn to_u64(self) -> u64 {
        (u64::from(self.isd) << 48) | (self.asn & MAX_AS)
    }

    fn from_u64(value: u64) -> Self {
        Self {
            isd: (value >> 48) as u16,
            asn: value & MAX_AS,
        }
    }
}

fn parse_as(value: &str) -> Option<u64> {
    if !value.contains(':') {
        return value.parse::<u64>().ok().filter(|asn| *asn <= MAX_BGP_AS);
    }

    let groups: Vec<&str> = value.split(':').collect();
    if groups.len() != 3 {
        return None;
    }
    groups.iter().try_fold(0u64, |acc, group| {
        if group.is_empty() || group.len() > 4 {
            return None;
        }
        u16::from_str_radix(group, 16)
            .ok()
            .map(|g| (acc << 16) | u64::from(g))
    })
}

impl FromStr for IsdAs {
    type Err = ScionError;

    /// `1-ff00:0:110` or `1-64512`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ScionError::InvalidIsdAs(s.to_string());
        let (isd, asn) = s.split_once('-').ok_or_else(invalid)?;
        let isd = isd.parse::<u16>().map_err(|_| invalid())?;
        let asn = parse_as(asn).ok_or_else(invalid)?;
        Ok(Self { isd, asn })
    }
}

impl fmt::Display for IsdAs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.asn <= MAX_BGP_AS {
            write!(f, "{}-{}", self.isd, self.asn)
        } else {
            write!(
                f,
                "{}-{:x}:{:x}:{:x}",
                self.isd,
                (self.asn >> 32) & 0xffff,
                (self.asn >> 16) & 0xffff,
                self.asn & 0xffff
            )
        }
    }
}

/// Path-aware address: `<ISD>-<AS>,[<host>]:<port>`. The port may be
/// omitted, in which case the dispatcher picks one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScionAddr {
    pub ia: IsdAs,
    pub host: IpAddr,
    pub port: u16,
}

impl ScionAddr {
    pub fn new(ia: IsdAs, host: IpAddr, port: u16) -> Self {
        Self { ia, host, port }
    }

    pub fn with_port(&self, port: u16) -> Self {
        Self { port, ..self.clone() }
    }
}

impl FromStr for ScionAddr {
    type Err = ScionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| ScionError::InvalidAddress(s.to_string(), reason);

        let (ia, rest) = s
            .trim()
            .split_once(',')
            .ok_or_else(|| invalid("expected <ISD>-<AS>,[<host>]:<port>"))?;
        let ia = ia.parse::<IsdAs>()?;

        let rest = rest
            .strip_prefix('[')
            .ok_or_else(|| invalid("host must be enclosed in brackets"))?;
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| invalid("missing closing bracket"))?;
        let host = host
            .parse::<IpAddr>()
            .map_err(|_| invalid("host is not an IP address"))?;

        let port = match rest {
            "" => 0,
            _ => rest
                .strip_prefix(':')
                .and_then(|p| p.parse::<u16>().ok())
                .ok_or_else(|| invalid("invalid port"))?,
        };

        Ok(Self { ia, host, port })
    }
}

impl fmt::Display for ScionAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},[{}]:{}", self.ia, self.host, self.port)
    }
}

impl Serializer for ScionAddr {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let ia = IsdAs::from_u64(reader.read_u64()?);
        let host = match reader.read_u8()? {
            4 => IpAddr::V4(Ipv4Addr::from(reader.read_bytes::<4>()?)),
            6 => IpAddr::V6(Ipv6Addr::from(reader.read_bytes::<16>()?)),
            _ => return Err(ReaderError::InvalidValue),
        };
        Ok(Self {
            ia,
            host,
            port: reader.read_u16()?,
        })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_u64(&self.ia.to_u64());
        match self.host {
            IpAddr::V4(ip) => {
                writer.write_u8(4);
                writer.write_bytes(&ip.octets());
            }
            IpAddr::V6(ip) => {
                writer.write_u8(6);
                writer.write_bytes(&ip.octets());
            }
        }
        writer.write_u16(self.port);
    }

    fn size(&self) -> usize {
        8 + 1 + if self.host.is_ipv4() { 4 } else { 16 } + 2
    }
}

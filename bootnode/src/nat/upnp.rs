//! UPnP Internet Gateway Device client.
//!
//! The gateway is located with an SSDP search, its description fetched over
//! HTTP, and the WAN connection service driven with SOAP calls.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use log::{debug, trace};
use regex::Regex;
use reqwest::{Client, Url};
use tos_bootnode_common::tokio::{
    net::UdpSocket,
    sync::OnceCell,
    time::{timeout, Instant},
};

use super::{NatError, NatMechanism, NatResult, Protocol};

const SSDP_ADDR: &str = "239.255.255.250:1900";
const SEARCH_TARGET: &str = "urn:schemas-upnp-org:device:InternetGatewayDevice:1";
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

lazy_static! {
    static ref SERVICE_BLOCK: Regex = Regex::new(r"(?s)<service>(.*?)</service>").expect("valid regex");
    static ref SERVICE_TYPE: Regex =
        Regex::new(r"<serviceType>\s*(urn:schemas-upnp-org:service:WAN(?:IP|PPP)Connection:\d)\s*</serviceType>")
            .expect("valid regex");
    static ref CONTROL_URL: Regex = Regex::new(r"<controlURL>\s*([^<\s]+)\s*</controlURL>").expect("valid regex");
    static ref EXTERNAL_IP: Regex =
        Regex::new(r"<NewExternalIPAddress>\s*([^<\s]*)\s*</NewExternalIPAddress>").expect("valid regex");
}

fn search_request() -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\nHOST: {}\r\nST: {}\r\nMAN: \"ssdp:discover\"\r\nMX: 2\r\n\r\n",
        SSDP_ADDR, SEARCH_TARGET
    )
}

/// `LOCATION` header of an SSDP response.
fn parse_ssdp_location(response: &str) -> Option<String> {
    response.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("location")
            .then(|| value.trim().to_string())
    })
}

/// Service type and control URL of the first WAN connection service.
fn find_control_url(description: &str) -> Option<(String, String)> {
    SERVICE_BLOCK.captures_iter(description).find_map(|block| {
        let body = block.get(1)?.as_str();
        let service = SERVICE_TYPE.captures(body)?.get(1)?.as_str().to_string();
        let control = CONTROL_URL.captures(body)?.get(1)?.as_str().to_string();
        Some((service, control))
    })
}

fn parse_external_ip(response: &str) -> NatResult<IpAddr> {
    let value = EXTERNAL_IP
        .captures(response)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| NatError::Gateway("no NewExternalIPAddress in response".to_string()))?;
    value
        .parse()
        .map_err(|_| NatError::Gateway(format!("gateway reported invalid IP '{}'", value)))
}

fn soap_envelope(service: &str, action: &str, args: &[(&str, String)]) -> String {
    let args: String = args
        .iter()
        .map(|(name, value)| format!("<{0}>{1}</{0}>", name, value))
        .collect();
    format!(
        "<?xml version=\"1.0\"?>\
<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
<s:Body><u:{action} xmlns:u=\"{service}\">{args}</u:{action}></s:Body></s:Envelope>",
        action = action,
        service = service,
        args = args
    )
}

#[derive(Debug, Clone)]
struct Gateway {
    control_url: Url,
    service: String,
    /// Our address on the gateway's network.
    local_ip: IpAddr,
}

#[derive(Debug)]
pub struct Upnp {
    client: Client,
    gateway: OnceCell<Gateway>,
}

impl Default for Upnp {
    fn default() -> Self {
        Self::new()
    }
}

impl Upnp {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            gateway: OnceCell::new(),
        }
    }

    async fn gateway(&self) -> NatResult<&Gateway> {
        self.gateway.get_or_try_init(|| self.discover()).await
    }

    async fn discover(&self) -> NatResult<Gateway> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.send_to(search_request().as_bytes(), SSDP_ADDR).await?;

        let deadline = Instant::now() + DISCOVERY_TIMEOUT;
        let mut buf = vec![0u8; 2048];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (len, from) = match timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(received) => received?,
                Err(_) => return Err(NatError::NoGateway),
            };
            let response = String::from_utf8_lossy(&buf[..len]);
            let Some(location) = parse_ssdp_location(&response) else {
                if log::log_enabled!(log::Level::Trace) {
                    trace!("SSDP response from {} without location", from);
                }
                continue;
            };

            match self.describe(&location, from).await {
                Ok(gateway) => {
                    if log::log_enabled!(log::Level::Debug) {
                        debug!("Found UPnP gateway at {} ({})", gateway.control_url, gateway.service);
                    }
                    return Ok(gateway);
                }
                Err(e) => {
                    if log::log_enabled!(log::Level::Debug) {
                        debug!("Ignoring UPnP device at {}: {}", location, e);
                    }
                }
            }
        }
    }

    async fn describe(&self, location: &str, from: SocketAddr) -> NatResult<Gateway> {
        let base = Url::parse(location).map_err(|e| NatError::Gateway(e.to_string()))?;
        let description = self.client.get(base.clone()).send().await?.text().await?;
        let (service, control) = find_control_url(&description)
            .ok_or_else(|| NatError::Gateway("no WAN connection service".to_string()))?;
        let control_url = base.join(&control).map_err(|e| NatError::Gateway(e.to_string()))?;

        let route = UdpSocket::bind("0.0.0.0:0").await?;
        route.connect(from).await?;
        let local_ip = route.local_addr()?.ip();

        Ok(Gateway {
            control_url,
            service,
            local_ip,
        })
    }

    async fn soap(&self, action: &str, args: &[(&str, String)]) -> NatResult<String> {
        let gateway = self.gateway().await?;
        let response = self
            .client
            .post(gateway.control_url.clone())
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header("SOAPAction", format!("\"{}#{}\"", gateway.service, action))
            .body(soap_envelope(&gateway.service, action, args))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(NatError::Gateway(format!("{} failed with HTTP {}", action, status)));
        }
        Ok(body)
    }
}

impl fmt::Display for Upnp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UPnP")
    }
}

#[async_trait]
impl NatMechanism for Upnp {
    async fn external_ip(&self) -> NatResult<IpAddr> {
        let body = self.soap("GetExternalIPAddress", &[]).await?;
        parse_external_ip(&body)
    }

    async fn add_mapping(
        &self,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        name: &str,
        lifetime: Duration,
    ) -> NatResult<u16> {
        let local_ip = self.gateway().await?.local_ip;
        // Some gateways refuse to update an existing mapping
        let _ = self.delete_mapping(protocol, external_port, internal_port).await;
        self.soap(
            "AddPortMapping",
            &[
                ("NewRemoteHost", String::new()),
                ("NewExternalPort", external_port.to_string()),
                ("NewProtocol", protocol.to_string()),
                ("NewInternalPort", internal_port.to_string()),
                ("NewInternalClient", local_ip.to_string()),
                ("NewEnabled", "1".to_string()),
                ("NewPortMappingDescription", name.to_string()),
                ("NewLeaseDuration", lifetime.as_secs().to_string()),
            ],
        )
        .await?;
        Ok(external_port)
    }

    async fn delete_mapping(&self, protocol: Protocol, external_port: u16, _internal_port: u16) -> NatResult<()> {
        self.soap(
            "DeletePortMapping",
            &[
                ("NewRemoteHost", String::new()),
                ("NewExternalPort", external_port.to_string()),
                ("NewProtocol", protocol.to_string()),
            ],
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTION: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:Layer3Forwarding:1</serviceType>
        <controlURL>/ctl/L3F</controlURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:WANIPConn1</serviceId>
        <controlURL>/ctl/IPConn</controlURL>
      </service>
    </serviceList>
  </device>
</root>"#;

    #[test]
    fn test_parse_ssdp_location() {
        let response = "HTTP/1.1 200 OK\r\nCACHE-CONTROL: max-age=120\r\nLocation: http://192.168.1.1:5000/rootDesc.xml\r\nST: urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\n\r\n";
        assert_eq!(
            parse_ssdp_location(response).as_deref(),
            Some("http://192.168.1.1:5000/rootDesc.xml")
        );
        assert!(parse_ssdp_location("HTTP/1.1 200 OK\r\n\r\n").is_none());
    }

    #[test]
    fn test_find_control_url() {
        let (service, control) = find_control_url(DESCRIPTION).unwrap();
        assert_eq!(service, "urn:schemas-upnp-org:service:WANIPConnection:1");
        assert_eq!(control, "/ctl/IPConn");

        let base = Url::parse("http://192.168.1.1:5000/rootDesc.xml").unwrap();
        assert_eq!(
            base.join(&control).unwrap().as_str(),
            "http://192.168.1.1:5000/ctl/IPConn"
        );
        assert!(find_control_url("<root><service></service></root>").is_none());
    }

    #[test]
    fn test_parse_external_ip() {
        let body = "<s:Envelope><s:Body><u:GetExternalIPAddressResponse><NewExternalIPAddress>203.0.113.5</NewExternalIPAddress></u:GetExternalIPAddressResponse></s:Body></s:Envelope>";
        assert_eq!(parse_external_ip(body).unwrap(), "203.0.113.5".parse::<IpAddr>().unwrap());
        assert!(parse_external_ip("<NewExternalIPAddress></NewExternalIPAddress>").is_err());
        assert!(parse_external_ip("<empty/>").is_err());
    }

    #[test]
    fn test_soap_envelope() {
        let body = soap_envelope(
            "urn:schemas-upnp-org:service:WANIPConnection:1",
            "DeletePortMapping",
            &[("NewExternalPort", "2126".to_string()), ("NewProtocol", "UDP".to_string())],
        );
        assert!(body.contains(
            "<u:DeletePortMapping xmlns:u=\"urn:schemas-upnp-org:service:WANIPConnection:1\">"
        ));
        assert!(body.contains("<NewExternalPort>2126</NewExternalPort><NewProtocol>UDP</NewProtocol>"));
        assert!(body.ends_with("</u:DeletePortMapping></s:Body></s:Envelope>"));
    }
}

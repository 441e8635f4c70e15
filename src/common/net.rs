//! Network utilities

use crate::{Error, Result};
use socket2::SockRef;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use tokio::net::TcpStream;

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// Transport network of a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tcp" | "tcp4" | "tcp6" => Ok(Network::Tcp),
            "udp" | "udp4" | "udp6" => Ok(Network::Udp),
            other => Err(Error::address(format!("unknown network: {}", other))),
        }
    }
}

/// Host part of a destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address
    Ipv4(Ipv4Addr),
    /// IPv6 address
    Ipv6(Ipv6Addr),
    /// Domain name
    Domain(String),
}

impl Address {
    /// Get as IP if resolved
    pub fn to_ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            Address::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            Address::Domain(_) => None,
        }
    }

    /// Get as host string (no brackets for IPv6)
    pub fn to_host(&self) -> String {
        match self {
            Address::Ipv4(ip) => ip.to_string(),
            Address::Ipv6(ip) => ip.to_string(),
            Address::Domain(d) => d.clone(),
        }
    }

    /// Convert to string representation
    pub fn to_string_with_port(&self, port: u16) -> String {
        match self {
            Address::Ipv4(ip) => format!("{}:{}", ip, port),
            Address::Ipv6(ip) => format!("[{}]:{}", ip, port),
            Address::Domain(d) => format!("{}:{}", d, port),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        }
    }
}

impl From<String> for Address {
    fn from(host: String) -> Self {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = trimmed.parse::<Ipv4Addr>() {
            return Address::Ipv4(ip);
        }
        if let Ok(ip) = trimmed.parse::<Ipv6Addr>() {
            return Address::Ipv6(ip);
        }
        Address::Domain(host)
    }
}

impl From<&str> for Address {
    fn from(host: &str) -> Self {
        Address::from(host.to_string())
    }
}

/// Network destination: network + address + port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub network: Network,
    pub address: Address,
    pub port: u16,
}

impl Destination {
    pub fn new(network: Network, address: Address, port: u16) -> Self {
        Destination {
            network,
            address,
            port,
        }
    }

    pub fn tcp<A: Into<Address>>(address: A, port: u16) -> Self {
        Self::new(Network::Tcp, address.into(), port)
    }

    pub fn udp<A: Into<Address>>(address: A, port: u16) -> Self {
        Self::new(Network::Udp, address.into(), port)
    }

    /// Resolve to socket addresses, in resolver order
    pub async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        if let Some(ip) = self.address.to_ip() {
            return Ok(vec![SocketAddr::new(ip, self.port)]);
        }
        let host = self.address.to_host();
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), self.port))
            .await
            .map_err(|e| Error::address(format!("failed to resolve {}: {}", host, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(Error::address(format!("no address found for {}", host)));
        }
        Ok(addrs)
    }
}

impl From<SocketAddr> for Destination {
    fn from(addr: SocketAddr) -> Self {
        Destination::tcp(Address::from(addr.ip()), addr.port())
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.address.to_string_with_port(self.port))
    }
}

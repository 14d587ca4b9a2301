//! Per-flow metadata: who is talking, to where, over what.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::Serialize;

/// Transport family of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which inbound shim accepted the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InboundKind {
    Http,
    HttpConnect,
    Socks4,
    Socks4A,
    Socks5,
    Redir,
    Tproxy,
}

impl InboundKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboundKind::Http => "HTTP",
            InboundKind::HttpConnect => "HTTP Connect",
            InboundKind::Socks4 => "Socks4",
            InboundKind::Socks4A => "Socks4a",
            InboundKind::Socks5 => "Socks5",
            InboundKind::Redir => "Redir",
            InboundKind::Tproxy => "TProxy",
        }
    }
}

impl fmt::Display for InboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination address family tag, SOCKS-style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrKind {
    Ipv4,
    Ipv6,
    Domain,
}

/// Canonical descriptor of a single flow.
///
/// Built by an inbound shim, mutated only by the tunnel during pre-handling
/// and rule matching, dropped with the flow. `valid()` is the admission
/// invariant: a flow must name its destination by host or by IP.
#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
    pub network: Network,
    pub inbound: InboundKind,
    #[serde(rename = "sourceIP")]
    pub src_ip: Option<IpAddr>,
    #[serde(rename = "sourcePort")]
    pub src_port: u16,
    #[serde(rename = "destinationIP")]
    pub dst_ip: Option<IpAddr>,
    #[serde(rename = "destinationPort")]
    pub dst_port: u16,
    /// Destination host name; empty when the client dialed an IP.
    pub host: String,
}

impl Metadata {
    pub fn new(network: Network, inbound: InboundKind) -> Self {
        Self {
            network,
            inbound,
            src_ip: None,
            src_port: 0,
            dst_ip: None,
            dst_port: 0,
            host: String::new(),
        }
    }

    pub fn valid(&self) -> bool {
        !self.host.is_empty() || self.dst_ip.is_some()
    }

    pub fn resolved(&self) -> bool {
        self.dst_ip.is_some()
    }

    pub fn addr_kind(&self) -> AddrKind {
        if !self.host.is_empty() {
            return AddrKind::Domain;
        }
        match self.dst_ip {
            Some(IpAddr::V6(_)) => AddrKind::Ipv6,
            _ => AddrKind::Ipv4,
        }
    }

    /// Destination as dialed: host when present, IP otherwise.
    pub fn target(&self) -> String {
        if !self.host.is_empty() {
            self.host.clone()
        } else if let Some(ip) = self.dst_ip {
            ip.to_string()
        } else {
            "<nil>".to_string()
        }
    }

    pub fn remote_address(&self) -> String {
        match self.dst_ip {
            Some(IpAddr::V6(ip)) if self.host.is_empty() => {
                format!("[{}]:{}", ip, self.dst_port)
            }
            _ => format!("{}:{}", self.target(), self.dst_port),
        }
    }

    pub fn source_address(&self) -> String {
        match self.src_ip {
            Some(ip) => SocketAddr::new(ip, self.src_port).to_string(),
            None => "<nil>".to_string(),
        }
    }

    /// Concrete UDP destination, when the flow is UDP and resolved.
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        if self.network != Network::Udp {
            return None;
        }
        self.dst_ip.map(|ip| SocketAddr::new(ip, self.dst_port))
    }

    pub fn set_source(&mut self, addr: SocketAddr) {
        self.src_ip = Some(addr.ip());
        self.src_port = addr.port();
    }

    pub fn set_destination(&mut self, addr: SocketAddr) {
        self.dst_ip = Some(addr.ip());
        self.dst_port = addr.port();
        self.host.clear();
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} --> {}",
            self.network,
            self.source_address(),
            self.remote_address()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_requires_host_or_ip() {
        let mut m = Metadata::new(Network::Tcp, InboundKind::Socks5);
        assert!(!m.valid());
        m.host = "example.com".into();
        assert!(m.valid());
        m.host.clear();
        m.dst_ip = Some("10.0.0.1".parse().unwrap());
        assert!(m.valid());
    }

    #[test]
    fn remote_address_prefers_host() {
        let mut m = Metadata::new(Network::Tcp, InboundKind::Http);
        m.host = "example.com".into();
        m.dst_port = 443;
        m.dst_ip = Some("1.2.3.4".parse().unwrap());
        assert_eq!(m.remote_address(), "example.com:443");
    }

    #[test]
    fn v6_remote_address_is_bracketed() {
        let mut m = Metadata::new(Network::Udp, InboundKind::Socks5);
        m.dst_ip = Some("2001:db8::1".parse().unwrap());
        m.dst_port = 53;
        assert_eq!(m.remote_address(), "[2001:db8::1]:53");
        assert_eq!(m.addr_kind(), AddrKind::Ipv6);
    }
}

//! Outbound adapter contract.
//!
//! Every outbound, sentinel or protocol, answers to the same surface: a
//! name, a kind tag, UDP capability, and the two dial operations. Group
//! adapters (the `GLOBAL` selector) additionally unwrap to the member they
//! would pick for a given flow, which the rule loop uses to skip rules whose
//! adapter resolves to `PASS`.

pub mod addr;
pub mod direct;
pub mod http;
pub mod socks5;
pub mod ssr;
pub mod vless;
pub mod vmess;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::session::Metadata;

pub use shunt_transport::IoStream as ProxyStream;

/// Closed set of adapter kinds known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Direct,
    Reject,
    Pass,
    Selector,
    Http,
    Socks5,
    Vless,
    Vmess,
    ShadowsocksR,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::Direct => "Direct",
            AdapterKind::Reject => "Reject",
            AdapterKind::Pass => "Pass",
            AdapterKind::Selector => "Selector",
            AdapterKind::Http => "Http",
            AdapterKind::Socks5 => "Socks5",
            AdapterKind::Vless => "Vless",
            AdapterKind::Vmess => "Vmess",
            AdapterKind::ShadowsocksR => "ShadowsocksR",
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound packet endpoint. Implementations are internally synchronized so
/// the forward path and the reply pump can share one handle.
#[async_trait]
pub trait OutboundDatagram: Send + Sync {
    async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize>;
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

/// Uniform dial surface over arbitrary outbound protocols.
#[async_trait]
pub trait OutboundAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> AdapterKind;

    fn supports_udp(&self) -> bool {
        false
    }

    /// Opens a full-duplex stream to the flow's destination.
    async fn connect_stream(&self, metadata: &Metadata) -> io::Result<ProxyStream>;

    /// Opens a packet endpoint for the flow. Errors by default; adapters with
    /// UDP support override.
    async fn listen_packet(&self, metadata: &Metadata) -> io::Result<Arc<dyn OutboundDatagram>> {
        let _ = metadata;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{} does not support UDP", self.name()),
        ))
    }

    /// The member a group adapter would route this flow through; `None` for
    /// plain adapters.
    fn unwrap(&self, metadata: &Metadata) -> Option<Arc<dyn OutboundAdapter>> {
        let _ = metadata;
        None
    }
}

pub fn unsupported(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, what.to_string())
}

/// Follows `unwrap` to the innermost adapter and reports whether it lands on
/// the given kind. Bounded to keep a miswired group chain from looping.
pub fn unwraps_to(
    adapter: &Arc<dyn OutboundAdapter>,
    metadata: &Metadata,
    kind: AdapterKind,
) -> bool {
    let mut current = adapter.clone();
    for _ in 0..8 {
        match current.unwrap(metadata) {
            Some(inner) => {
                if inner.kind() == kind {
                    return true;
                }
                current = inner;
            }
            None => return false,
        }
    }
    false
}

/// Name-indexed adapter map with the sentinel entries installed.
pub struct ProxyRegistry {
    map: HashMap<String, Arc<dyn OutboundAdapter>>,
}

impl ProxyRegistry {
    /// Builds the registry from user proxies, adding `DIRECT`, `REJECT`,
    /// `PASS` and a `GLOBAL` selector over everything dialable.
    pub fn build(proxies: Vec<Arc<dyn OutboundAdapter>>) -> Self {
        let mut map: HashMap<String, Arc<dyn OutboundAdapter>> = HashMap::new();
        let direct: Arc<dyn OutboundAdapter> = Arc::new(direct::Direct::new());
        let mut members: Vec<Arc<dyn OutboundAdapter>> = vec![direct.clone()];

        map.insert("DIRECT".into(), direct);
        map.insert("REJECT".into(), Arc::new(direct::Reject::new()));
        map.insert("PASS".into(), Arc::new(direct::Pass::new()));

        for proxy in proxies {
            members.push(proxy.clone());
            map.insert(proxy.name().to_string(), proxy);
        }

        map.insert("GLOBAL".into(), Arc::new(Selector::new("GLOBAL", members)));
        Self { map }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OutboundAdapter>> {
        self.map.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Manual group adapter: delegates every operation to the selected member.
pub struct Selector {
    name: String,
    members: Vec<Arc<dyn OutboundAdapter>>,
    current: RwLock<usize>,
}

impl Selector {
    pub fn new(name: impl Into<String>, members: Vec<Arc<dyn OutboundAdapter>>) -> Self {
        assert!(!members.is_empty(), "selector needs at least one member");
        Self {
            name: name.into(),
            members,
            current: RwLock::new(0),
        }
    }

    pub fn select(&self, name: &str) -> bool {
        match self.members.iter().position(|m| m.name() == name) {
            Some(idx) => {
                *self.current.write() = idx;
                true
            }
            None => false,
        }
    }

    pub fn selected(&self) -> Arc<dyn OutboundAdapter> {
        self.members[*self.current.read()].clone()
    }
}

#[async_trait]
impl OutboundAdapter for Selector {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Selector
    }

    fn supports_udp(&self) -> bool {
        self.selected().supports_udp()
    }

    async fn connect_stream(&self, metadata: &Metadata) -> io::Result<ProxyStream> {
        self.selected().connect_stream(metadata).await
    }

    async fn listen_packet(&self, metadata: &Metadata) -> io::Result<Arc<dyn OutboundDatagram>> {
        self.selected().listen_packet(metadata).await
    }

    fn unwrap(&self, _metadata: &Metadata) -> Option<Arc<dyn OutboundAdapter>> {
        Some(self.selected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{InboundKind, Network};

    fn metadata() -> Metadata {
        let mut m = Metadata::new(Network::Tcp, InboundKind::Socks5);
        m.host = "example.com".into();
        m.dst_port = 80;
        m
    }

    #[test]
    fn registry_has_sentinels() {
        let reg = ProxyRegistry::build(vec![]);
        for name in ["DIRECT", "REJECT", "PASS", "GLOBAL"] {
            assert!(reg.get(name).is_some(), "{name} missing");
        }
    }

    #[test]
    fn selector_unwraps_to_member() {
        let reg = ProxyRegistry::build(vec![]);
        let global = reg.get("GLOBAL").unwrap();
        let inner = global.unwrap(&metadata()).expect("selector unwraps");
        assert_eq!(inner.name(), "DIRECT");
        assert!(unwraps_to(&global, &metadata(), AdapterKind::Direct));
        assert!(!unwraps_to(&global, &metadata(), AdapterKind::Pass));
    }

    #[test]
    fn plain_adapter_does_not_unwrap() {
        let reg = ProxyRegistry::build(vec![]);
        let direct = reg.get("DIRECT").unwrap();
        assert!(direct.unwrap(&metadata()).is_none());
    }
}

//! Flow contexts handed from inbound shims to the engine.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::adapter::ProxyStream;
use crate::session::Metadata;

/// An accepted TCP flow: the client stream plus its metadata.
pub struct ConnContext {
    pub stream: ProxyStream,
    pub metadata: Metadata,
}

impl ConnContext {
    pub fn new(stream: ProxyStream, metadata: Metadata) -> Self {
        Self { stream, metadata }
    }
}

/// Reply path back to the client of a UDP inbound. The shim owns the socket
/// and whatever encapsulation its protocol needs (e.g. the SOCKS5 UDP
/// header); `from` is the address the payload claims to come from.
#[async_trait]
pub trait InboundDatagram: Send + Sync {
    async fn write_back(&self, buf: &[u8], from: SocketAddr) -> io::Result<usize>;
}

/// One inbound datagram plus the way home.
pub struct UdpPacket {
    pub data: Vec<u8>,
    /// Client source address; also the NAT key.
    pub src: SocketAddr,
    pub writeback: Arc<dyn InboundDatagram>,
}

/// A UDP submission: packet plus metadata.
pub struct PacketContext {
    pub packet: UdpPacket,
    pub metadata: Metadata,
}

impl PacketContext {
    pub fn new(packet: UdpPacket, metadata: Metadata) -> Self {
        Self { packet, metadata }
    }

    pub fn nat_key(&self) -> String {
        self.packet.src.to_string()
    }
}

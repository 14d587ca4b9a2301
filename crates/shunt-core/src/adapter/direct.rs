//! Sentinel adapters: `DIRECT`, `REJECT` and `PASS`.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};

use super::{AdapterKind, OutboundAdapter, OutboundDatagram, ProxyStream};
use crate::net::bind_udp_with_retry;
use crate::session::Metadata;

/// Dials the operating system directly.
pub struct Direct {
    name: String,
}

impl Direct {
    pub fn new() -> Self {
        Self {
            name: "DIRECT".into(),
        }
    }
}

impl Default for Direct {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboundAdapter for Direct {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Direct
    }

    fn supports_udp(&self) -> bool {
        true
    }

    async fn connect_stream(&self, metadata: &Metadata) -> io::Result<ProxyStream> {
        let stream = match metadata.dst_ip {
            Some(ip) => TcpStream::connect(SocketAddr::new(ip, metadata.dst_port)).await?,
            None => TcpStream::connect((metadata.host.as_str(), metadata.dst_port)).await?,
        };
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }

    async fn listen_packet(&self, _metadata: &Metadata) -> io::Result<Arc<dyn OutboundDatagram>> {
        let socket = bind_udp_with_retry(5, std::time::Duration::from_millis(200)).await?;
        Ok(Arc::new(DirectDatagram { socket }))
    }
}

struct DirectDatagram {
    socket: UdpSocket,
}

#[async_trait]
impl OutboundDatagram for DirectDatagram {
    async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, dst).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

/// Swallows the flow: reads EOF immediately, writes fail.
pub struct Reject {
    name: String,
}

impl Reject {
    pub fn new() -> Self {
        Self {
            name: "REJECT".into(),
        }
    }
}

impl Default for Reject {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboundAdapter for Reject {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Reject
    }

    fn supports_udp(&self) -> bool {
        true
    }

    async fn connect_stream(&self, _metadata: &Metadata) -> io::Result<ProxyStream> {
        Ok(Box::new(NopStream))
    }

    async fn listen_packet(&self, _metadata: &Metadata) -> io::Result<Arc<dyn OutboundDatagram>> {
        Err(io::Error::other("match reject rule"))
    }
}

/// Never dialed: rules resolving here are skipped by the matcher.
pub struct Pass {
    name: String,
}

impl Pass {
    pub fn new() -> Self {
        Self {
            name: "PASS".into(),
        }
    }
}

impl Default for Pass {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboundAdapter for Pass {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Pass
    }

    fn supports_udp(&self) -> bool {
        true
    }

    async fn connect_stream(&self, _metadata: &Metadata) -> io::Result<ProxyStream> {
        Err(io::Error::other("match Pass rule"))
    }

    async fn listen_packet(&self, _metadata: &Metadata) -> io::Result<Arc<dyn OutboundDatagram>> {
        Err(io::Error::other("match Pass rule"))
    }
}

/// Stream that is already over.
struct NopStream;

impl AsyncRead for NopStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for NopStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

//! VLESS outbound.
//!
//! Request: `[VERSION=0, UUID(16), ADDON_LEN, ADDONS, CMD, PORT(2 BE), ATYP,
//! ADDR]`. The response (`[VERSION, ADDON_LEN, ADDONS]`) precedes the first
//! server payload and is consumed lazily on the first read, so the dial
//! returns without waiting for the server to speak.
//!
//! UDP rides the stream as 2-byte big-endian length-prefixed chunks.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use uuid::Uuid;

use shunt_transport::Dialer;

use super::addr::TargetAddr;
use super::{AdapterKind, OutboundAdapter, OutboundDatagram, ProxyStream};
use crate::session::Metadata;

pub const VERSION: u8 = 0;
const CMD_TCP: u8 = 0x01;
const CMD_UDP: u8 = 0x02;
/// Max payload carried by one UDP chunk.
const MAX_CHUNK: usize = 8192;

pub struct VlessConfig {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub uuid: Uuid,
    pub udp: bool,
}

pub struct VlessOutbound {
    config: VlessConfig,
    dialer: Arc<dyn Dialer>,
}

impl VlessOutbound {
    pub fn new(config: VlessConfig, dialer: Arc<dyn Dialer>) -> Self {
        Self { config, dialer }
    }

    fn encode_request(&self, target: &TargetAddr, command: u8) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.push(VERSION);
        buf.extend_from_slice(self.config.uuid.as_bytes());
        buf.push(0); // no addons
        buf.push(command);
        target.write_port_first(&mut buf);
        buf
    }

    async fn open(&self, target: &TargetAddr, command: u8) -> io::Result<ProxyStream> {
        let mut stream = self
            .dialer
            .connect(&self.config.server, self.config.port)
            .await
            .map_err(|e| io::Error::other(e.to_string()))?;
        stream.write_all(&self.encode_request(target, command)).await?;
        Ok(Box::new(VlessStream {
            inner: stream,
            response: ResponseState::Version,
        }))
    }
}

#[async_trait]
impl OutboundAdapter for VlessOutbound {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Vless
    }

    fn supports_udp(&self) -> bool {
        self.config.udp
    }

    async fn connect_stream(&self, metadata: &Metadata) -> io::Result<ProxyStream> {
        let target = TargetAddr::from_metadata(metadata)?;
        self.open(&target, CMD_TCP).await
    }

    async fn listen_packet(&self, metadata: &Metadata) -> io::Result<Arc<dyn OutboundDatagram>> {
        let target = TargetAddr::from_metadata(metadata)?;
        let stream = self.open(&target, CMD_UDP).await?;
        // Replies come from the one target the stream is bound to.
        let raddr = metadata
            .udp_addr()
            .unwrap_or_else(|| SocketAddr::new([0, 0, 0, 0].into(), target.port()));
        let (read, write) = tokio::io::split(stream);
        Ok(Arc::new(VlessDatagram {
            read: Mutex::new(ChunkReader { half: read, remain: 0 }),
            write: Mutex::new(write),
            raddr,
        }))
    }
}

enum ResponseState {
    Version,
    Addons { remaining: usize },
    Done,
}

/// Pass-through stream that strips the response header off the read side.
struct VlessStream {
    inner: ProxyStream,
    response: ResponseState,
}

impl AsyncRead for VlessStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            match self.response {
                ResponseState::Done => return Pin::new(&mut self.inner).poll_read(cx, buf),
                ResponseState::Version => {
                    let mut head = [0u8; 2];
                    let mut head_buf = ReadBuf::new(&mut head);
                    match Pin::new(&mut self.inner).poll_read(cx, &mut head_buf) {
                        Poll::Ready(Ok(())) => {
                            match head_buf.filled().len() {
                                0 => return Poll::Ready(Ok(())), // EOF before response
                                n => {
                                    if head[0] != VERSION {
                                        return Poll::Ready(Err(io::Error::new(
                                            io::ErrorKind::InvalidData,
                                            "unexpected response version",
                                        )));
                                    }
                                    if n == 2 {
                                        self.response = ResponseState::Addons {
                                            remaining: head[1] as usize,
                                        };
                                    } else {
                                        // only the version byte arrived; addon
                                        // length comes next
                                        self.response = ResponseState::Addons { remaining: usize::MAX };
                                    }
                                }
                            }
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                ResponseState::Addons { remaining } => {
                    if remaining == usize::MAX {
                        // still owe the addon-length byte
                        let mut len = [0u8; 1];
                        let mut len_buf = ReadBuf::new(&mut len);
                        match Pin::new(&mut self.inner).poll_read(cx, &mut len_buf) {
                            Poll::Ready(Ok(())) => {
                                if len_buf.filled().is_empty() {
                                    return Poll::Ready(Ok(()));
                                }
                                self.response = ResponseState::Addons {
                                    remaining: len[0] as usize,
                                };
                            }
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        }
                    } else if remaining == 0 {
                        self.response = ResponseState::Done;
                    } else {
                        // addon bytes are discarded
                        let mut scratch = [0u8; 64];
                        let want = remaining.min(scratch.len());
                        let mut scratch_buf = ReadBuf::new(&mut scratch[..want]);
                        match Pin::new(&mut self.inner).poll_read(cx, &mut scratch_buf) {
                            Poll::Ready(Ok(())) => {
                                let got = scratch_buf.filled().len();
                                if got == 0 {
                                    return Poll::Ready(Ok(()));
                                }
                                self.response = ResponseState::Addons {
                                    remaining: remaining - got,
                                };
                            }
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        }
                    }
                }
            }
        }
    }
}

impl AsyncWrite for VlessStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

struct ChunkReader {
    half: ReadHalf<ProxyStream>,
    /// Unread bytes of the current chunk.
    remain: usize,
}

/// Length-prefixed UDP over the VLESS stream, pinned to one destination.
struct VlessDatagram {
    read: Mutex<ChunkReader>,
    write: Mutex<WriteHalf<ProxyStream>>,
    raddr: SocketAddr,
}

#[async_trait]
impl OutboundDatagram for VlessDatagram {
    async fn send_to(&self, buf: &[u8], _dst: SocketAddr) -> io::Result<usize> {
        let mut write = self.write.lock().await;
        let mut sent = 0;
        // oversize packets are split across chunks
        for chunk in buf.chunks(MAX_CHUNK).chain(buf.is_empty().then_some(&[][..])) {
            let mut frame = Vec::with_capacity(chunk.len() + 2);
            frame.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
            frame.extend_from_slice(chunk);
            write.write_all(&frame).await?;
            sent += chunk.len();
        }
        Ok(sent)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut read = self.read.lock().await;
        if read.remain == 0 {
            let mut len = [0u8; 2];
            read.half.read_exact(&mut len).await?;
            read.remain = u16::from_be_bytes(len) as usize;
        }
        let want = read.remain.min(buf.len());
        if want == 0 {
            return Ok((0, self.raddr));
        }
        let n = read.half.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        read.remain -= n;
        Ok((n, self.raddr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{InboundKind, Network};

    fn outbound() -> VlessOutbound {
        VlessOutbound::new(
            VlessConfig {
                name: "v".into(),
                server: "server".into(),
                port: 443,
                uuid: Uuid::new_v4(),
                udp: true,
            },
            Arc::new(shunt_transport::TcpDialer),
        )
    }

    #[test]
    fn request_layout() {
        let ob = outbound();
        let target = TargetAddr::Domain("example.com".into(), 80);
        let req = ob.encode_request(&target, CMD_TCP);
        assert_eq!(req[0], VERSION);
        assert_eq!(req[17], 0); // addon length
        assert_eq!(req[18], CMD_TCP);
        assert_eq!(&req[19..21], &[0x00, 0x50]); // port, big endian
        assert_eq!(req[21], super::super::addr::ATYP_DOMAIN);
        assert_eq!(req[22] as usize, "example.com".len());
    }

    #[tokio::test]
    async fn response_header_is_stripped() {
        let (near, far) = tokio::io::duplex(256);
        let mut stream = VlessStream {
            inner: Box::new(near),
            response: ResponseState::Version,
        };
        let (mut fr, mut fw) = tokio::io::split(far);
        // version 0, 2 addon bytes discarded, then payload
        fw.write_all(&[0, 2, 0xaa, 0xbb]).await.unwrap();
        fw.write_all(b"data").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"data");

        stream.write_all(b"up").await.unwrap();
        let mut buf = [0u8; 2];
        fr.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"up");
    }

    #[tokio::test]
    async fn bad_response_version_errors() {
        let (near, far) = tokio::io::duplex(64);
        let mut stream = VlessStream {
            inner: Box::new(near),
            response: ResponseState::Version,
        };
        let (_fr, mut fw) = tokio::io::split(far);
        fw.write_all(&[9, 0]).await.unwrap();
        let mut buf = [0u8; 1];
        assert!(stream.read_exact(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn udp_chunks_round_trip() {
        let (near, far) = tokio::io::duplex(1 << 16);
        let near: ProxyStream = Box::new(near);
        let (read, write) = tokio::io::split(near);
        let dg = VlessDatagram {
            read: Mutex::new(ChunkReader { half: read, remain: 0 }),
            write: Mutex::new(write),
            raddr: "1.2.3.4:53".parse().unwrap(),
        };
        let (mut fr, mut fw) = tokio::io::split(far);

        let dst: SocketAddr = "1.2.3.4:53".parse().unwrap();
        dg.send_to(b"hello", dst).await.unwrap();
        let mut frame = [0u8; 7];
        fr.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame[..2], &[0, 5]);
        assert_eq!(&frame[2..], b"hello");

        fw.write_all(&[0, 3]).await.unwrap();
        fw.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = dg.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");
        assert_eq!(from, dst);
    }

    #[test]
    fn metadata_udp_command() {
        let ob = outbound();
        let mut m = Metadata::new(Network::Udp, InboundKind::Socks5);
        m.dst_ip = Some("8.8.8.8".parse().unwrap());
        m.dst_port = 53;
        let target = TargetAddr::from_metadata(&m).unwrap();
        let req = ob.encode_request(&target, CMD_UDP);
        assert_eq!(req[18], CMD_UDP);
    }
}

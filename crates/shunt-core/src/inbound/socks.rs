//! SOCKS inbound: versions 4, 4A and 5, plus the SOCKS5 UDP associate path.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, warn};

use super::Authenticator;
use crate::adapter::addr::{ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
use crate::session::{InboundKind, Metadata, Network};
use crate::tunnel::{ConnContext, InboundDatagram, PacketContext, Tunnel, UdpPacket};

pub const SOCKS4_VERSION: u8 = 0x04;
pub const SOCKS5_VERSION: u8 = 0x05;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

// SOCKS4 reply codes
pub const REQUEST_GRANTED: u8 = 90;
pub const REQUEST_REJECTED: u8 = 91;
pub const REQUEST_IDENTD_FAILED: u8 = 92;
pub const REQUEST_IDENTD_MISMATCHED: u8 = 93;

pub async fn serve(
    listener: TcpListener,
    tunnel: Tunnel,
    auth: Option<Arc<Authenticator>>,
) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let tunnel = tunnel.clone();
        let auth = auth.clone();
        tokio::spawn(async move {
            if let Err(e) = handle(stream, peer, tunnel, auth).await {
                debug!(peer = %peer, error = %e, "socks inbound closed");
            }
        });
    }
}

pub(crate) async fn handle(
    mut stream: TcpStream,
    peer: SocketAddr,
    tunnel: Tunnel,
    auth: Option<Arc<Authenticator>>,
) -> io::Result<()> {
    let mut version = [0u8; 1];
    stream.read_exact(&mut version).await?;
    match version[0] {
        SOCKS4_VERSION => handle_socks4(stream, peer, tunnel, auth).await,
        SOCKS5_VERSION => handle_socks5(stream, peer, tunnel, auth).await,
        v => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported socks version {v}"),
        )),
    }
}

/// SOCKS4/4A server handshake. The version byte is already consumed.
async fn handle_socks4(
    mut stream: TcpStream,
    peer: SocketAddr,
    tunnel: Tunnel,
    auth: Option<Arc<Authenticator>>,
) -> io::Result<()> {
    let mut req = [0u8; 7];
    stream.read_exact(&mut req).await?;
    let command = req[0];
    let port = u16::from_be_bytes([req[1], req[2]]);
    let ip = Ipv4Addr::new(req[3], req[4], req[5], req[6]);

    let user_id = read_until_null(&mut stream).await?;

    // 0.0.0.x with x != 0 marks a 4A request carrying a host name
    let mut host = String::new();
    if is_reserved(ip) {
        let raw = read_until_null(&mut stream).await?;
        host = String::from_utf8_lossy(&raw).into_owned();
    }

    // unsupported commands abort the handshake with no reply
    if command != CMD_CONNECT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "socks4 command not supported",
        ));
    }

    // SOCKS4 only knows user-id auth
    if let Some(auth) = &auth {
        let user = String::from_utf8_lossy(&user_id);
        if !auth.verify(&user, "") {
            reply_socks4(&mut stream, REQUEST_IDENTD_MISMATCHED, port, ip).await?;
            return Err(io::Error::other("socks4 user-id rejected"));
        }
    }
    reply_socks4(&mut stream, REQUEST_GRANTED, port, ip).await?;

    let kind = if host.is_empty() {
        InboundKind::Socks4
    } else {
        InboundKind::Socks4A
    };
    let mut metadata = Metadata::new(Network::Tcp, kind);
    metadata.set_source(peer);
    metadata.dst_port = port;
    if host.is_empty() {
        metadata.dst_ip = Some(IpAddr::V4(ip));
    } else {
        metadata.host = host;
    }

    submit_tcp(&tunnel, stream, metadata).await
}

async fn reply_socks4<S: AsyncWrite + Unpin>(
    stream: &mut S,
    code: u8,
    port: u16,
    ip: Ipv4Addr,
) -> io::Result<()> {
    let mut reply = [0u8; 8];
    reply[1] = code;
    reply[2..4].copy_from_slice(&port.to_be_bytes());
    reply[4..8].copy_from_slice(&ip.octets());
    stream.write_all(&reply).await
}

fn is_reserved(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 0 && o[1] == 0 && o[2] == 0 && o[3] != 0
}

async fn read_until_null<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == 0 {
            return Ok(out);
        }
        if out.len() > 512 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "socks4 field too long",
            ));
        }
        out.push(byte[0]);
    }
}

/// SOCKS5 server handshake. The version byte is already consumed.
async fn handle_socks5(
    mut stream: TcpStream,
    peer: SocketAddr,
    tunnel: Tunnel,
    auth: Option<Arc<Authenticator>>,
) -> io::Result<()> {
    let mut nmethods = [0u8; 1];
    stream.read_exact(&mut nmethods).await?;
    let mut methods = vec![0u8; nmethods[0] as usize];
    stream.read_exact(&mut methods).await?;

    match &auth {
        Some(auth) if !auth.is_empty() => {
            if !methods.contains(&0x02) {
                stream.write_all(&[SOCKS5_VERSION, 0xff]).await?;
                return Err(io::Error::other("client offers no user/pass auth"));
            }
            stream.write_all(&[SOCKS5_VERSION, 0x02]).await?;

            let mut head = [0u8; 2];
            stream.read_exact(&mut head).await?;
            let mut user = vec![0u8; head[1] as usize];
            stream.read_exact(&mut user).await?;
            let mut plen = [0u8; 1];
            stream.read_exact(&mut plen).await?;
            let mut pass = vec![0u8; plen[0] as usize];
            stream.read_exact(&mut pass).await?;

            let ok = auth.verify(
                &String::from_utf8_lossy(&user),
                &String::from_utf8_lossy(&pass),
            );
            stream.write_all(&[0x01, if ok { 0x00 } else { 0x01 }]).await?;
            if !ok {
                return Err(io::Error::other("socks5 auth rejected"));
            }
        }
        _ => {
            stream.write_all(&[SOCKS5_VERSION, 0x00]).await?;
        }
    }

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "socks5 request version mismatch",
        ));
    }
    let (host, ip, port) = read_socks5_addr(&mut stream, head[3]).await?;

    match head[1] {
        CMD_CONNECT => {
            reply_socks5(&mut stream, 0x00, listen_placeholder()).await?;
            let mut metadata = Metadata::new(Network::Tcp, InboundKind::Socks5);
            metadata.set_source(peer);
            metadata.dst_port = port;
            metadata.host = host;
            metadata.dst_ip = ip;
            submit_tcp(&tunnel, stream, metadata).await
        }
        CMD_UDP_ASSOCIATE => {
            let bind_ip = stream.local_addr()?.ip();
            let socket = Arc::new(UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await?);
            let bound = socket.local_addr()?;
            reply_socks5(&mut stream, 0x00, bound).await?;
            debug!(client = %peer, bound = %bound, "socks5 udp associate");

            let relay = tokio::spawn(udp_associate_loop(socket, tunnel.clone()));
            // the association lives as long as the control connection
            let mut sink = [0u8; 64];
            loop {
                match stream.read(&mut sink).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            relay.abort();
            Ok(())
        }
        _ => {
            reply_socks5(&mut stream, 0x07, listen_placeholder()).await?;
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "socks5 command not supported",
            ))
        }
    }
}

fn listen_placeholder() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

async fn read_socks5_addr<S: AsyncRead + Unpin>(
    stream: &mut S,
    atyp: u8,
) -> io::Result<(String, Option<IpAddr>, u16)> {
    let (host, ip) = match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await?;
            (String::new(), Some(IpAddr::from(buf)))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 16];
            stream.read_exact(&mut buf).await?;
            (String::new(), Some(IpAddr::from(buf)))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut buf = vec![0u8; len[0] as usize];
            stream.read_exact(&mut buf).await?;
            (String::from_utf8_lossy(&buf).into_owned(), None)
        }
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad socks5 address type",
            ))
        }
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok((host, ip, u16::from_be_bytes(port)))
}

async fn reply_socks5<S: AsyncWrite + Unpin>(
    stream: &mut S,
    code: u8,
    bound: SocketAddr,
) -> io::Result<()> {
    let mut reply = vec![SOCKS5_VERSION, code, 0x00];
    match bound.ip() {
        IpAddr::V4(v4) => {
            reply.push(ATYP_IPV4);
            reply.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            reply.push(ATYP_IPV6);
            reply.extend_from_slice(&v6.octets());
        }
    }
    reply.extend_from_slice(&bound.port().to_be_bytes());
    stream.write_all(&reply).await
}

async fn submit_tcp(tunnel: &Tunnel, stream: TcpStream, metadata: Metadata) -> io::Result<()> {
    let ctx = ConnContext::new(Box::new(stream), metadata);
    tunnel
        .tcp_in()
        .send(ctx)
        .await
        .map_err(|_| io::Error::other("tcp queue closed"))
}

/// Encapsulated reply path: prepend the SOCKS5 UDP header and send to the
/// client.
struct Socks5Writeback {
    socket: Arc<UdpSocket>,
    client: SocketAddr,
}

#[async_trait]
impl InboundDatagram for Socks5Writeback {
    async fn write_back(&self, buf: &[u8], from: SocketAddr) -> io::Result<usize> {
        let mut packet = vec![0u8, 0u8, 0u8];
        match from.ip() {
            IpAddr::V4(v4) => {
                packet.push(ATYP_IPV4);
                packet.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                packet.push(ATYP_IPV6);
                packet.extend_from_slice(&v6.octets());
            }
        }
        packet.extend_from_slice(&from.port().to_be_bytes());
        packet.extend_from_slice(buf);
        self.socket.send_to(&packet, self.client).await
    }
}

async fn udp_associate_loop(socket: Arc<UdpSocket>, tunnel: Tunnel) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (n, client) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "socks5 udp recv failed");
                return;
            }
        };
        let Some((host, ip, port, header_len)) = parse_udp_header(&buf[..n]) else {
            continue;
        };

        let mut metadata = Metadata::new(Network::Udp, InboundKind::Socks5);
        metadata.set_source(client);
        metadata.host = host;
        metadata.dst_ip = ip;
        metadata.dst_port = port;

        let packet = UdpPacket {
            data: buf[header_len..n].to_vec(),
            src: client,
            writeback: Arc::new(Socks5Writeback {
                socket: socket.clone(),
                client,
            }),
        };
        if tunnel
            .udp_in()
            .send(PacketContext::new(packet, metadata))
            .await
            .is_err()
        {
            return;
        }
    }
}

/// `RSV(2) FRAG ATYP ADDR PORT payload`; fragmented datagrams are dropped.
fn parse_udp_header(buf: &[u8]) -> Option<(String, Option<IpAddr>, u16, usize)> {
    if buf.len() < 4 || buf[2] != 0 {
        return None;
    }
    let atyp = buf[3];
    let (host, ip, mut off) = match atyp {
        ATYP_IPV4 => {
            if buf.len() < 8 {
                return None;
            }
            let mut o = [0u8; 4];
            o.copy_from_slice(&buf[4..8]);
            (String::new(), Some(IpAddr::from(o)), 8)
        }
        ATYP_IPV6 => {
            if buf.len() < 20 {
                return None;
            }
            let mut o = [0u8; 16];
            o.copy_from_slice(&buf[4..20]);
            (String::new(), Some(IpAddr::from(o)), 20)
        }
        ATYP_DOMAIN => {
            let len = *buf.get(4)? as usize;
            let end = 5 + len;
            if buf.len() < end {
                return None;
            }
            (
                String::from_utf8_lossy(&buf[5..end]).into_owned(),
                None,
                end,
            )
        }
        _ => return None,
    };
    if buf.len() < off + 2 {
        return None;
    }
    let port = u16::from_be_bytes([buf[off], buf[off + 1]]);
    off += 2;
    Some((host, ip, port, off))
}

/// Client-side SOCKS4 handshake, used by tests and by anything speaking to an
/// upstream SOCKS4 proxy.
pub async fn client_handshake4<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    host: &str,
    port: u16,
    user_id: &str,
) -> io::Result<()> {
    let mut req = vec![SOCKS4_VERSION, CMD_CONNECT];
    req.extend_from_slice(&port.to_be_bytes());
    let (ip, hostname) = match host.parse::<Ipv4Addr>() {
        Ok(ip) => (ip, None),
        Err(_) => {
            if host.parse::<std::net::Ipv6Addr>().is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "socks4 cannot address IPv6",
                ));
            }
            (Ipv4Addr::new(0, 0, 0, 1), Some(host))
        }
    };
    req.extend_from_slice(&ip.octets());
    req.extend_from_slice(user_id.as_bytes());
    req.push(0);
    if let Some(hostname) = hostname {
        req.extend_from_slice(hostname.as_bytes());
        req.push(0);
    }
    stream.write_all(&req).await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "socks4 reply version mismatch",
        ));
    }
    match reply[1] {
        REQUEST_GRANTED => Ok(()),
        REQUEST_REJECTED => Err(io::Error::other("request rejected or failed")),
        REQUEST_IDENTD_FAILED => Err(io::Error::other("identd unreachable")),
        REQUEST_IDENTD_MISMATCHED => Err(io::Error::other("identd user-id mismatch")),
        code => Err(io::Error::other(format!("unknown socks4 code {code}"))),
    }
}

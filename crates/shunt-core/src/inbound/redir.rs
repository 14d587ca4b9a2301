//! REDIR inbound: iptables REDIRECT hands us a connection whose original
//! destination is recovered with `SO_ORIGINAL_DST`.

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::session::{InboundKind, Metadata, Network};
use crate::tunnel::{ConnContext, Tunnel};

pub async fn serve(listener: TcpListener, tunnel: Tunnel) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let tunnel = tunnel.clone();
        tokio::spawn(async move {
            if let Err(e) = handle(stream, peer, tunnel).await {
                debug!(peer = %peer, error = %e, "redir inbound closed");
            }
        });
    }
}

async fn handle(stream: TcpStream, peer: SocketAddr, tunnel: Tunnel) -> io::Result<()> {
    let original = original_dst(&stream)?;
    let mut metadata = Metadata::new(Network::Tcp, InboundKind::Redir);
    metadata.set_source(peer);
    metadata.set_destination(original);

    tunnel
        .tcp_in()
        .send(ConnContext::new(Box::new(stream), metadata))
        .await
        .map_err(|_| io::Error::other("tcp queue closed"))
}

#[cfg(target_os = "linux")]
fn original_dst(stream: &TcpStream) -> io::Result<SocketAddr> {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use std::os::fd::AsRawFd;

    let fd = stream.as_raw_fd();

    // IPv4 first, IPv6 REDIRECT afterwards
    unsafe {
        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        if libc::getsockopt(
            fd,
            libc::SOL_IP,
            libc::SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        ) == 0
        {
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);
            return Ok(SocketAddr::new(IpAddr::V4(ip), port));
        }

        let mut addr6: libc::sockaddr_in6 = std::mem::zeroed();
        let mut len6 = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        if libc::getsockopt(
            fd,
            libc::SOL_IPV6,
            libc::SO_ORIGINAL_DST,
            &mut addr6 as *mut _ as *mut libc::c_void,
            &mut len6,
        ) == 0
        {
            let ip = Ipv6Addr::from(addr6.sin6_addr.s6_addr);
            let port = u16::from_be(addr6.sin6_port);
            return Ok(SocketAddr::new(IpAddr::V6(ip), port));
        }
    }
    Err(io::Error::last_os_error())
}

#[cfg(not(target_os = "linux"))]
fn original_dst(_stream: &TcpStream) -> io::Result<SocketAddr> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "redir requires linux",
    ))
}

//! TPROXY inbound (TCP). With `IP_TRANSPARENT` on the listener the accepted
//! socket's local address *is* the original destination.

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::session::{InboundKind, Metadata, Network};
use crate::tunnel::{ConnContext, Tunnel};

/// Binds a TPROXY listener.
#[cfg(target_os = "linux")]
pub async fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    set_transparent(&socket)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

#[cfg(target_os = "linux")]
fn set_transparent(socket: &socket2::Socket) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let enable: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_IP,
            libc::IP_TRANSPARENT,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub async fn bind(_addr: SocketAddr) -> io::Result<TcpListener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "tproxy requires linux",
    ))
}

pub async fn serve(listener: TcpListener, tunnel: Tunnel) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let tunnel = tunnel.clone();
        tokio::spawn(async move {
            if let Err(e) = handle(stream, peer, tunnel).await {
                debug!(peer = %peer, error = %e, "tproxy inbound closed");
            }
        });
    }
}

async fn handle(stream: TcpStream, peer: SocketAddr, tunnel: Tunnel) -> io::Result<()> {
    let original = stream.local_addr()?;
    let mut metadata = Metadata::new(Network::Tcp, InboundKind::Tproxy);
    metadata.set_source(peer);
    metadata.set_destination(original);

    tunnel
        .tcp_in()
        .send(ConnContext::new(Box::new(stream), metadata))
        .await
        .map_err(|_| io::Error::other("tcp queue closed"))
}

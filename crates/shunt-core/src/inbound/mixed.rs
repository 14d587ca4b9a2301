//! Mixed inbound: SOCKS4/5 and HTTP on one port, told apart by the first
//! byte.

use std::io;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::debug;

use super::{http, socks, Authenticator};
use crate::tunnel::Tunnel;

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
            let mut first = [0u8; 1];
            let result = match stream.peek(&mut first).await {
                Ok(0) => return,
                Ok(_) => match first[0] {
                    socks::SOCKS4_VERSION | socks::SOCKS5_VERSION => {
                        socks::handle(stream, peer, tunnel, auth).await
                    }
                    _ => http::handle(stream, peer, tunnel, auth).await,
                },
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                debug!(peer = %peer, error = %e, "mixed inbound closed");
            }
        });
    }
}

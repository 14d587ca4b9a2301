//! Socket helpers and the relay loop.

pub mod nat;
pub mod stats;

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::adapter::ProxyStream;

const COPY_BUF: usize = 16 * 1024;

/// Binds an unspecified UDP socket, retrying transient bind failures.
pub async fn bind_udp_with_retry(attempts: usize, delay: Duration) -> io::Result<UdpSocket> {
    let mut last = None;
    for attempt in 0..attempts.max(1) {
        match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => return Ok(socket),
            Err(e) => {
                debug!(attempt, error = %e, "udp bind failed");
                last = Some(e);
            }
        }
        tokio::time::sleep(delay).await;
    }
    Err(last.unwrap_or_else(|| io::Error::other("udp bind failed")))
}

/// Copies both directions until either side terminates, then tears down both
/// streams. Relay errors are connection-lifecycle noise, logged at debug.
pub async fn relay(left: ProxyStream, right: ProxyStream) {
    let (mut lr, mut lw) = tokio::io::split(left);
    let (mut rr, mut rw) = tokio::io::split(right);

    tokio::select! {
        r = pump(&mut lr, &mut rw) => {
            if let Err(e) = r {
                debug!(error = %e, "relay upload closed");
            }
        }
        r = pump(&mut rr, &mut lw) => {
            if let Err(e) = r {
                debug!(error = %e, "relay download closed");
            }
        }
    }
    // both halves drop here, closing the underlying sockets
}

async fn pump<R, W>(r: &mut R, w: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF];
    let mut total = 0u64;
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        w.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    w.flush().await.ok();
    Ok(total)
}

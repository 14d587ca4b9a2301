//! Inbound shims: translate accepted sockets into [`Metadata`] and submit
//! the flow to the tunnel.

pub mod http;
pub mod mixed;
pub mod redir;
pub mod socks;
pub mod tproxy;

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::adapter::ProxyStream;

/// User-id / password verification for SOCKS and HTTP inbounds.
#[derive(Debug, Default)]
pub struct Authenticator {
    users: HashMap<String, String>,
}

impl Authenticator {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    pub fn verify(&self, user: &str, pass: &str) -> bool {
        self.users.get(user).map(|p| p == pass).unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// A stream with bytes already consumed from the socket put back in front,
/// e.g. a peeked version byte or a rebuilt HTTP request head.
pub struct PrefixedStream {
    head: Vec<u8>,
    pos: usize,
    inner: ProxyStream,
}

impl PrefixedStream {
    pub fn new(head: Vec<u8>, inner: ProxyStream) -> Self {
        Self {
            head,
            pos: 0,
            inner,
        }
    }
}

impl AsyncRead for PrefixedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.head.len() {
            let remaining = &self.head[self.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.pos += n;
            if self.pos >= self.head.len() {
                self.head = Vec::new();
                self.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedStream {
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn prefixed_stream_serves_head_first() {
        let (a, b) = tokio::io::duplex(64);
        let mut s = PrefixedStream::new(b"head".to_vec(), Box::new(a));
        let (_br, mut bw) = tokio::io::split(b);
        use tokio::io::AsyncWriteExt;
        bw.write_all(b"tail").await.unwrap();

        let mut buf = [0u8; 8];
        s.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"headtail");
    }

    #[test]
    fn authenticator_verifies() {
        let mut users = HashMap::new();
        users.insert("user".to_string(), "pass".to_string());
        let auth = Authenticator::new(users);
        assert!(auth.verify("user", "pass"));
        assert!(!auth.verify("user", "nope"));
        assert!(!auth.verify("ghost", ""));
    }
}

//! Dialer abstraction: the seam between protocol adapters and the wire.

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced while establishing a transport stream.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake: {0}")]
    Handshake(String),

    #[error("not supported")]
    NotSupported,
}

impl From<tokio::time::error::Elapsed> for DialError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        DialError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "dial timeout",
        ))
    }
}

/// Marker for full-duplex async byte streams.
pub trait AsyncReadWrite: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}
impl<T> AsyncReadWrite for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}

/// Boxed stream handed between transport layers.
pub type IoStream = Box<dyn AsyncReadWrite>;

/// Something that can open a stream to `host:port`.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<IoStream, DialError>;
}

/// Plain TCP. The `(host, port)` tuple goes through the system resolver.
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn connect(&self, host: &str, port: u16) -> Result<IoStream, DialError> {
        let s = tokio::net::TcpStream::connect((host, port)).await?;
        s.set_nodelay(true).ok();
        Ok(Box::new(s))
    }
}

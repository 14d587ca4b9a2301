//! WebSocket transport.
//!
//! Binary frames are treated as opaque byte chunks: the stream a caller sees
//! is the concatenation of frame payloads. The early-data variant smuggles the
//! first bytes of the stream into the `Sec-WebSocket-Protocol` header
//! (base64-URL, no padding) and only performs the HTTP upgrade on the first
//! write, saving a round trip for protocols that always speak first.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use async_trait::async_trait;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, Uri};
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as FrameConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::dialer::{DialError, Dialer, IoStream};

pub const EARLY_DATA_HEADER: &str = "sec-websocket-protocol";

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Request path, must start with '/'.
    pub path: String,
    /// Host header override; the dialed host when absent.
    pub host: Option<String>,
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
    /// Maximum bytes carried in the early-data header. 0 disables early data.
    pub max_early_data: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            host: None,
            headers: Vec::new(),
            max_early_data: 0,
        }
    }
}

/// Performs the upgrade over whatever the inner dialer produces.
pub struct WebSocketDialer {
    config: WebSocketConfig,
    inner: Arc<dyn Dialer>,
}

impl WebSocketDialer {
    pub fn new(config: WebSocketConfig, inner: Arc<dyn Dialer>) -> Self {
        Self { config, inner }
    }
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn connect(&self, host: &str, port: u16) -> Result<IoStream, DialError> {
        let ws = handshake(self.inner.clone(), host, port, self.config.clone(), None).await?;
        Ok(Box::new(ws))
    }
}

async fn handshake(
    inner: Arc<dyn Dialer>,
    host: &str,
    port: u16,
    config: WebSocketConfig,
    early_data: Option<Vec<u8>>,
) -> Result<WsStream<IoStream>, DialError> {
    let stream = inner.connect(host, port).await?;

    let authority = config.host.clone().unwrap_or_else(|| host.to_string());
    let mut path = config.path.clone();
    if !path.starts_with('/') {
        path.insert(0, '/');
    }
    let uri: Uri = format!("ws://{}{}", authority, path)
        .parse()
        .map_err(|e| DialError::Handshake(format!("invalid uri: {e}")))?;

    // Host/Upgrade/Connection/Sec-WebSocket-Key are filled in by tungstenite;
    // only custom headers ride on the request.
    let mut request = Request::get(uri)
        .body(())
        .map_err(|e| DialError::Handshake(format!("bad request: {e}")))?;
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| DialError::Handshake(format!("bad header name: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| DialError::Handshake(format!("bad header value: {e}")))?;
        request.headers_mut().append(name, value);
    }
    if let Some(ed) = &early_data {
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(ed);
        request.headers_mut().append(
            HeaderName::from_static(EARLY_DATA_HEADER),
            HeaderValue::from_str(&token)
                .map_err(|e| DialError::Handshake(format!("bad early data: {e}")))?,
        );
    }

    let mut frame_cfg = FrameConfig::default();
    frame_cfg.max_message_size = Some(64 << 20);
    frame_cfg.max_frame_size = Some(16 << 20);

    let (ws, response) = tokio_tungstenite::client_async_with_config(request, stream, Some(frame_cfg))
        .await
        .map_err(|e| DialError::Handshake(format!("websocket upgrade: {e}")))?;
    debug!(status = %response.status(), "websocket upgrade done");

    Ok(WsStream::new(ws))
}

/// Adapts a message stream into `AsyncRead + AsyncWrite`.
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    buffer: Vec<u8>,
    offset: usize,
}

impl<S> WsStream<S> {
    fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            offset: 0,
        }
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if self.offset < self.buffer.len() {
                let remaining = &self.buffer[self.offset..];
                let n = remaining.len().min(buf.remaining());
                buf.put_slice(&remaining[..n]);
                self.offset += n;
                if self.offset >= self.buffer.len() {
                    self.buffer.clear();
                    self.offset = 0;
                }
                return Poll::Ready(Ok(()));
            }

            match self.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    let n = data.len().min(buf.remaining());
                    buf.put_slice(&data[..n]);
                    if n < data.len() {
                        self.buffer = data[n..].to_vec();
                        self.offset = 0;
                    }
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Ok(Message::Text(text)))) => {
                    warn!("unexpected text frame on websocket transport");
                    self.buffer = text.into_bytes();
                    self.offset = 0;
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    return Poll::Ready(Ok(()));
                }
                // control frames are answered by tungstenite itself
                Poll::Ready(Some(Ok(_))) => {}
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(std::io::Error::other(e.to_string())));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.inner.poll_ready_unpin(cx) {
            Poll::Ready(Ok(())) => match self.inner.start_send_unpin(Message::Binary(buf.to_vec())) {
                Ok(()) => Poll::Ready(Ok(buf.len())),
                Err(e) => Poll::Ready(Err(std::io::Error::other(e.to_string()))),
            },
            Poll::Ready(Err(e)) => Poll::Ready(Err(std::io::Error::other(e.to_string()))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner
            .poll_flush_unpin(cx)
            .map_err(|e| std::io::Error::other(e.to_string()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner
            .poll_close_unpin(cx)
            .map_err(|e| std::io::Error::other(e.to_string()))
    }
}

/// Early-data variant: `connect` returns at once; the upgrade happens on the
/// first write, carrying that write's prefix in the request header.
pub struct EarlyDataDialer {
    config: WebSocketConfig,
    inner: Arc<dyn Dialer>,
}

impl EarlyDataDialer {
    pub fn new(config: WebSocketConfig, inner: Arc<dyn Dialer>) -> Self {
        Self { config, inner }
    }
}

#[async_trait]
impl Dialer for EarlyDataDialer {
    async fn connect(&self, host: &str, port: u16) -> Result<IoStream, DialError> {
        if self.config.max_early_data == 0 {
            let ws = handshake(self.inner.clone(), host, port, self.config.clone(), None).await?;
            return Ok(Box::new(ws));
        }
        Ok(Box::new(EarlyDataStream {
            state: EdState::Idle {
                inner: self.inner.clone(),
                host: host.to_string(),
                port,
                config: self.config.clone(),
            },
            read_waker: None,
        }))
    }
}

type ConnectFut = Pin<Box<dyn Future<Output = Result<WsStream<IoStream>, DialError>> + Send>>;

enum EdState {
    Idle {
        inner: Arc<dyn Dialer>,
        host: String,
        port: u16,
        config: WebSocketConfig,
    },
    Connecting(ConnectFut),
    Ready(WsStream<IoStream>),
    Failed,
}

pub struct EarlyDataStream {
    state: EdState,
    read_waker: Option<Waker>,
}

impl EarlyDataStream {
    /// Drives the pending handshake to ready or failed.
    fn poll_connect(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        loop {
            match &mut self.state {
                EdState::Idle { .. } => return Poll::Pending,
                EdState::Connecting(fut) => match fut.as_mut().poll(cx) {
                    Poll::Ready(Ok(ws)) => {
                        self.state = EdState::Ready(ws);
                        if let Some(w) = self.read_waker.take() {
                            w.wake();
                        }
                    }
                    Poll::Ready(Err(e)) => {
                        self.state = EdState::Failed;
                        if let Some(w) = self.read_waker.take() {
                            w.wake();
                        }
                        return Poll::Ready(Err(std::io::Error::other(e.to_string())));
                    }
                    Poll::Pending => return Poll::Pending,
                },
                EdState::Ready(_) => return Poll::Ready(Ok(())),
                EdState::Failed => {
                    return Poll::Ready(Err(std::io::Error::other("websocket dial failed")))
                }
            }
        }
    }
}

impl AsyncWrite for EarlyDataStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if let EdState::Idle { .. } = self.state {
            // First write: the prefix rides the upgrade request.
            let EdState::Idle {
                inner,
                host,
                port,
                config,
            } = std::mem::replace(&mut self.state, EdState::Failed)
            else {
                unreachable!()
            };
            let n = buf.len().min(config.max_early_data);
            let early = buf[..n].to_vec();
            self.state = EdState::Connecting(Box::pin(async move {
                handshake(inner, &host, port, config, Some(early)).await
            }));
            // Kick the future so the dial starts before the next write.
            let _ = self.poll_connect(cx);
            return Poll::Ready(Ok(n));
        }

        match self.poll_connect(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        match &mut self.state {
            EdState::Ready(ws) => Pin::new(ws).poll_write(cx, buf),
            _ => Poll::Ready(Err(std::io::Error::other("websocket dial failed"))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.state {
            EdState::Idle { .. } => Poll::Ready(Ok(())),
            EdState::Connecting(_) => match self.poll_connect(cx) {
                Poll::Ready(Ok(())) => match &mut self.state {
                    EdState::Ready(ws) => Pin::new(ws).poll_flush(cx),
                    _ => Poll::Ready(Ok(())),
                },
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                Poll::Pending => Poll::Pending,
            },
            EdState::Ready(ws) => Pin::new(ws).poll_flush(cx),
            EdState::Failed => Poll::Ready(Err(std::io::Error::other("websocket dial failed"))),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.state {
            EdState::Ready(ws) => Pin::new(ws).poll_shutdown(cx),
            _ => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncRead for EarlyDataStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut self.state {
            EdState::Idle { .. } => {
                // Nothing has been sent yet; park until the first write dials.
                self.read_waker = Some(cx.waker().clone());
                Poll::Pending
            }
            EdState::Connecting(_) => match self.poll_connect(cx) {
                Poll::Ready(Ok(())) => match &mut self.state {
                    EdState::Ready(ws) => Pin::new(ws).poll_read(cx, buf),
                    _ => Poll::Ready(Err(std::io::Error::other("websocket dial failed"))),
                },
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                Poll::Pending => Poll::Pending,
            },
            EdState::Ready(ws) => Pin::new(ws).poll_read(cx, buf),
            EdState::Failed => Poll::Ready(Err(std::io::Error::other("websocket dial failed"))),
        }
    }
}

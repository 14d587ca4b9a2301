//! Stream transport layers for shunt.
//!
//! A transport is a [`Dialer`]: something that can produce a full-duplex byte
//! stream to a `host:port`. Dialers nest: the WebSocket dialer wraps any
//! inner dialer, so `TCP -> WebSocket` (and later combinations) compose
//! without the protocol adapters knowing what they run over.

pub mod dialer;
pub mod tls;
pub mod websocket;

pub use dialer::{Dialer, DialError, IoStream, TcpDialer};
pub use tls::{TlsConfig, TlsDialer};
pub use websocket::{EarlyDataDialer, WebSocketConfig, WebSocketDialer};

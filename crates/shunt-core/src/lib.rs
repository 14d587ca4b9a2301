//! shunt-core: the traffic-dispatch engine.
//!
//! The [`tunnel::Tunnel`] owns the shared routing state (rules, proxies, rule
//! providers, hosts) behind one multi-reader lock, drains the TCP/UDP
//! submission queues fed by the inbound shims, matches each flow against the
//! rule table and relays it through the selected outbound adapter.

pub mod adapter;
pub mod dns;
pub mod error;
pub mod inbound;
pub mod net;
pub mod route;
pub mod session;
pub mod tunnel;

pub use error::{Error, Result};
pub use session::{InboundKind, Metadata, Network};
pub use tunnel::{Tunnel, TunnelConfig, TunnelMode};

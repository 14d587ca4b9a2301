//! Per-connection traffic accounting.
//!
//! Every dialed outbound is wrapped in a tracker before the relay starts.
//! Trackers feed byte counters into one shared [`Manager`], which is what the
//! log line and any snapshot consumer observe.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use uuid::Uuid;

use crate::adapter::{OutboundDatagram, ProxyStream};
use crate::session::Metadata;

/// Shared accounting sink.
#[derive(Default)]
pub struct Manager {
    connections: DashMap<Uuid, Arc<TrackerInfo>>,
    upload_total: AtomicU64,
    download_total: AtomicU64,
}

impl Manager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn join(&self, info: Arc<TrackerInfo>) {
        self.connections.insert(info.id, info);
    }

    fn leave(&self, id: Uuid) {
        self.connections.remove(&id);
    }

    pub fn upload_total(&self) -> u64 {
        self.upload_total.load(Ordering::Relaxed)
    }

    pub fn download_total(&self) -> u64 {
        self.download_total.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> usize {
        self.connections.len()
    }

    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        self.connections
            .iter()
            .map(|entry| Self::snap(entry.value()))
            .collect()
    }

    /// View of one live connection; `None` once it has left the manager.
    pub fn snapshot_of(&self, id: Uuid) -> Option<ConnectionSnapshot> {
        self.connections.get(&id).map(|entry| Self::snap(entry.value()))
    }

    fn snap(info: &Arc<TrackerInfo>) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: info.id,
            metadata: info.metadata.clone(),
            chain: info.chain.clone(),
            rule: info.rule.clone(),
            rule_payload: info.rule_payload.clone(),
            upload: info.upload.load(Ordering::Relaxed),
            download: info.download.load(Ordering::Relaxed),
            elapsed_ms: info.start.elapsed().as_millis() as u64,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConnectionSnapshot {
    pub id: Uuid,
    pub metadata: Metadata,
    pub chain: Vec<String>,
    pub rule: String,
    #[serde(rename = "rulePayload")]
    pub rule_payload: String,
    pub upload: u64,
    pub download: u64,
    #[serde(rename = "elapsedMs")]
    pub elapsed_ms: u64,
}

/// Identity and counters of one tracked connection.
pub struct TrackerInfo {
    pub id: Uuid,
    pub metadata: Metadata,
    /// Adapter chain, innermost first (member before group).
    pub chain: Vec<String>,
    pub rule: String,
    pub rule_payload: String,
    pub start: Instant,
    upload: AtomicU64,
    download: AtomicU64,
}

impl TrackerInfo {
    pub fn new(
        metadata: Metadata,
        chain: Vec<String>,
        rule: impl Into<String>,
        rule_payload: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            metadata,
            chain,
            rule: rule.into(),
            rule_payload: rule_payload.into(),
            start: Instant::now(),
            upload: AtomicU64::new(0),
            download: AtomicU64::new(0),
        })
    }

    pub fn chain_string(&self) -> String {
        self.chain.join("/")
    }

    pub fn upload(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    pub fn download(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }
}

/// Stream wrapper accumulating up/down byte counts.
pub struct TrackedStream {
    inner: ProxyStream,
    info: Arc<TrackerInfo>,
    manager: Arc<Manager>,
}

impl TrackedStream {
    pub fn new(inner: ProxyStream, manager: Arc<Manager>, info: Arc<TrackerInfo>) -> Self {
        manager.join(info.clone());
        Self {
            inner,
            info,
            manager,
        }
    }

    pub fn info(&self) -> &Arc<TrackerInfo> {
        &self.info
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.manager.leave(self.info.id);
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let n = (buf.filled().len() - before) as u64;
            self.info.download.fetch_add(n, Ordering::Relaxed);
            self.manager.download_total.fetch_add(n, Ordering::Relaxed);
        }
        poll
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, data);
        if let Poll::Ready(Ok(n)) = poll {
            self.info.upload.fetch_add(n as u64, Ordering::Relaxed);
            self.manager.upload_total.fetch_add(n as u64, Ordering::Relaxed);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Packet-endpoint wrapper with the same accounting.
pub struct TrackedDatagram {
    inner: Arc<dyn OutboundDatagram>,
    info: Arc<TrackerInfo>,
    manager: Arc<Manager>,
}

impl TrackedDatagram {
    pub fn new(
        inner: Arc<dyn OutboundDatagram>,
        manager: Arc<Manager>,
        info: Arc<TrackerInfo>,
    ) -> Self {
        manager.join(info.clone());
        Self {
            inner,
            info,
            manager,
        }
    }

    pub fn info(&self) -> &Arc<TrackerInfo> {
        &self.info
    }
}

impl Drop for TrackedDatagram {
    fn drop(&mut self) {
        self.manager.leave(self.info.id);
    }
}

#[async_trait]
impl OutboundDatagram for TrackedDatagram {
    async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
        let n = self.inner.send_to(buf, dst).await?;
        self.info.upload.fetch_add(n as u64, Ordering::Relaxed);
        self.manager.upload_total.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (n, addr) = self.inner.recv_from(buf).await?;
        self.info.download.fetch_add(n as u64, Ordering::Relaxed);
        self.manager.download_total.fetch_add(n as u64, Ordering::Relaxed);
        Ok((n, addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{InboundKind, Network};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn info() -> Arc<TrackerInfo> {
        let m = Metadata::new(Network::Tcp, InboundKind::Http);
        TrackerInfo::new(m, vec!["DIRECT".into()], "Match", "")
    }

    #[tokio::test]
    async fn counters_follow_io() {
        let manager = Manager::new();
        let (a, b) = tokio::io::duplex(256);
        let mut tracked = TrackedStream::new(Box::new(a), manager.clone(), info());
        let (mut br, mut bw) = tokio::io::split(b);

        tracked.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        br.read_exact(&mut buf).await.unwrap();
        assert_eq!(tracked.info().upload(), 5);

        bw.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        tracked.read_exact(&mut buf).await.unwrap();
        assert_eq!(tracked.info().download(), 2);

        assert_eq!(manager.upload_total(), 5);
        assert_eq!(manager.download_total(), 2);
        assert_eq!(manager.active(), 1);
        drop(tracked);
        assert_eq!(manager.active(), 0);
    }

    #[tokio::test]
    async fn snapshot_reports_live_connections() {
        let manager = Manager::new();
        let m = Metadata::new(Network::Tcp, InboundKind::Socks5);
        let info = TrackerInfo::new(
            m,
            vec!["node".to_string(), "GLOBAL".to_string()],
            "DomainSuffix",
            "google.com",
        );
        let id = info.id;

        let (a, _b) = tokio::io::duplex(256);
        let mut tracked = TrackedStream::new(Box::new(a), manager.clone(), info);
        tracked.write_all(b"abc").await.unwrap();

        let snap = manager.snapshot_of(id).expect("connection is live");
        assert_eq!(snap.chain, vec!["node".to_string(), "GLOBAL".to_string()]);
        assert_eq!(snap.rule, "DomainSuffix");
        assert_eq!(snap.rule_payload, "google.com");
        assert_eq!(snap.upload, 3);
        assert_eq!(snap.download, 0);

        let all = manager.snapshot();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, id);

        drop(tracked);
        assert!(manager.snapshot_of(id).is_none());
        assert!(manager.snapshot().is_empty());
    }
}

//! The dispatch engine.
//!
//! Two bounded fan-in queues feed the tunnel: inbound shims enqueue, the
//! engine owns consumption. One task drains the TCP queue and spawns a task
//! per connection; a fixed pool drains the UDP queue. Every flow goes through
//! the same pipeline: validate, pre-handle, resolve `(proxy, rule)`, dial
//! under a deadline, wrap in a statistic tracker, relay.

pub mod context;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{unwraps_to, AdapterKind, OutboundAdapter, OutboundDatagram, ProxyRegistry};
use crate::dns::{FakeIpMapper, HostsTable, Resolve};
use crate::error::{Error, Result};
use crate::net::nat::{NatEntry, NatTable};
use crate::net::stats::{Manager, TrackedDatagram, TrackedStream, TrackerInfo};
use crate::net::relay;
use crate::route::geoip::GeoIpLookup;
use crate::route::provider::RuleProvider;
use crate::route::rules::{MatchContext, Rule};
use crate::session::{Metadata, Network};

pub use context::{ConnContext, InboundDatagram, PacketContext, UdpPacket};

const QUEUE_CAPACITY: usize = 200;
const UDP_BUFFER: usize = 64 * 1024;

/// Global routing modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
    Direct,
    Global,
    Rule,
}

impl TunnelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelMode::Direct => "direct",
            TunnelMode::Global => "global",
            TunnelMode::Rule => "rule",
        }
    }
}

impl std::str::FromStr for TunnelMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(TunnelMode::Direct),
            "global" => Ok(TunnelMode::Global),
            "rule" => Ok(TunnelMode::Rule),
            other => Err(Error::Config(format!("unknown mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Deadline for outbound TCP dials.
    pub tcp_timeout: Duration,
    /// Deadline for outbound UDP endpoint setup.
    pub udp_timeout: Duration,
    /// Idle eviction window for NAT entries.
    pub udp_session_timeout: Duration,
    /// UDP worker pool size; defaults to `max(4, parallelism)`.
    pub udp_workers: Option<usize>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            tcp_timeout: Duration::from_secs(5),
            udp_timeout: Duration::from_secs(5),
            udp_session_timeout: Duration::from_secs(60),
            udp_workers: None,
        }
    }
}

/// Everything rule resolution reads, swapped wholesale by config updates.
struct DispatchState {
    mode: TunnelMode,
    rules: Vec<Rule>,
    proxies: Arc<ProxyRegistry>,
    providers: HashMap<String, Arc<RuleProvider>>,
    hosts: Arc<HostsTable>,
}

struct Inner {
    state: RwLock<DispatchState>,
    nat: Arc<NatTable>,
    manager: Arc<Manager>,
    resolver: Arc<dyn Resolve>,
    mapper: Option<Arc<dyn FakeIpMapper>>,
    geoip: Option<Arc<dyn GeoIpLookup>>,
    cfg: TunnelConfig,
}

/// The engine handle. Cloning is cheap; all clones share one engine.
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<Inner>,
    tcp_tx: mpsc::Sender<ConnContext>,
    udp_tx: mpsc::Sender<PacketContext>,
    workers: Arc<Vec<JoinHandle<()>>>,
}

impl Tunnel {
    pub fn new(
        cfg: TunnelConfig,
        resolver: Arc<dyn Resolve>,
        mapper: Option<Arc<dyn FakeIpMapper>>,
        geoip: Option<Arc<dyn GeoIpLookup>>,
    ) -> Self {
        let (tcp_tx, tcp_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (udp_tx, udp_rx) = mpsc::channel(QUEUE_CAPACITY);

        let inner = Arc::new(Inner {
            state: RwLock::new(DispatchState {
                mode: TunnelMode::Rule,
                rules: Vec::new(),
                proxies: Arc::new(ProxyRegistry::build(Vec::new())),
                providers: HashMap::new(),
                hosts: Arc::new(HostsTable::new()),
            }),
            nat: Arc::new(NatTable::new()),
            manager: Manager::new(),
            resolver,
            mapper,
            geoip,
            cfg,
        });

        let mut workers = Vec::new();
        workers.push(inner.nat.clone().start_sweeper(inner.cfg.udp_session_timeout));

        // TCP: drain and spawn, relays must not head-of-line block the queue
        {
            let inner = inner.clone();
            let mut rx: mpsc::Receiver<ConnContext> = tcp_rx;
            workers.push(tokio::spawn(async move {
                while let Some(ctx) = rx.recv().await {
                    let inner = inner.clone();
                    tokio::spawn(async move { inner.handle_tcp(ctx).await });
                }
            }));
        }

        // UDP: fixed worker pool over one shared receiver
        let udp_workers = inner.cfg.udp_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .max(4)
        });
        let udp_rx = Arc::new(Mutex::new(udp_rx));
        for _ in 0..udp_workers {
            let inner = inner.clone();
            let rx = udp_rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let ctx = rx.lock().await.recv().await;
                    match ctx {
                        Some(ctx) => inner.clone().handle_udp(ctx).await,
                        None => break,
                    }
                }
            }));
        }

        Self {
            inner,
            tcp_tx,
            udp_tx,
            workers: Arc::new(workers),
        }
    }

    /// TCP submission endpoint.
    pub fn tcp_in(&self) -> mpsc::Sender<ConnContext> {
        self.tcp_tx.clone()
    }

    /// UDP submission endpoint.
    pub fn udp_in(&self) -> mpsc::Sender<PacketContext> {
        self.udp_tx.clone()
    }

    pub fn manager(&self) -> Arc<Manager> {
        self.inner.manager.clone()
    }

    pub fn nat(&self) -> Arc<NatTable> {
        self.inner.nat.clone()
    }

    pub async fn mode(&self) -> TunnelMode {
        self.inner.state.read().await.mode
    }

    pub async fn set_mode(&self, mode: TunnelMode) {
        self.inner.state.write().await.mode = mode;
        info!(mode = mode.as_str(), "tunnel mode changed");
    }

    pub async fn rules(&self) -> Vec<Rule> {
        self.inner.state.read().await.rules.clone()
    }

    /// Swaps the rule table and provider map atomically.
    pub async fn update_rules(
        &self,
        rules: Vec<Rule>,
        providers: HashMap<String, Arc<RuleProvider>>,
    ) {
        let mut state = self.inner.state.write().await;
        state.rules = rules;
        state.providers = providers;
    }

    /// Swaps the proxy map. Flows already matched keep their adapter.
    pub async fn update_proxies(&self, proxies: ProxyRegistry) {
        self.inner.state.write().await.proxies = Arc::new(proxies);
    }

    pub async fn update_hosts(&self, hosts: HostsTable) {
        self.inner.state.write().await.hosts = Arc::new(hosts);
    }

    pub fn stop(&self) {
        for task in self.workers.iter() {
            task.abort();
        }
    }
}

impl Inner {
    /// Normalises metadata before matching: IP-literal hosts become the
    /// destination IP, and fake destination addresses reverse to the host
    /// they stand for.
    async fn pre_handle(&self, metadata: &mut Metadata) -> Result<()> {
        if let Ok(ip) = metadata.host.parse::<IpAddr>() {
            metadata.dst_ip = Some(ip);
            metadata.host.clear();
        }

        let Some(mapper) = &self.mapper else {
            return Ok(());
        };
        if !metadata.host.is_empty() {
            return Ok(());
        }
        let Some(ip) = metadata.dst_ip else {
            return Ok(());
        };

        if let Some(host) = mapper.find_host(ip) {
            metadata.host = host;
            if mapper.fake_ip_enabled() {
                // the real address comes from rule matching later
                metadata.dst_ip = None;
            } else {
                let hosts = self.state.read().await.hosts.clone();
                if let Some(pinned) = hosts.lookup(&metadata.host) {
                    metadata.dst_ip = Some(pinned);
                }
            }
        } else if mapper.is_fake_ip(ip) {
            return Err(Error::FakeIpMissing(ip));
        }
        Ok(())
    }

    /// Mode switch plus rule-table walk; returns the adapter to dial.
    async fn resolve_metadata(
        &self,
        metadata: &mut Metadata,
    ) -> Result<(Arc<dyn OutboundAdapter>, Option<Rule>)> {
        let state = self.state.read().await;
        match state.mode {
            TunnelMode::Direct => {
                let proxy = state
                    .proxies
                    .get("DIRECT")
                    .ok_or_else(|| Error::AdapterNotFound("DIRECT".into()))?;
                Ok((proxy, None))
            }
            TunnelMode::Global => {
                let proxy = state
                    .proxies
                    .get("GLOBAL")
                    .ok_or_else(|| Error::AdapterNotFound("GLOBAL".into()))?;
                Ok((proxy, None))
            }
            TunnelMode::Rule => self.match_rules(&state, metadata).await,
        }
    }

    async fn match_rules(
        &self,
        state: &DispatchState,
        metadata: &mut Metadata,
    ) -> Result<(Arc<dyn OutboundAdapter>, Option<Rule>)> {
        let ctx = MatchContext {
            providers: &state.providers,
            geoip: self.geoip.as_deref(),
        };

        let mut resolved = false;
        if !metadata.host.is_empty() {
            if let Some(ip) = state.hosts.lookup(&metadata.host) {
                metadata.dst_ip = Some(ip);
                resolved = true;
            }
        }

        for rule in &state.rules {
            // lazy resolve, at most once per match call
            if !resolved
                && rule.should_resolve_ip(&ctx)
                && !metadata.host.is_empty()
                && metadata.dst_ip.is_none()
            {
                match self.resolver.resolve_ip(&metadata.host).await {
                    Ok(ip) => {
                        debug!(host = %metadata.host, ip = %ip, "resolved for rule match");
                        metadata.dst_ip = Some(ip);
                    }
                    Err(e) => debug!(host = %metadata.host, error = %e, "resolve failed"),
                }
                resolved = true;
            }

            if rule.matches(metadata, &ctx) {
                let Some(adapter) = state.proxies.get(rule.adapter()) else {
                    continue;
                };
                if adapter.kind() == AdapterKind::Pass
                    || unwraps_to(&adapter, metadata, AdapterKind::Pass)
                {
                    continue;
                }
                if metadata.network == Network::Udp && !adapter.supports_udp() {
                    debug!(adapter = adapter.name(), "UDP not supported, rule skipped");
                    continue;
                }
                return Ok((adapter, Some(rule.clone())));
            }
        }

        let proxy = state
            .proxies
            .get("DIRECT")
            .ok_or_else(|| Error::AdapterNotFound("DIRECT".into()))?;
        Ok((proxy, None))
    }

    fn chain_of(proxy: &Arc<dyn OutboundAdapter>, metadata: &Metadata) -> Vec<String> {
        match proxy.unwrap(metadata) {
            Some(inner) => vec![inner.name().to_string(), proxy.name().to_string()],
            None => vec![proxy.name().to_string()],
        }
    }

    fn log_match(&self, mode: TunnelMode, metadata: &Metadata, rule: Option<&Rule>, chain: &str) {
        let label = metadata.network.as_str().to_uppercase();
        match (rule, mode) {
            (Some(rule), _) => info!(
                "[{label}] {} --> {} match {}({}) using {chain}",
                metadata.source_address(),
                metadata.remote_address(),
                rule.kind_name(),
                rule.payload(),
            ),
            (None, TunnelMode::Global) => info!(
                "[{label}] {} --> {} using GLOBAL",
                metadata.source_address(),
                metadata.remote_address(),
            ),
            (None, TunnelMode::Direct) => info!(
                "[{label}] {} --> {} using DIRECT",
                metadata.source_address(),
                metadata.remote_address(),
            ),
            (None, TunnelMode::Rule) => info!(
                "[{label}] {} --> {} doesn't match any rule using DIRECT",
                metadata.source_address(),
                metadata.remote_address(),
            ),
        }
    }

    fn log_dial_error(
        &self,
        metadata: &Metadata,
        proxy: &str,
        rule: Option<&Rule>,
        err: &dyn std::fmt::Display,
    ) {
        let label = metadata.network.as_str().to_uppercase();
        match rule {
            Some(rule) => warn!(
                "[{label}] dial {proxy} (match {}/{}) to {} error: {err}",
                rule.kind_name(),
                rule.payload(),
                metadata.remote_address(),
            ),
            None => warn!(
                "[{label}] dial {proxy} to {} error: {err}",
                metadata.remote_address(),
            ),
        }
    }

    async fn handle_tcp(&self, ctx: ConnContext) {
        let ConnContext {
            stream,
            mut metadata,
        } = ctx;

        if !metadata.valid() {
            warn!("[Metadata] not valid: {metadata:?}");
            return;
        }
        if let Err(e) = self.pre_handle(&mut metadata).await {
            debug!("[Metadata PreHandle] error: {e}");
            return;
        }

        let mode = self.state.read().await.mode;
        let (proxy, rule) = match self.resolve_metadata(&mut metadata).await {
            Ok(v) => v,
            Err(e) => {
                warn!("[Metadata] parse failed: {e}");
                return;
            }
        };

        let remote =
            match tokio::time::timeout(self.cfg.tcp_timeout, proxy.connect_stream(&metadata))
                .await
            {
                Ok(Ok(remote)) => remote,
                Ok(Err(e)) => {
                    self.log_dial_error(&metadata, proxy.name(), rule.as_ref(), &e);
                    return;
                }
                Err(_) => {
                    self.log_dial_error(&metadata, proxy.name(), rule.as_ref(), &"dial timeout");
                    return;
                }
            };

        let chain = Self::chain_of(&proxy, &metadata);
        let info = TrackerInfo::new(
            metadata.clone(),
            chain,
            rule.as_ref().map(|r| r.kind_name()).unwrap_or("Match"),
            rule.as_ref().map(|r| r.payload()).unwrap_or_default(),
        );
        let remote = TrackedStream::new(remote, self.manager.clone(), info.clone());
        // the log line reports the manager's view of the new connection
        let chain_str = match self.manager.snapshot_of(info.id) {
            Some(snapshot) => snapshot.chain.join("/"),
            None => info.chain_string(),
        };
        self.log_match(mode, &metadata, rule.as_ref(), &chain_str);

        relay(stream, Box::new(remote)).await;
    }

    async fn handle_udp(self: Arc<Self>, ctx: PacketContext) {
        let PacketContext {
            packet,
            mut metadata,
        } = ctx;

        if !metadata.valid() {
            warn!("[Metadata] not valid: {metadata:?}");
            return;
        }

        // clients expect replies from the address they dialed, which the
        // pre-handle below may rewrite
        let fake_addr = match (&self.mapper, metadata.dst_ip) {
            (Some(mapper), Some(ip)) if mapper.exists(ip) => metadata.udp_addr(),
            _ => None,
        };

        if let Err(e) = self.pre_handle(&mut metadata).await {
            debug!("[Metadata PreHandle] error: {e}");
            return;
        }

        let key = packet.src.to_string();
        if let Some(entry) = self.nat.get(&key) {
            self.forward_udp(&key, &entry.datagram(), &packet.data, &metadata)
                .await;
            return;
        }

        let (notify, owner) = self.nat.get_or_create_lock(&key);
        let inner = self.clone();
        tokio::spawn(async move {
            if !owner {
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                // the owner may have finished between lookup and here
                if let Some(entry) = inner.nat.get(&key) {
                    inner
                        .forward_udp(&key, &entry.datagram(), &packet.data, &metadata)
                        .await;
                    return;
                }
                notified.await;
                if let Some(entry) = inner.nat.get(&key) {
                    inner
                        .forward_udp(&key, &entry.datagram(), &packet.data, &metadata)
                        .await;
                }
                // owner failed: the packet is dropped
                return;
            }

            inner
                .udp_owner_dial(&key, &notify, packet, metadata, fake_addr)
                .await;
        });
    }

    /// Owner side of the singleflight: dial, install, broadcast, forward.
    async fn udp_owner_dial(
        self: Arc<Self>,
        key: &str,
        notify: &tokio::sync::Notify,
        packet: UdpPacket,
        mut metadata: Metadata,
        fake_addr: Option<std::net::SocketAddr>,
    ) {
        let mode = self.state.read().await.mode;
        let (proxy, rule) = match self.resolve_metadata(&mut metadata).await {
            Ok(v) => v,
            Err(e) => {
                warn!("[UDP] parse metadata failed: {e}");
                self.nat.release_lock(key, notify);
                return;
            }
        };

        let raw = match tokio::time::timeout(self.cfg.udp_timeout, proxy.listen_packet(&metadata))
            .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                self.log_dial_error(&metadata, proxy.name(), rule.as_ref(), &e);
                self.nat.release_lock(key, notify);
                return;
            }
            Err(_) => {
                self.log_dial_error(&metadata, proxy.name(), rule.as_ref(), &"dial timeout");
                self.nat.release_lock(key, notify);
                return;
            }
        };

        let chain = Self::chain_of(&proxy, &metadata);
        let info = TrackerInfo::new(
            metadata.clone(),
            chain,
            rule.as_ref().map(|r| r.kind_name()).unwrap_or("Match"),
            rule.as_ref().map(|r| r.payload()).unwrap_or_default(),
        );
        let tracked = Arc::new(TrackedDatagram::new(raw, self.manager.clone(), info.clone()));
        let chain_str = match self.manager.snapshot_of(info.id) {
            Some(snapshot) => snapshot.chain.join("/"),
            None => info.chain_string(),
        };
        self.log_match(mode, &metadata, rule.as_ref(), &chain_str);

        let pump = {
            let inner = self.clone();
            let key = key.to_string();
            let datagram = tracked.clone();
            let writeback = packet.writeback.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; UDP_BUFFER];
                loop {
                    match datagram.recv_from(&mut buf).await {
                        Ok((n, from)) => {
                            let src = fake_addr.unwrap_or(from);
                            if writeback.write_back(&buf[..n], src).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                inner.nat.delete(&key);
            })
        };

        self.nat.set(key, NatEntry::new(tracked.clone(), pump));
        self.nat.release_lock(key, notify);
        self.forward_udp(key, &tracked, &packet.data, &metadata).await;
    }

    /// Sends one packet through an installed endpoint, resolving the
    /// destination if rule matching left it as a host name.
    async fn forward_udp(
        &self,
        key: &str,
        datagram: &Arc<TrackedDatagram>,
        data: &[u8],
        metadata: &Metadata,
    ) {
        let addr = match metadata.udp_addr() {
            Some(addr) => addr,
            None => match self.resolver.resolve_ip(&metadata.host).await {
                Ok(ip) => std::net::SocketAddr::new(ip, metadata.dst_port),
                Err(e) => {
                    debug!(host = %metadata.host, error = %e, "udp forward resolve failed");
                    return;
                }
            },
        };
        if let Err(e) = datagram.send_to(data, addr).await {
            debug!(error = %e, "udp forward failed, dropping session");
            self.nat.delete(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{OutboundDatagram, ProxyStream};
    use crate::session::InboundKind;
    use async_trait::async_trait;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubResolver(IpAddr);

    #[async_trait]
    impl Resolve for StubResolver {
        async fn resolve_ip(&self, _host: &str) -> Result<IpAddr> {
            Ok(self.0)
        }
    }

    struct FailResolver;

    #[async_trait]
    impl Resolve for FailResolver {
        async fn resolve_ip(&self, host: &str) -> Result<IpAddr> {
            Err(Error::Resolve {
                host: host.to_string(),
                msg: "stubbed out".into(),
            })
        }
    }

    /// Adapter that records dials and black-holes traffic.
    struct CountingAdapter {
        name: String,
        udp: bool,
        dials: Arc<AtomicUsize>,
        sent: Arc<AtomicUsize>,
    }

    impl CountingAdapter {
        fn new(name: &str, udp: bool) -> Self {
            Self {
                name: name.into(),
                udp,
                dials: Arc::new(AtomicUsize::new(0)),
                sent: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    struct SinkDatagram {
        sent: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl OutboundDatagram for SinkDatagram {
        async fn send_to(&self, buf: &[u8], _dst: SocketAddr) -> io::Result<usize> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(buf.len())
        }

        async fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            // park forever; the pump lives until the entry is evicted
            futures::future::pending().await
        }
    }

    #[async_trait]
    impl OutboundAdapter for CountingAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> AdapterKind {
            AdapterKind::Socks5
        }

        fn supports_udp(&self) -> bool {
            self.udp
        }

        async fn connect_stream(&self, _metadata: &Metadata) -> io::Result<ProxyStream> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (a, _b) = tokio::io::duplex(64);
            Ok(Box::new(a))
        }

        async fn listen_packet(
            &self,
            _metadata: &Metadata,
        ) -> io::Result<Arc<dyn OutboundDatagram>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await; // a real dial takes time
            Ok(Arc::new(SinkDatagram {
                sent: self.sent.clone(),
            }))
        }
    }

    struct NullWriteback;

    #[async_trait]
    impl InboundDatagram for NullWriteback {
        async fn write_back(&self, buf: &[u8], _from: SocketAddr) -> io::Result<usize> {
            Ok(buf.len())
        }
    }

    fn tcp_meta(host: &str, port: u16) -> Metadata {
        let mut m = Metadata::new(Network::Tcp, InboundKind::Socks5);
        m.src_ip = Some("127.0.0.1".parse().unwrap());
        m.src_port = 40000;
        m.host = host.into();
        m.dst_port = port;
        m
    }

    async fn tunnel_with(resolver: Arc<dyn Resolve>, rules: &[&str]) -> (Tunnel, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let tunnel = Tunnel::new(TunnelConfig::default(), resolver, None, None);
        let gp = CountingAdapter::new("GP", true);
        let dials = gp.dials.clone();
        let sent = gp.sent.clone();
        tunnel
            .update_proxies(ProxyRegistry::build(vec![Arc::new(gp)]))
            .await;
        let rules = rules.iter().map(|l| Rule::parse(l).unwrap()).collect();
        tunnel.update_rules(rules, HashMap::new()).await;
        (tunnel, dials, sent)
    }

    async fn resolve(tunnel: &Tunnel, metadata: &mut Metadata) -> (String, Option<Rule>) {
        let (proxy, rule) = tunnel.inner.resolve_metadata(metadata).await.unwrap();
        (proxy.name().to_string(), rule)
    }

    #[tokio::test]
    async fn domain_suffix_rule_selects_adapter() {
        let (tunnel, _, _) = tunnel_with(
            Arc::new(FailResolver),
            &["DOMAIN-SUFFIX,google.com,GP", "MATCH,DIRECT"],
        )
        .await;
        let mut m = tcp_meta("maps.google.com", 443);
        let (name, rule) = resolve(&tunnel, &mut m).await;
        assert_eq!(name, "GP");
        assert_eq!(rule.unwrap().payload(), "google.com");
    }

    #[tokio::test]
    async fn no_resolve_blocks_lazy_lookup() {
        let (tunnel, _, _) = tunnel_with(
            Arc::new(StubResolver("10.1.2.3".parse().unwrap())),
            &["IP-CIDR,10.0.0.0/8,GP,no-resolve", "MATCH,DIRECT"],
        )
        .await;
        let mut m = tcp_meta("intranet", 80);
        let (name, rule) = resolve(&tunnel, &mut m).await;
        assert_eq!(name, "DIRECT");
        assert!(rule.unwrap().kind_name() == "Match");
        assert!(m.dst_ip.is_none());
    }

    #[tokio::test]
    async fn lazy_resolve_feeds_ip_rules() {
        let (tunnel, _, _) = tunnel_with(
            Arc::new(StubResolver("10.1.2.3".parse().unwrap())),
            &["IP-CIDR,10.0.0.0/8,GP", "MATCH,DIRECT"],
        )
        .await;
        let mut m = tcp_meta("intranet", 80);
        let (name, rule) = resolve(&tunnel, &mut m).await;
        assert_eq!(name, "GP");
        assert_eq!(rule.unwrap().kind_name(), "IPCIDR");
        assert_eq!(m.dst_ip, Some("10.1.2.3".parse().unwrap()));
    }

    #[tokio::test]
    async fn pass_rules_are_skipped() {
        let (tunnel, _, _) = tunnel_with(
            Arc::new(FailResolver),
            &[
                "DOMAIN,example.com,PASS",
                "DOMAIN-SUFFIX,example.com,GP",
                "MATCH,DIRECT",
            ],
        )
        .await;
        let mut m = tcp_meta("example.com", 443);
        let (name, _) = resolve(&tunnel, &mut m).await;
        assert_eq!(name, "GP");
    }

    #[tokio::test]
    async fn udp_skips_non_udp_adapters() {
        let tunnel = Tunnel::new(TunnelConfig::default(), Arc::new(FailResolver), None, None);
        let tcp_only = CountingAdapter::new("TCPONLY", false);
        tunnel
            .update_proxies(ProxyRegistry::build(vec![Arc::new(tcp_only)]))
            .await;
        tunnel
            .update_rules(
                vec![
                    Rule::parse("DOMAIN,example.com,TCPONLY").unwrap(),
                    Rule::parse("MATCH,DIRECT").unwrap(),
                ],
                HashMap::new(),
            )
            .await;
        let mut m = tcp_meta("example.com", 53);
        m.network = Network::Udp;
        let (name, _) = resolve(&tunnel, &mut m).await;
        assert_eq!(name, "DIRECT");
    }

    #[tokio::test]
    async fn direct_mode_ignores_rules() {
        let (tunnel, _, _) = tunnel_with(Arc::new(FailResolver), &["DOMAIN,x,GP"]).await;
        tunnel.set_mode(TunnelMode::Direct).await;
        let mut m = tcp_meta("x", 80);
        let (name, rule) = resolve(&tunnel, &mut m).await;
        assert_eq!(name, "DIRECT");
        assert!(rule.is_none());
    }

    #[tokio::test]
    async fn missing_adapter_falls_through() {
        let (tunnel, _, _) = tunnel_with(
            Arc::new(FailResolver),
            &["DOMAIN,example.com,NOSUCH", "MATCH,DIRECT"],
        )
        .await;
        let mut m = tcp_meta("example.com", 80);
        let (name, _) = resolve(&tunnel, &mut m).await;
        assert_eq!(name, "DIRECT");
    }

    #[tokio::test]
    async fn udp_burst_dials_once() {
        let (tunnel, dials, sent) = tunnel_with(
            Arc::new(StubResolver("93.184.216.34".parse().unwrap())),
            &["MATCH,GP"],
        )
        .await;

        let udp = tunnel.udp_in();
        let writeback: Arc<dyn InboundDatagram> = Arc::new(NullWriteback);
        let src: SocketAddr = "127.0.0.1:5353".parse().unwrap();
        for _ in 0..100 {
            let mut m = Metadata::new(Network::Udp, InboundKind::Socks5);
            m.set_source(src);
            m.dst_ip = Some("93.184.216.34".parse().unwrap());
            m.dst_port = 53;
            let packet = UdpPacket {
                data: b"query".to_vec(),
                src,
                writeback: writeback.clone(),
            };
            udp.send(PacketContext::new(packet, m)).await.unwrap();
        }

        // let the workers, owner dial and waiters settle
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(dials.load(Ordering::SeqCst), 1, "exactly one outbound dial");
        assert_eq!(sent.load(Ordering::SeqCst), 100, "all packets forwarded");
        assert_eq!(tunnel.nat().len(), 1);
        tunnel.stop();
    }

    #[tokio::test]
    async fn concurrent_rule_updates_do_not_interleave() {
        let (tunnel, _, _) = tunnel_with(Arc::new(FailResolver), &[]).await;
        let a = vec![
            Rule::parse("DOMAIN,a.com,GP").unwrap(),
            Rule::parse("MATCH,DIRECT").unwrap(),
        ];
        let b = vec![
            Rule::parse("DOMAIN,b.com,GP").unwrap(),
            Rule::parse("MATCH,GP").unwrap(),
        ];
        let t1 = tunnel.clone();
        let t2 = tunnel.clone();
        let (a2, b2) = (a.clone(), b.clone());
        let h1 = tokio::spawn(async move { t1.update_rules(a2, HashMap::new()).await });
        let h2 = tokio::spawn(async move { t2.update_rules(b2, HashMap::new()).await });
        h1.await.unwrap();
        h2.await.unwrap();

        let rules = tunnel.rules().await;
        let view: Vec<String> = rules.iter().map(|r| r.payload()).collect();
        let a_view: Vec<String> = a.iter().map(|r| r.payload()).collect();
        let b_view: Vec<String> = b.iter().map(|r| r.payload()).collect();
        assert!(view == a_view || view == b_view, "view must be one input");
    }
}

//! shunt: rule-based proxy gateway entry point.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shunt_core::adapter::ProxyRegistry;
use shunt_core::dns::{FakeIpMapper, MemoryMapper, SystemResolver};
use shunt_core::inbound;
use shunt_core::{Tunnel, TunnelMode};

const APP_NAME: &str = "shunt";

#[derive(Debug, Parser)]
#[command(name = APP_NAME, version, about = "Rule-based network proxy gateway")]
struct Args {
    /// Home directory holding config.yaml and provider caches.
    #[arg(short = 'd', long = "dir")]
    dir: Option<PathBuf>,

    /// Configuration file, defaults to `<dir>/config.yaml`.
    #[arg(short = 'f', long = "config")]
    config: Option<PathBuf>,
}

fn home_dir(args: &Args) -> PathBuf {
    if let Some(dir) = &args.dir {
        return dir.clone();
    }
    if let Ok(dir) = std::env::var("SHUNT_HOME") {
        return PathBuf::from(dir);
    }
    let base = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(".config").join(APP_NAME)
}

fn init_logging(level: Option<&str>) {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| level.map(str::to_string))
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let home = home_dir(&args);
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| home.join("config.yaml"));

    let raw = config::load(&config_path)?;
    init_logging(raw.log_level.as_deref());
    info!(config = %config_path.display(), home = %home.display(), "starting");

    let mapper: Option<Arc<dyn FakeIpMapper>> = match &raw.fake_ip_range {
        Some(range) => {
            let pool = range
                .parse::<ipnet::Ipv4Net>()
                .with_context(|| format!("bad fake-ip-range {range}"))?;
            Some(Arc::new(MemoryMapper::new(pool, true, 16384)))
        }
        None => None,
    };

    let tunnel = Tunnel::new(raw.tunnel_config(), Arc::new(SystemResolver), mapper, None);

    // providers load before rules reference them
    let mut registry = raw.build_providers(&home)?;
    registry.initial_all().await?;
    registry.start();

    tunnel
        .update_proxies(ProxyRegistry::build(raw.build_proxies()?))
        .await;
    tunnel
        .update_rules(raw.build_rules()?, registry.providers())
        .await;
    tunnel.update_hosts(raw.build_hosts()?).await;
    tunnel.set_mode(raw.mode.parse::<TunnelMode>()?).await;

    let auth = raw.build_auth()?;
    let bind: std::net::IpAddr = raw
        .bind_address
        .parse()
        .with_context(|| format!("bad bind-address {}", raw.bind_address))?;

    let mut servers = Vec::new();
    if let Some(port) = raw.port.filter(|p| *p > 0) {
        let listener = TcpListener::bind(SocketAddr::new(bind, port)).await?;
        info!("HTTP proxy listening at: {}", listener.local_addr()?);
        let (tunnel, auth) = (tunnel.clone(), auth.clone());
        servers.push(tokio::spawn(async move {
            if let Err(e) = inbound::http::serve(listener, tunnel, auth).await {
                error!(error = %e, "http inbound stopped");
            }
        }));
    }
    if let Some(port) = raw.socks_port.filter(|p| *p > 0) {
        let listener = TcpListener::bind(SocketAddr::new(bind, port)).await?;
        info!("SOCKS proxy listening at: {}", listener.local_addr()?);
        let (tunnel, auth) = (tunnel.clone(), auth.clone());
        servers.push(tokio::spawn(async move {
            if let Err(e) = inbound::socks::serve(listener, tunnel, auth).await {
                error!(error = %e, "socks inbound stopped");
            }
        }));
    }
    if let Some(port) = raw.mixed_port.filter(|p| *p > 0) {
        let listener = TcpListener::bind(SocketAddr::new(bind, port)).await?;
        info!("Mixed proxy listening at: {}", listener.local_addr()?);
        let (tunnel, auth) = (tunnel.clone(), auth.clone());
        servers.push(tokio::spawn(async move {
            if let Err(e) = inbound::mixed::serve(listener, tunnel, auth).await {
                error!(error = %e, "mixed inbound stopped");
            }
        }));
    }
    if let Some(port) = raw.redir_port.filter(|p| *p > 0) {
        let listener = TcpListener::bind(SocketAddr::new(bind, port)).await?;
        info!("Redir proxy listening at: {}", listener.local_addr()?);
        let tunnel = tunnel.clone();
        servers.push(tokio::spawn(async move {
            if let Err(e) = inbound::redir::serve(listener, tunnel).await {
                error!(error = %e, "redir inbound stopped");
            }
        }));
    }
    if let Some(port) = raw.tproxy_port.filter(|p| *p > 0) {
        let listener = inbound::tproxy::bind(SocketAddr::new(bind, port)).await?;
        info!("TProxy listening at: {}", listener.local_addr()?);
        let tunnel = tunnel.clone();
        servers.push(tokio::spawn(async move {
            if let Err(e) = inbound::tproxy::serve(listener, tunnel).await {
                error!(error = %e, "tproxy inbound stopped");
            }
        }));
    }

    if servers.is_empty() {
        anyhow::bail!("no inbound port configured");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for server in &servers {
        server.abort();
    }
    registry.stop();
    tunnel.stop();
    Ok(())
}

//! YAML configuration and the pieces it builds.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use shunt_core::adapter::http::{HttpConfig, HttpOutbound};
use shunt_core::adapter::socks5::{Socks5Config, Socks5Outbound};
use shunt_core::adapter::ssr::{SsrConfig, SsrOutbound};
use shunt_core::adapter::vless::{VlessConfig, VlessOutbound};
use shunt_core::adapter::vmess::{VmessConfig, VmessOutbound};
use shunt_core::adapter::OutboundAdapter;
use shunt_core::dns::HostsTable;
use shunt_core::route::{Behavior, ProviderRegistry, Rule, RuleProvider, Vehicle};
use shunt_transport::{
    Dialer, EarlyDataDialer, TcpDialer, TlsConfig, TlsDialer, WebSocketConfig, WebSocketDialer,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawConfig {
    /// HTTP proxy port.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub socks_port: Option<u16>,
    #[serde(default)]
    pub mixed_port: Option<u16>,
    #[serde(default)]
    pub redir_port: Option<u16>,
    #[serde(default)]
    pub tproxy_port: Option<u16>,
    #[serde(default = "default_bind")]
    pub bind_address: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub log_level: Option<String>,
    /// `user:pass` entries for SOCKS/HTTP inbound auth.
    #[serde(default)]
    pub authentication: Vec<String>,
    #[serde(default)]
    pub hosts: HashMap<String, String>,
    /// Enables fake-IP reversal over this pool.
    #[serde(default)]
    pub fake_ip_range: Option<String>,
    #[serde(default)]
    pub tcp_timeout: Option<u64>,
    #[serde(default)]
    pub udp_timeout: Option<u64>,
    #[serde(default)]
    pub udp_session_timeout: Option<u64>,
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default)]
    pub rule_providers: HashMap<String, ProviderConfig>,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_mode() -> String {
    "rule".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProxyConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub server: String,
    pub port: u16,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub cipher: Option<String>,
    #[serde(default)]
    pub obfs: Option<String>,
    #[serde(default)]
    pub obfs_param: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub security: Option<String>,
    #[serde(default)]
    pub udp: bool,
    /// Layers TLS under the protocol (and under "ws", making it wss).
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub sni: Option<String>,
    /// "ws" layers a WebSocket transport under the protocol.
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub ws_path: Option<String>,
    #[serde(default)]
    pub ws_host: Option<String>,
    #[serde(default)]
    pub ws_early_data: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub behavior: String,
    pub path: String,
    #[serde(default)]
    pub url: Option<String>,
    /// Refresh period in seconds; 0 or absent disables the pull loop.
    #[serde(default)]
    pub interval: Option<u64>,
}

pub fn load(path: &Path) -> Result<RawConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let config: RawConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("parse config {}", path.display()))?;
    Ok(config)
}

impl RawConfig {
    pub fn tunnel_config(&self) -> shunt_core::TunnelConfig {
        let mut cfg = shunt_core::TunnelConfig::default();
        if let Some(secs) = self.tcp_timeout {
            cfg.tcp_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.udp_timeout {
            cfg.udp_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.udp_session_timeout {
            cfg.udp_session_timeout = Duration::from_secs(secs);
        }
        cfg
    }

    pub fn build_hosts(&self) -> Result<HostsTable> {
        let mut hosts = HostsTable::new();
        for (name, ip) in &self.hosts {
            let ip = ip
                .parse()
                .with_context(|| format!("hosts entry {name}: bad ip {ip}"))?;
            hosts
                .insert(name, ip)
                .with_context(|| format!("hosts entry {name}"))?;
        }
        Ok(hosts)
    }

    pub fn build_rules(&self) -> Result<Vec<Rule>> {
        self.rules
            .iter()
            .map(|line| Rule::parse(line).with_context(|| format!("rule {line:?}")))
            .collect()
    }

    pub fn build_proxies(&self) -> Result<Vec<Arc<dyn OutboundAdapter>>> {
        self.proxies.iter().map(build_proxy).collect()
    }

    pub fn build_providers(&self, home: &Path) -> Result<ProviderRegistry> {
        let mut registry = ProviderRegistry::new();
        for (name, cfg) in &self.rule_providers {
            let behavior = match cfg.behavior.as_str() {
                "domain" => Behavior::Domain,
                "ipcidr" => Behavior::IpCidr,
                "classical" => Behavior::Classical,
                other => bail!("rule provider {name}: unsupported behavior {other}"),
            };
            let path = resolve_path(home, &cfg.path);
            let vehicle = match cfg.kind.as_str() {
                "file" => Vehicle::File { path },
                "http" => Vehicle::Http {
                    url: cfg
                        .url
                        .clone()
                        .with_context(|| format!("rule provider {name}: http needs url"))?,
                    path,
                },
                other => bail!("rule provider {name}: unsupported vehicle {other}"),
            };
            let interval = cfg
                .interval
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs);
            registry.insert(RuleProvider::new(name.clone(), behavior, interval, vehicle));
        }
        Ok(registry)
    }

    pub fn build_auth(&self) -> Result<Option<Arc<shunt_core::inbound::Authenticator>>> {
        if self.authentication.is_empty() {
            return Ok(None);
        }
        let mut users = HashMap::new();
        for entry in &self.authentication {
            let Some((user, pass)) = entry.split_once(':') else {
                bail!("authentication entry {entry:?} is not user:pass");
            };
            users.insert(user.to_string(), pass.to_string());
        }
        Ok(Some(Arc::new(shunt_core::inbound::Authenticator::new(
            users,
        ))))
    }
}

/// Relative provider paths land under the home directory.
pub fn resolve_path(home: &Path, path: &str) -> PathBuf {
    let p = PathBuf::from(path);
    if p.is_absolute() {
        p
    } else {
        home.join(p)
    }
}

fn build_dialer(cfg: &ProxyConfig) -> Arc<dyn Dialer> {
    let mut dialer: Arc<dyn Dialer> = Arc::new(TcpDialer);
    if cfg.tls {
        dialer = Arc::new(TlsDialer::new(
            TlsConfig {
                sni: cfg.sni.clone(),
                alpn: Vec::new(),
            },
            dialer,
        ));
    }
    if cfg.network.as_deref() != Some("ws") {
        return dialer;
    }
    let ws = WebSocketConfig {
        path: cfg.ws_path.clone().unwrap_or_else(|| "/".to_string()),
        host: cfg.ws_host.clone(),
        headers: Vec::new(),
        max_early_data: cfg.ws_early_data.unwrap_or(0),
    };
    if ws.max_early_data > 0 {
        Arc::new(EarlyDataDialer::new(ws, dialer))
    } else {
        Arc::new(WebSocketDialer::new(ws, dialer))
    }
}

fn build_proxy(cfg: &ProxyConfig) -> Result<Arc<dyn OutboundAdapter>> {
    let dialer = build_dialer(cfg);
    let proxy: Arc<dyn OutboundAdapter> = match cfg.kind.as_str() {
        "vless" => {
            let uuid = cfg
                .uuid
                .as_deref()
                .with_context(|| format!("proxy {}: vless needs uuid", cfg.name))?
                .parse::<uuid::Uuid>()
                .with_context(|| format!("proxy {}: bad uuid", cfg.name))?;
            Arc::new(VlessOutbound::new(
                VlessConfig {
                    name: cfg.name.clone(),
                    server: cfg.server.clone(),
                    port: cfg.port,
                    uuid,
                    udp: cfg.udp,
                },
                dialer,
            ))
        }
        "vmess" => {
            let uuid = cfg
                .uuid
                .as_deref()
                .with_context(|| format!("proxy {}: vmess needs uuid", cfg.name))?
                .parse::<uuid::Uuid>()
                .with_context(|| format!("proxy {}: bad uuid", cfg.name))?;
            Arc::new(
                VmessOutbound::new(
                    VmessConfig {
                        name: cfg.name.clone(),
                        server: cfg.server.clone(),
                        port: cfg.port,
                        uuid,
                        security: cfg
                            .security
                            .clone()
                            .unwrap_or_else(|| "aes-128-gcm".to_string()),
                    },
                    dialer,
                )
                .with_context(|| format!("proxy {}", cfg.name))?,
            )
        }
        "ssr" => Arc::new(
            SsrOutbound::new(
                SsrConfig {
                    name: cfg.name.clone(),
                    server: cfg.server.clone(),
                    port: cfg.port,
                    password: cfg
                        .password
                        .clone()
                        .with_context(|| format!("proxy {}: ssr needs password", cfg.name))?,
                    cipher: cfg
                        .cipher
                        .clone()
                        .unwrap_or_else(|| "aes-256-ctr".to_string()),
                    protocol: cfg.protocol.clone().unwrap_or_else(|| "origin".to_string()),
                    obfs: cfg.obfs.clone().unwrap_or_else(|| "plain".to_string()),
                    obfs_param: cfg.obfs_param.clone(),
                },
                dialer,
            )
            .with_context(|| format!("proxy {}", cfg.name))?,
        ),
        "http" => Arc::new(HttpOutbound::new(
            HttpConfig {
                name: cfg.name.clone(),
                server: cfg.server.clone(),
                port: cfg.port,
                username: cfg.username.clone(),
                password: cfg.password.clone(),
            },
            dialer,
        )),
        "socks5" => Arc::new(Socks5Outbound::new(
            Socks5Config {
                name: cfg.name.clone(),
                server: cfg.server.clone(),
                port: cfg.port,
                username: cfg.username.clone(),
                password: cfg.password.clone(),
            },
            dialer,
        )),
        other => bail!("proxy {}: unsupported type {other}", cfg.name),
    };
    Ok(proxy)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
mixed-port: 7890
mode: rule
log-level: info
hosts:
  router.local: 192.168.1.1
proxies:
  - name: vless-ws
    type: vless
    server: example.com
    port: 443
    uuid: 9c6c1dda-0130-4b9a-a886-a62e1fb56d2f
    udp: true
    tls: true
    sni: cdn.example.com
    network: ws
    ws-path: /tunnel
    ws-early-data: 2048
  - name: ssr-node
    type: ssr
    server: 10.0.0.2
    port: 8388
    password: secret
    cipher: aes-256-ctr
    obfs: http_simple
rules:
  - DOMAIN-SUFFIX,google.com,vless-ws
  - IP-CIDR,10.0.0.0/8,DIRECT,no-resolve
  - MATCH,DIRECT
rule-providers:
  reject:
    type: http
    behavior: domain
    url: https://example.com/reject.yaml
    path: ./providers/reject.yaml
    interval: 86400
"#;

    #[test]
    fn sample_config_builds() {
        let cfg: RawConfig = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.mixed_port, Some(7890));
        assert_eq!(cfg.mode, "rule");

        let rules = cfg.build_rules().unwrap();
        assert_eq!(rules.len(), 3);

        let proxies = cfg.build_proxies().unwrap();
        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[0].name(), "vless-ws");
        assert!(proxies[0].supports_udp());
        assert!(!proxies[1].supports_udp());

        let hosts = cfg.build_hosts().unwrap();
        assert_eq!(
            hosts.lookup("router.local"),
            Some("192.168.1.1".parse().unwrap())
        );

        let registry = cfg.build_providers(Path::new("/tmp/shunt")).unwrap();
        let provider = registry.get("reject").unwrap();
        assert_eq!(provider.behavior(), Behavior::Domain);
        assert_eq!(provider.interval(), Some(Duration::from_secs(86400)));
    }

    #[test]
    fn bad_rule_line_is_rejected() {
        let cfg: RawConfig = serde_yaml::from_str("rules: ['BOGUS,x,y']").unwrap();
        assert!(cfg.build_rules().is_err());
    }

    #[test]
    fn relative_provider_paths_resolve_under_home() {
        let p = resolve_path(Path::new("/home/u/.config/shunt"), "providers/a.yaml");
        assert_eq!(
            p,
            PathBuf::from("/home/u/.config/shunt/providers/a.yaml")
        );
        let abs = resolve_path(Path::new("/home/u"), "/etc/a.yaml");
        assert_eq!(abs, PathBuf::from("/etc/a.yaml"));
    }
}

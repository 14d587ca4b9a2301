//! Rule predicates and the classical `TYPE,PAYLOAD,TARGET[,PARAM]` grammar.

use std::collections::HashMap;
use std::sync::Arc;

use ipnet::IpNet;

use super::geoip::GeoIpLookup;
use super::process;
use super::provider::{Behavior, RuleProvider};
use crate::error::{Error, Result};
use crate::session::{Metadata, Network};

/// Everything a match call may consult besides the metadata itself.
pub struct MatchContext<'a> {
    pub providers: &'a HashMap<String, Arc<RuleProvider>>,
    pub geoip: Option<&'a dyn GeoIpLookup>,
}

impl<'a> MatchContext<'a> {
    pub fn empty() -> MatchContext<'static> {
        static EMPTY: once_cell::sync::Lazy<HashMap<String, Arc<RuleProvider>>> =
            once_cell::sync::Lazy::new(HashMap::new);
        MatchContext {
            providers: &EMPTY,
            geoip: None,
        }
    }

    pub fn with_providers(providers: &'a HashMap<String, Arc<RuleProvider>>) -> Self {
        MatchContext {
            providers,
            geoip: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RuleKind {
    Domain(String),
    DomainSuffix(String),
    DomainKeyword(String),
    IpCidr { net: IpNet, no_resolve: bool },
    GeoIp { country: String, no_resolve: bool },
    DstPort(u16),
    SrcPort(u16),
    Process { name: String, full_match: bool },
    Network(Network),
    RuleSet(String),
    Match,
}

/// One entry of the ordered rule table: a predicate plus the adapter it
/// commits the flow to.
#[derive(Debug, Clone)]
pub struct Rule {
    kind: RuleKind,
    adapter: String,
}

impl Rule {
    pub fn new(kind: RuleKind, adapter: impl Into<String>) -> Self {
        Self {
            kind,
            adapter: adapter.into(),
        }
    }

    /// Parses a classical rule line. `MATCH,TARGET` has no payload; everything
    /// else is `TYPE,PAYLOAD,TARGET[,PARAM,...]`.
    pub fn parse(line: &str) -> Result<Rule> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let kind_tag = fields
            .first()
            .copied()
            .ok_or_else(|| Error::RuleParse(line.to_string()))?
            .to_ascii_uppercase();

        if kind_tag == "MATCH" {
            let target = fields
                .get(1)
                .ok_or_else(|| Error::RuleParse(line.to_string()))?;
            return Ok(Rule::new(RuleKind::Match, *target));
        }

        let payload = fields
            .get(1)
            .ok_or_else(|| Error::RuleParse(line.to_string()))?;
        let target = fields
            .get(2)
            .ok_or_else(|| Error::RuleParse(line.to_string()))?;
        let params = &fields[3.min(fields.len())..];
        let no_resolve = params.iter().any(|p| *p == "no-resolve");
        let full_match = params.iter().any(|p| *p == "full-match");

        let kind = match kind_tag.as_str() {
            "DOMAIN" => RuleKind::Domain(payload.to_ascii_lowercase()),
            "DOMAIN-SUFFIX" => RuleKind::DomainSuffix(payload.to_ascii_lowercase()),
            "DOMAIN-KEYWORD" => RuleKind::DomainKeyword(payload.to_ascii_lowercase()),
            "IP-CIDR" | "IP-CIDR6" => RuleKind::IpCidr {
                net: payload
                    .parse()
                    .map_err(|_| Error::RuleParse(line.to_string()))?,
                no_resolve,
            },
            "GEOIP" => RuleKind::GeoIp {
                country: payload.to_ascii_uppercase(),
                no_resolve,
            },
            "DST-PORT" => RuleKind::DstPort(
                payload
                    .parse()
                    .map_err(|_| Error::RuleParse(line.to_string()))?,
            ),
            "SRC-PORT" => RuleKind::SrcPort(
                payload
                    .parse()
                    .map_err(|_| Error::RuleParse(line.to_string()))?,
            ),
            "PROCESS-NAME" => RuleKind::Process {
                name: payload.to_string(),
                full_match: full_match || payload.contains('/'),
            },
            "NETWORK" => RuleKind::Network(match payload.to_ascii_lowercase().as_str() {
                "tcp" => Network::Tcp,
                "udp" => Network::Udp,
                _ => return Err(Error::RuleParse(line.to_string())),
            }),
            "RULE-SET" => RuleKind::RuleSet(payload.to_string()),
            _ => return Err(Error::RuleParse(line.to_string())),
        };
        Ok(Rule::new(kind, *target))
    }

    pub fn kind(&self) -> &RuleKind {
        &self.kind
    }

    pub fn adapter(&self) -> &str {
        &self.adapter
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            RuleKind::Domain(_) => "Domain",
            RuleKind::DomainSuffix(_) => "DomainSuffix",
            RuleKind::DomainKeyword(_) => "DomainKeyword",
            RuleKind::IpCidr { .. } => "IPCIDR",
            RuleKind::GeoIp { .. } => "GeoIP",
            RuleKind::DstPort(_) => "DstPort",
            RuleKind::SrcPort(_) => "SrcPort",
            RuleKind::Process { .. } => "Process",
            RuleKind::Network(_) => "Network",
            RuleKind::RuleSet(_) => "RuleSet",
            RuleKind::Match => "Match",
        }
    }

    /// Debug payload for logs.
    pub fn payload(&self) -> String {
        match &self.kind {
            RuleKind::Domain(d) | RuleKind::DomainSuffix(d) | RuleKind::DomainKeyword(d) => {
                d.clone()
            }
            RuleKind::IpCidr { net, .. } => net.to_string(),
            RuleKind::GeoIp { country, .. } => country.clone(),
            RuleKind::DstPort(p) | RuleKind::SrcPort(p) => p.to_string(),
            RuleKind::Process { name, .. } => name.clone(),
            RuleKind::Network(n) => n.as_str().to_string(),
            RuleKind::RuleSet(name) => name.clone(),
            RuleKind::Match => String::new(),
        }
    }

    /// Whether the matcher should lazily resolve the host before evaluating
    /// this rule. IP-keyed rules want an IP unless tagged `no-resolve`;
    /// rule-sets inherit from the provider's behavior.
    pub fn should_resolve_ip(&self, ctx: &MatchContext<'_>) -> bool {
        match &self.kind {
            RuleKind::IpCidr { no_resolve, .. } | RuleKind::GeoIp { no_resolve, .. } => {
                !no_resolve
            }
            RuleKind::RuleSet(name) => ctx
                .providers
                .get(name)
                .map(|p| p.behavior() != Behavior::Domain)
                .unwrap_or(false),
            _ => false,
        }
    }

    pub fn matches(&self, metadata: &Metadata, ctx: &MatchContext<'_>) -> bool {
        match &self.kind {
            RuleKind::Domain(domain) => metadata.host.eq_ignore_ascii_case(domain),
            RuleKind::DomainSuffix(suffix) => {
                let host = metadata.host.to_ascii_lowercase();
                host == *suffix || host.ends_with(&format!(".{suffix}"))
            }
            RuleKind::DomainKeyword(keyword) => {
                metadata.host.to_ascii_lowercase().contains(keyword)
            }
            RuleKind::IpCidr { net, .. } => metadata
                .dst_ip
                .map(|ip| net.contains(&ip))
                .unwrap_or(false),
            RuleKind::GeoIp { country, .. } => {
                let Some(ip) = metadata.dst_ip else {
                    return false;
                };
                let Some(geoip) = ctx.geoip else {
                    return false;
                };
                geoip
                    .lookup_country(ip)
                    .map(|c| c.eq_ignore_ascii_case(country))
                    .unwrap_or(false)
            }
            RuleKind::DstPort(port) => metadata.dst_port == *port,
            RuleKind::SrcPort(port) => metadata.src_port == *port,
            RuleKind::Process { name, full_match } => {
                let Some(src_ip) = metadata.src_ip else {
                    return false;
                };
                let path =
                    process::find_process_path(metadata.network, src_ip, metadata.src_port);
                if path.is_empty() {
                    return false;
                }
                if *full_match {
                    path.eq_ignore_ascii_case(name)
                } else {
                    process::base_name(&path).eq_ignore_ascii_case(name)
                }
            }
            RuleKind::Network(network) => metadata.network == *network,
            RuleKind::RuleSet(name) => ctx
                .providers
                .get(name)
                .map(|p| p.search(metadata, ctx))
                .unwrap_or(false),
            RuleKind::Match => true,
        }
    }
}

//! Rule providers: externally sourced rule sets, typed by behavior.
//!
//! A provider owns a [`Fetcher`] and the parsed structure it feeds: a domain
//! trie, an IP-CIDR trie, or an embedded classical rule list. After
//! `initial()` every `search` is a pure in-memory lookup. Lifecycle is
//! explicit: the [`ProviderRegistry`] starts and stops the refresh loops, no
//! reliance on destructors firing in any order.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv6Net;
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::domain_trie::DomainTrie;
use super::fetcher::{Fetcher, Vehicle, VehicleKind};
use super::ipcidr_trie::IpCidrTrie;
use super::rules::{MatchContext, Rule};
use crate::error::{Error, Result};
use crate::session::Metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Domain,
    IpCidr,
    Classical,
}

impl Behavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            Behavior::Domain => "Domain",
            Behavior::IpCidr => "IPCIDR",
            Behavior::Classical => "Classical",
        }
    }
}

/// The on-disk rule-set document.
#[derive(Debug, Deserialize)]
struct RulePayload {
    payload: Vec<String>,
}

pub enum RuleSetData {
    Domain(DomainTrie<()>),
    IpCidr { v4: IpCidrTrie, v6: Vec<Ipv6Net> },
    Classical(Vec<Rule>),
}

/// Splits a payload entry the classical way: `TYPE,REST` or bare value.
fn split_entry(line: &str) -> (Option<&str>, &str) {
    match line.split_once(',') {
        Some((kind, _)) => (Some(kind), line),
        None => (None, line),
    }
}

fn parse_payload(name: &str, behavior: Behavior, buf: &[u8]) -> Result<(RuleSetData, usize)> {
    let doc: RulePayload =
        serde_yaml::from_slice(buf).map_err(|e| Error::provider(name, e))?;
    let count = doc.payload.len();

    let data = match behavior {
        Behavior::Domain => {
            let mut trie = DomainTrie::new();
            for line in &doc.payload {
                let (kind, _) = split_entry(line);
                if kind.is_some() {
                    return Err(Error::provider(name, format!("bad domain entry: {line}")));
                }
                let entry = line.trim().to_ascii_lowercase();
                if let Some(rest) = entry.strip_prefix("+.") {
                    // "+." covers the apex and every subdomain
                    trie.insert(rest, ())?;
                    trie.insert(&format!("*.{rest}"), ())?;
                } else {
                    trie.insert(&entry, ())?;
                }
            }
            RuleSetData::Domain(trie)
        }
        Behavior::IpCidr => {
            let mut v4 = IpCidrTrie::new();
            let mut v6 = Vec::new();
            for line in &doc.payload {
                let (kind, _) = split_entry(line);
                if kind.is_some() {
                    return Err(Error::provider(name, format!("bad ip-cidr entry: {line}")));
                }
                let entry = line.trim();
                if entry.contains(':') {
                    let net: Ipv6Net = entry
                        .parse()
                        .map_err(|_| Error::InvalidIpCidr(entry.to_string()))?;
                    v6.push(net);
                } else {
                    v4.insert_str(entry)?;
                }
            }
            RuleSetData::IpCidr { v4, v6 }
        }
        Behavior::Classical => {
            let mut rules = Vec::with_capacity(count);
            for line in &doc.payload {
                if line.to_ascii_uppercase().starts_with("RULE-SET,") {
                    return Err(Error::provider(name, "nested RULE-SET is not allowed"));
                }
                rules.push(Rule::parse(line)?);
            }
            RuleSetData::Classical(rules)
        }
    };
    Ok((data, count))
}

/// A named, periodically refreshed rule set.
pub struct RuleProvider {
    name: String,
    behavior: Behavior,
    interval: Option<Duration>,
    fetcher: tokio::sync::Mutex<Fetcher<(RuleSetData, usize)>>,
    data: RwLock<Option<RuleSetData>>,
    count: AtomicUsize,
}

impl RuleProvider {
    pub fn new(
        name: impl Into<String>,
        behavior: Behavior,
        interval: Option<Duration>,
        vehicle: Vehicle,
    ) -> Arc<Self> {
        let name = name.into();
        let parser_name = name.clone();
        let fetcher = Fetcher::new(
            name.clone(),
            vehicle,
            Box::new(move |buf| parse_payload(&parser_name, behavior, buf)),
        );
        Arc::new(Self {
            name,
            behavior,
            interval,
            fetcher: tokio::sync::Mutex::new(fetcher),
            data: RwLock::new(None),
            count: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn behavior(&self) -> Behavior {
        self.behavior
    }

    pub fn rule_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn vehicle_kind(&self) -> VehicleKind {
        // the fetcher is only locked across awaits; kind is immutable
        self.fetcher
            .try_lock()
            .map(|f| f.vehicle_kind())
            .unwrap_or(VehicleKind::File)
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub async fn initial(&self) -> Result<()> {
        let parsed = self.fetcher.lock().await.initial().await?;
        self.install(parsed);
        Ok(())
    }

    /// Refresh once. `Ok(true)` means content was unchanged.
    pub async fn update(&self) -> Result<bool> {
        let (parsed, same) = self.fetcher.lock().await.update().await?;
        if let Some(parsed) = parsed {
            self.install(parsed);
        }
        Ok(same)
    }

    fn install(&self, (data, count): (RuleSetData, usize)) {
        *self.data.write() = Some(data);
        self.count.store(count, Ordering::Relaxed);
    }

    /// Pure in-memory membership test; never blocks on I/O.
    pub fn search(&self, metadata: &Metadata, ctx: &MatchContext<'_>) -> bool {
        let guard = self.data.read();
        match guard.as_ref() {
            None => false,
            Some(RuleSetData::Domain(trie)) => {
                !metadata.host.is_empty() && trie.contains(&metadata.host.to_ascii_lowercase())
            }
            Some(RuleSetData::IpCidr { v4, v6 }) => match metadata.dst_ip {
                Some(IpAddr::V4(ip)) => v4.contains(ip),
                Some(IpAddr::V6(ip)) => v6.iter().any(|net| net.contains(&ip)),
                None => false,
            },
            Some(RuleSetData::Classical(rules)) => {
                rules.iter().any(|rule| rule.matches(metadata, ctx))
            }
        }
    }
}

/// Owns the providers and their refresh loops.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<RuleProvider>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, provider: Arc<RuleProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<RuleProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn providers(&self) -> HashMap<String, Arc<RuleProvider>> {
        self.providers.clone()
    }

    /// Loads every provider; a failure aborts startup (configuration error).
    pub async fn initial_all(&self) -> Result<()> {
        for provider in self.providers.values() {
            provider.initial().await?;
            info!(
                provider = provider.name(),
                behavior = provider.behavior().as_str(),
                rules = provider.rule_count(),
                "rule provider loaded"
            );
        }
        Ok(())
    }

    /// Starts the refresh loops. Fetch errors are logged and the previous
    /// data kept.
    pub fn start(&mut self) {
        for provider in self.providers.values() {
            let Some(interval) = provider.interval() else {
                continue;
            };
            let provider = provider.clone();
            self.tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await; // the immediate first tick
                loop {
                    ticker.tick().await;
                    match provider.update().await {
                        Ok(true) => {
                            debug!(provider = provider.name(), "rule set unchanged")
                        }
                        Ok(false) => {
                            info!(
                                provider = provider.name(),
                                rules = provider.rule_count(),
                                "rule set updated"
                            )
                        }
                        Err(e) => {
                            warn!(provider = provider.name(), error = %e, "rule set pull failed")
                        }
                    }
                }
            }));
        }
    }

    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ProviderRegistry {
    fn drop(&mut self) {
        self.stop();
    }
}

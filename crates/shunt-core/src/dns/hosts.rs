//! Hosts-file entries as a domain trie.

use std::net::IpAddr;

use crate::error::Result;
use crate::route::domain_trie::DomainTrie;

/// Static host → IP pins. Consulted before any rule matching and again when a
/// fake IP reverses to a pinned host.
#[derive(Debug, Default)]
pub struct HostsTable {
    trie: DomainTrie<IpAddr>,
}

impl HostsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, domain: &str, ip: IpAddr) -> Result<()> {
        self.trie.insert(domain, ip)
    }

    pub fn lookup(&self, host: &str) -> Option<IpAddr> {
        self.trie.search(host).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }
}

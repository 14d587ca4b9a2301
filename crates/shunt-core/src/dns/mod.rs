//! Resolver facade.
//!
//! The engine never talks DNS wire format; it needs three things: host → IP,
//! the hosts-file trie, and the fake-IP reverse mapping the DNS subsystem
//! maintains. Each is a trait so the real resolver stays an external
//! collaborator.

pub mod hosts;

use std::net::IpAddr;
use std::num::NonZeroUsize;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use crate::error::Error;

pub use hosts::HostsTable;

/// Host → IP. IPv4 is preferred when both families answer.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve_ip(&self, host: &str) -> Result<IpAddr, Error>;
}

/// Resolves through the operating system.
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn resolve_ip(&self, host: &str) -> Result<IpAddr, Error> {
        let mut last_v6 = None;
        let addrs = tokio::net::lookup_host((host, 0)).await.map_err(|e| Error::Resolve {
            host: host.to_string(),
            msg: e.to_string(),
        })?;
        for addr in addrs {
            match addr.ip() {
                ip @ IpAddr::V4(_) => return Ok(ip),
                ip @ IpAddr::V6(_) => last_v6 = Some(ip),
            }
        }
        last_v6.ok_or_else(|| Error::Resolve {
            host: host.to_string(),
            msg: "no address".to_string(),
        })
    }
}

/// Reverse view over the DNS subsystem's synthetic-address allocator.
///
/// `find_host` answers for any IP the subsystem has ever mapped (fake or
/// pinned); `is_fake_ip` answers whether an IP lies inside the fake pool at
/// all, mapped or not.
pub trait FakeIpMapper: Send + Sync {
    /// Whether fake-IP mode (as opposed to plain mapping) is active.
    fn fake_ip_enabled(&self) -> bool;
    fn find_host(&self, ip: IpAddr) -> Option<String>;
    fn is_fake_ip(&self, ip: IpAddr) -> bool;
    /// Whether this exact IP currently has a live mapping.
    fn exists(&self, ip: IpAddr) -> bool;
}

/// In-memory mapper backing tests and the default fake-IP wiring: a bounded
/// two-way LRU over a configured IPv4 pool.
pub struct MemoryMapper {
    pool: ipnet::Ipv4Net,
    fake_ip: bool,
    state: Mutex<MapperState>,
}

struct MapperState {
    next: u32,
    by_host: LruCache<String, IpAddr>,
    by_ip: LruCache<IpAddr, String>,
}

impl MemoryMapper {
    pub fn new(pool: ipnet::Ipv4Net, fake_ip: bool, capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(2)).expect("capacity");
        Self {
            pool,
            fake_ip,
            state: Mutex::new(MapperState {
                next: 1,
                by_host: LruCache::new(cap),
                by_ip: LruCache::new(cap),
            }),
        }
    }

    /// Allocates (or returns) the fake address for a host.
    pub fn allocate(&self, host: &str) -> IpAddr {
        let mut st = self.state.lock();
        if let Some(ip) = st.by_host.get(host) {
            return *ip;
        }
        let base = u32::from(self.pool.network());
        let host_bits = 32u32.saturating_sub(self.pool.prefix_len() as u32);
        let hosts = if host_bits >= 32 { u32::MAX } else { 1u32 << host_bits };
        let offset = (st.next % hosts.max(2)).max(1);
        st.next = st.next.wrapping_add(1);
        let ip = IpAddr::V4(std::net::Ipv4Addr::from(base.wrapping_add(offset)));
        st.by_host.put(host.to_string(), ip);
        st.by_ip.put(ip, host.to_string());
        ip
    }
}

impl FakeIpMapper for MemoryMapper {
    fn fake_ip_enabled(&self) -> bool {
        self.fake_ip
    }

    fn find_host(&self, ip: IpAddr) -> Option<String> {
        self.state.lock().by_ip.get(&ip).cloned()
    }

    fn is_fake_ip(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.pool.contains(&v4),
            IpAddr::V6(_) => false,
        }
    }

    fn exists(&self, ip: IpAddr) -> bool {
        self.state.lock().by_ip.contains(&ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> MemoryMapper {
        MemoryMapper::new("198.18.0.0/16".parse().unwrap(), true, 64)
    }

    #[test]
    fn allocate_is_stable_per_host() {
        let m = mapper();
        let a = m.allocate("example.com");
        let b = m.allocate("example.com");
        assert_eq!(a, b);
        assert!(m.is_fake_ip(a));
        assert!(m.exists(a));
        assert_eq!(m.find_host(a).as_deref(), Some("example.com"));
    }

    #[test]
    fn pool_membership_is_not_existence() {
        let m = mapper();
        let unmapped: IpAddr = "198.18.200.200".parse().unwrap();
        assert!(m.is_fake_ip(unmapped));
        assert!(!m.exists(unmapped));
        let outside: IpAddr = "8.8.8.8".parse().unwrap();
        assert!(!m.is_fake_ip(outside));
    }
}

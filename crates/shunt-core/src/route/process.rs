//! Process-name lookup for PROCESS-NAME rules.
//!
//! On Linux the socket inode is found in `/proc/net/{tcp,udp}{,6}` by local
//! address, then matched against `/proc/<pid>/fd`. Lookups are cached for a
//! couple of seconds keyed by `network:src_ip:src_port`, since a chatty flow
//! hits the matcher far more often than processes come and go.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

use crate::session::Network;

const CACHE_SIZE: usize = 64;
const CACHE_TTL: Duration = Duration::from_secs(2);

static CACHE: Lazy<Mutex<LruCache<String, (String, Instant)>>> = Lazy::new(|| {
    Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_SIZE).unwrap()))
});

/// Full path of the process owning the socket, empty string when unknown.
pub fn find_process_path(network: Network, src_ip: IpAddr, src_port: u16) -> String {
    let key = format!("{}:{}:{}", network.as_str(), src_ip, src_port);
    {
        let mut cache = CACHE.lock();
        if let Some((name, at)) = cache.get(&key) {
            if at.elapsed() < CACHE_TTL {
                return name.clone();
            }
        }
    }

    let name = match resolve(network, src_ip, src_port) {
        Ok(name) => name,
        Err(e) => {
            debug!(error = %e, "find process name failed");
            String::new()
        }
    };
    CACHE.lock().put(key, (name.clone(), Instant::now()));
    name
}

/// Last path component, for basename matching.
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(target_os = "linux")]
fn resolve(network: Network, src_ip: IpAddr, src_port: u16) -> std::io::Result<String> {
    let inode = find_socket_inode(network, src_ip, src_port)?;
    find_process_by_inode(inode)
}

#[cfg(not(target_os = "linux"))]
fn resolve(_network: Network, _src_ip: IpAddr, _src_port: u16) -> std::io::Result<String> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process lookup not supported on this platform",
    ))
}

#[cfg(target_os = "linux")]
fn find_socket_inode(network: Network, src_ip: IpAddr, src_port: u16) -> std::io::Result<u64> {
    let tables: &[&str] = match (network, src_ip.is_ipv4()) {
        (Network::Tcp, true) => &["/proc/net/tcp"],
        (Network::Tcp, false) => &["/proc/net/tcp6"],
        (Network::Udp, true) => &["/proc/net/udp"],
        (Network::Udp, false) => &["/proc/net/udp6"],
    };

    for table in tables {
        let content = std::fs::read_to_string(table)?;
        for line in content.lines().skip(1) {
            let mut fields = line.split_whitespace();
            let Some(local) = fields.nth(1) else { continue };
            let Some((addr_hex, port_hex)) = local.split_once(':') else {
                continue;
            };
            let Ok(port) = u16::from_str_radix(port_hex, 16) else {
                continue;
            };
            if port != src_port {
                continue;
            }
            if !hex_addr_matches(addr_hex, src_ip) {
                continue;
            }
            // inode is the 10th field
            if let Some(inode) = line.split_whitespace().nth(9) {
                if let Ok(inode) = inode.parse::<u64>() {
                    return Ok(inode);
                }
            }
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "socket not found in proc tables",
    ))
}

/// procfs prints addresses as little-endian hex words.
#[cfg(target_os = "linux")]
fn hex_addr_matches(hex: &str, ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let Ok(raw) = u32::from_str_radix(hex, 16) else {
                return false;
            };
            std::net::Ipv4Addr::from(raw.swap_bytes()) == v4 || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            if hex.len() != 32 {
                return false;
            }
            let mut octets = [0u8; 16];
            for (i, chunk) in hex.as_bytes().chunks(8).enumerate() {
                let Ok(word) = u32::from_str_radix(std::str::from_utf8(chunk).unwrap_or(""), 16)
                else {
                    return false;
                };
                octets[i * 4..i * 4 + 4].copy_from_slice(&word.swap_bytes().to_be_bytes());
            }
            std::net::Ipv6Addr::from(octets) == v6 || v6.is_unspecified()
        }
    }
}

#[cfg(target_os = "linux")]
fn find_process_by_inode(inode: u64) -> std::io::Result<String> {
    let target = format!("socket:[{inode}]");
    for entry in std::fs::read_dir("/proc")? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(pid) = name.to_str().filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
        else {
            continue;
        };
        let fd_dir = format!("/proc/{pid}/fd");
        let Ok(fds) = std::fs::read_dir(&fd_dir) else {
            continue;
        };
        for fd in fds.flatten() {
            if let Ok(link) = std::fs::read_link(fd.path()) {
                if link.to_string_lossy() == target {
                    let exe = std::fs::read_link(format!("/proc/{pid}/exe"))?;
                    return Ok(exe.to_string_lossy().into_owned());
                }
            }
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "no process owns the socket",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_name_strips_directories() {
        assert_eq!(base_name("/usr/bin/curl"), "curl");
        assert_eq!(base_name("curl"), "curl");
        assert_eq!(base_name(""), "");
    }

    #[test]
    fn unknown_socket_yields_empty() {
        // 0-port sockets never appear in the proc tables
        let name = find_process_path(Network::Tcp, "127.0.0.1".parse().unwrap(), 0);
        assert_eq!(name, "");
    }
}

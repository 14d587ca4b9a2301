//! GeoIP boundary.
//!
//! The MMDB reader is an external collaborator; the engine only needs a
//! country for an IP. [`StaticGeoIp`] backs tests and small setups from a
//! CIDR list.

use std::net::IpAddr;

use ipnet::IpNet;

pub trait GeoIpLookup: Send + Sync {
    /// ISO country code for the address, uppercase.
    fn lookup_country(&self, ip: IpAddr) -> Option<String>;
}

/// CIDR-list backed lookup.
#[derive(Debug, Default)]
pub struct StaticGeoIp {
    entries: Vec<(IpNet, String)>,
}

impl StaticGeoIp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, net: IpNet, country: &str) {
        self.entries.push((net, country.to_ascii_uppercase()));
    }
}

impl GeoIpLookup for StaticGeoIp {
    fn lookup_country(&self, ip: IpAddr) -> Option<String> {
        self.entries
            .iter()
            .find(|(net, _)| net.contains(&ip))
            .map(|(_, country)| country.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_cidr() {
        let mut geo = StaticGeoIp::new();
        geo.insert("1.0.0.0/8".parse().unwrap(), "au");
        geo.insert("2001:db8::/32".parse().unwrap(), "ZZ");
        assert_eq!(
            geo.lookup_country("1.2.3.4".parse().unwrap()).as_deref(),
            Some("AU")
        );
        assert_eq!(
            geo.lookup_country("2001:db8::1".parse().unwrap()).as_deref(),
            Some("ZZ")
        );
        assert_eq!(geo.lookup_country("9.9.9.9".parse().unwrap()), None);
    }
}

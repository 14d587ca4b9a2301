//! Rule matching: tries, rule predicates, providers.

pub mod domain_trie;
pub mod fetcher;
pub mod geoip;
pub mod ipcidr_trie;
pub mod process;
pub mod provider;
pub mod rules;

pub use domain_trie::DomainTrie;
pub use fetcher::{Fetcher, Vehicle, VehicleKind};
pub use geoip::{GeoIpLookup, StaticGeoIp};
pub use ipcidr_trie::IpCidrTrie;
pub use provider::{Behavior, ProviderRegistry, RuleProvider};
pub use rules::{MatchContext, Rule, RuleKind};

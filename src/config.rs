//! Configuration constants for the routing core: a plain struct with a
//! hand-written `Default` impl, overridable by a host application loaded
//! from a TOML file rather than baked in as `const`s.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RoutingConfig {
    /// Slab size of the routing table.
    pub number_of_entries: usize,
    /// Max wait for a pool allocation before it fails with `PoolExhausted`.
    pub allocation_interval: Duration,
    /// Valid-entry auto-expiry.
    pub lifetime_valid: Duration,
    /// Reverse-entry wait before replying at the destination.
    pub rreq_wait: Duration,
    /// Base ring-TTL bump period.
    pub rreq_ring_search_wait_interval: Duration,
    /// Ring search abandon threshold (inclusive).
    pub rreq_ring_search_max_ttl: u8,
    /// Neighbour liveness lifetime.
    pub hello_lifetime: Duration,
    /// RSSI metric normaliser.
    pub rssi_min: i32,
    /// Pending-reply list poll interval during ring search.
    pub ring_search_poll_interval: Duration,
    /// Initial TTL for a freshly started ring search. TTL=1 is reserved by
    /// the host mesh spec, so the first ring always starts at 2.
    pub ring_search_initial_ttl: u8,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            number_of_entries: 20,
            allocation_interval: Duration::from_millis(100),
            lifetime_valid: Duration::from_secs(120),
            rreq_wait: Duration::from_secs(1),
            rreq_ring_search_wait_interval: Duration::from_secs(10),
            rreq_ring_search_max_ttl: 10,
            hello_lifetime: Duration::from_secs(20),
            rssi_min: -90,
            ring_search_poll_interval: Duration::from_millis(50),
            ring_search_initial_ttl: 2,
        }
    }
}

impl RoutingConfig {
    /// Parses a config, falling back to [`Default`] for any field the TOML
    /// document omits.
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents).map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let parsed = RoutingConfig::from_toml("number_of_entries = 64\n").unwrap();
        assert_eq!(parsed.number_of_entries, 64);
        assert_eq!(parsed.hello_lifetime, RoutingConfig::default().hello_lifetime);
    }
}

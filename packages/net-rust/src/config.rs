//! Network configuration types.

use std::time::Duration;

/// Configuration for the transport, download cache and reachability probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetConfig {
    /// `User-Agent` sent with every request.
    pub user_agent: String,
    /// Maximum time a single request may take.
    pub request_timeout: Duration,
    /// `Accept` header sent with resource requests.
    pub resource_accept: String,
    /// Estimated number of completed resources kept in memory.
    pub cache_capacity: usize,
    /// Reachability probing settings.
    pub reachability: ReachabilityConfig,
    /// Maximum number of concurrently executing fetches. `None` means
    /// unbounded.
    pub max_concurrent_fetches: Option<usize>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("conductor/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout: Duration::from_secs(30),
            resource_accept: "image/*".to_string(),
            cache_capacity: 256,
            reachability: ReachabilityConfig::default(),
            max_concurrent_fetches: None,
        }
    }
}

/// Settings for the DNS-based reachability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReachabilityConfig {
    /// Port used when resolving a host that has no explicit port.
    pub default_port: u16,
    /// Upper bound on a single probe.
    pub timeout: Duration,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            default_port: 443,
            timeout: Duration::from_secs(3),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn net_config_defaults() {
        let config = NetConfig::default();
        assert!(config.user_agent.starts_with("conductor/"));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.resource_accept, "image/*");
        assert_eq!(config.cache_capacity, 256);
        assert_eq!(config.max_concurrent_fetches, None);
    }

    #[test]
    fn reachability_config_defaults() {
        let config = ReachabilityConfig::default();
        assert_eq!(config.default_port, 443);
        assert_eq!(config.timeout, Duration::from_secs(3));
    }
}

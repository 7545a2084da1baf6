//! Conductor Net: network operations built on `conductor-core`.
//!
//! Provides a reachability condition backed by a per-host handle cache, a
//! network activity observer, a deduplicating download cache and a resource
//! loader tying them to an HTTP transport.

pub mod activity;
pub mod config;
pub mod download_cache;
pub mod loader;
pub mod reachability;
pub mod transport;

pub use activity::{ActivityObserver, NetworkActivity};
pub use config::{NetConfig, ReachabilityConfig};
pub use download_cache::{CachePolicy, DownloadCache, Fetch, FetchError, FetchId};
pub use loader::ResourceLoader;
pub use reachability::{
    DnsProbe, ReachabilityCache, ReachabilityCondition, ReachabilityHandle, ReachabilityProbe,
};
pub use transport::{ReqwestTransport, ResourceRequest, Transport};

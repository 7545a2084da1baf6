//! Host reachability.
//!
//! [`ReachabilityCache`] keeps one lazily created handle per host and answers
//! "is this host reachable" queries. Handle creation and inspection happen on
//! a private [`SerialWorker`], so the host map needs no lock and a host never
//! gets more than one handle. [`ReachabilityCondition`] gates network
//! operations on the answer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conductor_core::{
    Condition, ConditionFailure, ConditionResult, Operation, SerialRunnable, SerialWorker,
};
use reqwest::Url;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::ReachabilityConfig;

// ---------------------------------------------------------------------------
// Probe traits
// ---------------------------------------------------------------------------

/// A retained per-host reachability handle.
#[async_trait]
pub trait ReachabilityHandle: Send {
    /// Inspects the current reachability of the handle's host.
    async fn is_reachable(&mut self) -> bool;
}

/// Creates reachability handles.
pub trait ReachabilityProbe: Send + Sync + 'static {
    /// Creates a handle for `host`. `None` means the host cannot be probed,
    /// which reads as unreachable.
    fn create_handle(&self, host: &str, port: u16) -> Option<Box<dyn ReachabilityHandle>>;
}

/// Probe that treats a host as reachable when it resolves through DNS.
#[derive(Debug, Clone)]
pub struct DnsProbe {
    timeout: Duration,
}

impl DnsProbe {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ReachabilityProbe for DnsProbe {
    fn create_handle(&self, host: &str, port: u16) -> Option<Box<dyn ReachabilityHandle>> {
        if host.is_empty() {
            return None;
        }
        Some(Box::new(DnsHandle {
            host: host.to_string(),
            port,
            timeout: self.timeout,
        }))
    }
}

struct DnsHandle {
    host: String,
    port: u16,
    timeout: Duration,
}

#[async_trait]
impl ReachabilityHandle for DnsHandle {
    async fn is_reachable(&mut self) -> bool {
        let lookup = tokio::net::lookup_host((self.host.as_str(), self.port));
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(mut addrs)) => addrs.next().is_some(),
            Ok(Err(err)) => {
                debug!(host = %self.host, error = %err, "host did not resolve");
                false
            }
            Err(_) => {
                debug!(host = %self.host, "reachability probe timed out");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ReachabilityCache
// ---------------------------------------------------------------------------

enum Request {
    Check {
        host: Option<String>,
        port: u16,
        reply: oneshot::Sender<bool>,
    },
    HandleCount(oneshot::Sender<usize>),
}

/// State owned by the sequential context.
struct Hosts {
    probe: Arc<dyn ReachabilityProbe>,
    handles: HashMap<String, Box<dyn ReachabilityHandle>>,
}

#[async_trait]
impl SerialRunnable for Hosts {
    type Task = Request;

    async fn run(&mut self, task: Request) {
        match task {
            Request::Check { host, port, reply } => {
                let reachable = match host {
                    Some(host) => self.check(host, port).await,
                    None => false,
                };
                let _ = reply.send(reachable);
            }
            Request::HandleCount(reply) => {
                let _ = reply.send(self.handles.len());
            }
        }
    }

    async fn shutdown(&mut self) {
        debug!(hosts = self.handles.len(), "reachability cache stopped");
        self.handles.clear();
    }
}

impl Hosts {
    async fn check(&mut self, host: String, port: u16) -> bool {
        if !self.handles.contains_key(&host) {
            let Some(handle) = self.probe.create_handle(&host, port) else {
                return false;
            };
            debug!(host = %host, "reachability handle created");
            self.handles.insert(host.clone(), handle);
        }
        match self.handles.get_mut(&host) {
            Some(handle) => handle.is_reachable().await,
            None => false,
        }
    }
}

/// Per-host reachability answers with at most one retained handle per host.
pub struct ReachabilityCache {
    worker: SerialWorker<Hosts>,
    default_port: u16,
}

impl ReachabilityCache {
    /// Starts the cache's sequential context.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn new(probe: Arc<dyn ReachabilityProbe>, default_port: u16) -> Self {
        Self {
            worker: SerialWorker::start(Hosts {
                probe,
                handles: HashMap::new(),
            }),
            default_port,
        }
    }

    /// Cache backed by [`DnsProbe`].
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn from_config(config: &ReachabilityConfig) -> Self {
        Self::new(Arc::new(DnsProbe::new(config.timeout)), config.default_port)
    }

    /// Whether the host of `url` is currently reachable. URLs without a host
    /// are unreachable.
    pub async fn request_reachability(&self, url: &Url) -> bool {
        let host = url.host_str().map(str::to_string);
        let port = url.port_or_known_default().unwrap_or(self.default_port);
        match self
            .worker
            .call(|reply| Request::Check { host, port, reply })
            .await
        {
            Ok(reachable) => reachable,
            Err(err) => {
                warn!(url = %url, error = %err, "reachability cache unavailable");
                false
            }
        }
    }

    /// Number of hosts with a retained handle.
    pub async fn handle_count(&self) -> usize {
        self.worker.call(Request::HandleCount).await.unwrap_or(0)
    }
}

impl std::fmt::Debug for ReachabilityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReachabilityCache")
            .field("default_port", &self.default_port)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ReachabilityCondition
// ---------------------------------------------------------------------------

/// Condition satisfied when the host of `url` is reachable.
#[derive(Debug, Clone)]
pub struct ReachabilityCondition {
    cache: Arc<ReachabilityCache>,
    url: Url,
}

impl ReachabilityCondition {
    pub const NAME: &'static str = "Reachability";
    pub const HOST_KEY: &'static str = "host";

    #[must_use]
    pub fn new(cache: Arc<ReachabilityCache>, url: Url) -> Self {
        Self { cache, url }
    }
}

#[async_trait]
impl Condition for ReachabilityCondition {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn evaluate(&self, _operation: &Operation) -> ConditionResult {
        if self.cache.request_reachability(&self.url).await {
            Ok(())
        } else {
            Err(ConditionFailure::new(Self::NAME)
                .with_detail(Self::HOST_KEY, self.url.host_str().unwrap_or_default())
                .with_detail("url", self.url.as_str()))
        }
    }
}

//! Loading remote resources through the download cache.
//!
//! Every producer operation the loader starts is gated on the reachability of
//! the resource's host and reports to the shared [`NetworkActivity`] counter.

use std::sync::Arc;

use bytes::Bytes;
use conductor_core::{ExclusivityRegistry, OperationQueue, QueueConfig};
use reqwest::Url;

use crate::activity::NetworkActivity;
use crate::config::NetConfig;
use crate::download_cache::{CachePolicy, DownloadCache, Fetch, FetchId};
use crate::reachability::{ReachabilityCache, ReachabilityCondition};
use crate::transport::{ReqwestTransport, ResourceRequest, Transport};

/// Loads resources by URL, deduplicating concurrent loads and keeping
/// completed bodies in memory.
#[derive(Clone)]
pub struct ResourceLoader {
    accept: Arc<str>,
    transport: Arc<dyn Transport>,
    cache: DownloadCache<Bytes>,
    reachability: Arc<ReachabilityCache>,
    activity: NetworkActivity,
}

impl ResourceLoader {
    /// Assembles a loader from explicit collaborators. Producers run on
    /// `queue`.
    #[must_use]
    pub fn new(
        config: &NetConfig,
        transport: Arc<dyn Transport>,
        reachability: Arc<ReachabilityCache>,
        queue: OperationQueue,
    ) -> Self {
        Self {
            accept: Arc::from(config.resource_accept.as_str()),
            transport,
            cache: DownloadCache::new(config.cache_capacity, queue),
            reachability,
            activity: NetworkActivity::new(),
        }
    }

    /// Loader backed by `reqwest`, DNS reachability probes and a dedicated
    /// queue sharing `exclusivity`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn from_config(
        config: &NetConfig,
        exclusivity: Arc<ExclusivityRegistry>,
    ) -> anyhow::Result<Self> {
        let transport = Arc::new(ReqwestTransport::from_config(config)?);
        let reachability = Arc::new(ReachabilityCache::from_config(&config.reachability));
        let mut queue_config = QueueConfig::named("conductor.resources");
        queue_config.max_concurrent_operations = config.max_concurrent_fetches;
        let queue = OperationQueue::new(queue_config, exclusivity);
        Ok(Self::new(config, transport, reachability, queue))
    }

    /// Cache key of a resource: its absolute URL.
    #[must_use]
    pub fn cache_key(url: &Url) -> String {
        url.as_str().to_string()
    }

    /// Completed body for `url`, if cached.
    #[must_use]
    pub fn cached(&self, url: &Url) -> Option<Bytes> {
        self.cache.get(&Self::cache_key(url))
    }

    /// Loads `url`. Concurrent loads of the same URL share one request.
    pub fn load(&self, url: Url, policy: CachePolicy) -> Fetch<Bytes> {
        let key = Self::cache_key(&url);
        let transport = Arc::clone(&self.transport);
        let accept = Arc::clone(&self.accept);
        let condition = ReachabilityCondition::new(Arc::clone(&self.reachability), url.clone());
        let observer = self.activity.observer();

        self.cache.fetch_with(
            key,
            policy,
            move || async move {
                let request = ResourceRequest::new(url).accept(&accept)?;
                transport.get(request).await
            },
            move |builder| builder.condition(condition).observer(observer),
        )
    }

    /// Detaches one caller from its load. See [`DownloadCache::cancel`].
    pub fn cancel(&self, id: FetchId) -> bool {
        self.cache.cancel(id)
    }

    #[must_use]
    pub fn activity(&self) -> &NetworkActivity {
        &self.activity
    }

    #[must_use]
    pub fn reachability(&self) -> &Arc<ReachabilityCache> {
        &self.reachability
    }
}

impl std::fmt::Debug for ResourceLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLoader")
            .field("accept", &self.accept)
            .field("cache", &self.cache)
            .field("activity", &self.activity)
            .finish_non_exhaustive()
    }
}

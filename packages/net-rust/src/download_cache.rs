//! Keyed download cache with in-flight deduplication.
//!
//! A key is either completed (its value sits in a bounded in-memory cache),
//! in flight (one producer operation is running and any number of callers
//! are attached to it), or unknown. Concurrent fetches of the same key share
//! a single producer.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use conductor_core::{
    Operation, OperationBuilder, OperationError, OperationQueue, SuspendedTask, TaskAdapter,
};
use parking_lot::Mutex;
use quick_cache::sync::Cache;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Whether a fetch may be answered from completed entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CachePolicy {
    /// Answer from the completed cache when possible.
    #[default]
    UseCache,
    /// Skip the completed cache. In-flight fetches are still shared.
    ReloadIgnoringCache,
}

/// Identifies one caller's attachment to a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchId(u64);

impl std::fmt::Display for FetchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fetch-{}", self.0)
    }
}

/// Why a fetch produced no value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// The caller detached, or the producer was cancelled.
    #[error("fetch cancelled")]
    Cancelled,
    /// The producer operation finished with errors.
    #[error("fetch failed: {0}")]
    Failed(OperationError),
}

impl FetchError {
    fn from_errors(mut errors: Vec<OperationError>) -> Self {
        if errors.iter().any(OperationError::is_cancelled) {
            return Self::Cancelled;
        }
        match errors.len() {
            0 => Self::Failed(OperationError::execution(anyhow::anyhow!(
                "producer finished without a value"
            ))),
            1 => Self::Failed(errors.remove(0)),
            _ => Self::Failed(OperationError::Group(errors)),
        }
    }
}

type Reply<V> = oneshot::Sender<Result<V, FetchError>>;

struct InFlight<V> {
    /// Fetch that started the producer; tells producers of the same key apart.
    origin: FetchId,
    operation: Operation,
    waiters: HashMap<FetchId, Reply<V>>,
}

struct Pending<V> {
    by_key: HashMap<String, InFlight<V>>,
    owners: HashMap<FetchId, String>,
}

struct CacheInner<V> {
    completed: Cache<String, V>,
    pending: Mutex<Pending<V>>,
    queue: OperationQueue,
    next_id: AtomicU64,
}

/// Keyed cache of produced values, deduplicating concurrent production.
pub struct DownloadCache<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for DownloadCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> DownloadCache<V> {
    /// Creates a cache keeping about `capacity` completed values. Producers
    /// run on `queue`.
    #[must_use]
    pub fn new(capacity: usize, queue: OperationQueue) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                completed: Cache::new(capacity.max(1)),
                pending: Mutex::new(Pending {
                    by_key: HashMap::new(),
                    owners: HashMap::new(),
                }),
                queue,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Completed value for `key`, if any. Never starts a fetch.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.completed.get(key)
    }

    /// Whether a producer for `key` is currently running.
    #[must_use]
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inner.pending.lock().by_key.contains_key(key)
    }

    /// Number of completed values held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.completed.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.completed.is_empty()
    }

    /// Fetches `key`, running `producer` only if no value is cached (per
    /// `policy`) and no other fetch for `key` is in flight.
    pub fn fetch<F, Fut>(&self, key: impl Into<String>, policy: CachePolicy, producer: F) -> Fetch<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        self.fetch_with(key, policy, producer, |builder| builder)
    }

    /// Like [`fetch`](Self::fetch), letting the caller attach conditions and
    /// observers to the producer operation before it is enqueued.
    pub fn fetch_with<F, Fut>(
        &self,
        key: impl Into<String>,
        policy: CachePolicy,
        producer: F,
        decorate: impl FnOnce(OperationBuilder) -> OperationBuilder,
    ) -> Fetch<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let key = key.into();
        let id = FetchId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (reply, rx) = oneshot::channel();
        let fetch = Fetch {
            id,
            key: key.clone(),
            rx,
        };

        if policy == CachePolicy::UseCache {
            if let Some(value) = self.inner.completed.get(&key) {
                debug!(key = %key, "download cache hit");
                let _ = reply.send(Ok(value));
                return fetch;
            }
        }

        let reply = match self.attach(&key, id, reply) {
            Ok(()) => return fetch,
            Err(reply) => reply,
        };

        let task = SuspendedTask::new(async move { producer().await });
        let builder = match TaskAdapter::builder(format!("fetch {key}"), Arc::clone(&task)) {
            Ok(builder) => builder,
            Err(err) => {
                let _ = reply.send(Err(FetchError::Failed(OperationError::execution(err))));
                return fetch;
            }
        };

        let weak: Weak<CacheInner<V>> = Arc::downgrade(&self.inner);
        let completion_key = key.clone();
        let operation = decorate(builder)
            .completion(move |errors| {
                if let Some(inner) = weak.upgrade() {
                    inner.complete(&completion_key, id, &task, errors);
                }
            })
            .build();

        {
            let mut pending = self.inner.pending.lock();
            if let Some(in_flight) = pending.by_key.get_mut(&key) {
                // Lost the race to another starter; our operation is never enqueued.
                in_flight.waiters.insert(id, reply);
                pending.owners.insert(id, key);
                return fetch;
            }
            if policy == CachePolicy::UseCache {
                // A producer may have completed since the first lookup.
                if let Some(value) = self.inner.completed.get(&key) {
                    drop(pending);
                    let _ = reply.send(Ok(value));
                    return fetch;
                }
            }
            let mut waiters = HashMap::new();
            waiters.insert(id, reply);
            pending.by_key.insert(
                key.clone(),
                InFlight {
                    origin: id,
                    operation: operation.clone(),
                    waiters,
                },
            );
            pending.owners.insert(id, key.clone());
        }

        debug!(key = %key, fetch = %id, operation = %operation.id(), "starting producer");
        if let Err(err) = self.inner.queue.add(operation.clone()) {
            warn!(key = %key, error = %err, "producer could not be enqueued");
            operation.finish(vec![OperationError::execution(err)]);
        }
        fetch
    }

    /// Attaches to an in-flight fetch of `key`, handing `reply` back if there
    /// is none.
    fn attach(&self, key: &str, id: FetchId, reply: Reply<V>) -> Result<(), Reply<V>> {
        let mut pending = self.inner.pending.lock();
        match pending.by_key.get_mut(key) {
            Some(in_flight) => {
                debug!(key = %key, fetch = %id, "attached to in-flight fetch");
                in_flight.waiters.insert(id, reply);
                pending.owners.insert(id, key.to_string());
                Ok(())
            }
            None => Err(reply),
        }
    }

    /// Detaches the caller identified by `id`, who receives
    /// [`FetchError::Cancelled`]. The producer itself is cancelled once no
    /// caller remains attached. Returns `false` for an unknown or already
    /// completed fetch.
    pub fn cancel(&self, id: FetchId) -> bool {
        let (reply, orphaned) = {
            let mut pending = self.inner.pending.lock();
            let Some(key) = pending.owners.remove(&id) else {
                return false;
            };
            let Some(in_flight) = pending.by_key.get_mut(&key) else {
                return false;
            };
            let reply = in_flight.waiters.remove(&id);
            let orphaned = if in_flight.waiters.is_empty() {
                pending.by_key.remove(&key).map(|in_flight| in_flight.operation)
            } else {
                None
            };
            (reply, orphaned)
        };

        if let Some(reply) = reply {
            let _ = reply.send(Err(FetchError::Cancelled));
        }
        if let Some(operation) = orphaned {
            debug!(fetch = %id, operation = %operation.id(), "last caller detached, cancelling producer");
            operation.cancel();
        }
        true
    }
}

impl<V: Clone + Send + Sync + 'static> CacheInner<V> {
    fn complete(&self, key: &str, origin: FetchId, task: &SuspendedTask<V>, errors: &[OperationError]) {
        let outcome = match task.take_output() {
            Some(Ok(value)) if errors.is_empty() => Ok(value),
            _ => Err(FetchError::from_errors(errors.to_vec())),
        };
        // Cached before the in-flight entry goes away, so no fetch in between
        // starts a second producer.
        if let Ok(value) = &outcome {
            self.completed.insert(key.to_string(), value.clone());
        }

        let waiters = {
            let mut pending = self.pending.lock();
            let current = pending
                .by_key
                .get(key)
                .is_some_and(|in_flight| in_flight.origin == origin);
            let waiters = if current {
                pending
                    .by_key
                    .remove(key)
                    .map(|in_flight| in_flight.waiters)
                    .unwrap_or_default()
            } else {
                HashMap::new()
            };
            for id in waiters.keys() {
                pending.owners.remove(id);
            }
            waiters
        };
        debug!(key = %key, ok = outcome.is_ok(), waiters = waiters.len(), "fetch complete");

        for (_, reply) in waiters {
            let _ = reply.send(outcome.clone());
        }
    }
}

impl<V> std::fmt::Debug for DownloadCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCache")
            .field("in_flight", &self.inner.pending.lock().by_key.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

/// Pending result of [`DownloadCache::fetch`].
#[derive(Debug)]
pub struct Fetch<V> {
    id: FetchId,
    key: String,
    rx: oneshot::Receiver<Result<V, FetchError>>,
}

impl<V> Fetch<V> {
    /// Identifier to pass to [`DownloadCache::cancel`].
    #[must_use]
    pub fn id(&self) -> FetchId {
        self.id
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<V> Future for Fetch<V> {
    type Output = Result<V, FetchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(FetchError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use conductor_core::{ExclusivityRegistry, QueueConfig};
    use futures_util::future::BoxFuture;

    use super::*;

    fn cache() -> DownloadCache<String> {
        let queue = OperationQueue::new(
            QueueConfig::named("downloads"),
            Arc::new(ExclusivityRegistry::new()),
        );
        DownloadCache::new(16, queue)
    }

    fn slow_producer(
        calls: &Arc<AtomicU32>,
        value: &'static str,
    ) -> impl FnOnce() -> BoxFuture<'static, anyhow::Result<String>> + Send + 'static {
        let calls = calls.clone();
        move || -> BoxFuture<'static, anyhow::Result<String>> {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(value.to_string())
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_fetches_share_one_producer() {
        let cache = cache();
        let calls = Arc::new(AtomicU32::new(0));

        let first = cache.fetch("k", CachePolicy::UseCache, slow_producer(&calls, "v"));
        let second = cache.fetch("k", CachePolicy::UseCache, slow_producer(&calls, "other"));
        assert_ne!(first.id(), second.id());
        assert!(cache.is_in_flight("k"));

        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap(), "v");
        assert_eq!(b.unwrap(), "v");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        assert!(!cache.is_in_flight("k"));
    }

    #[tokio::test]
    async fn completed_value_is_served_without_producer() {
        let cache = cache();
        let calls = Arc::new(AtomicU32::new(0));
        cache
            .fetch("k", CachePolicy::UseCache, slow_producer(&calls, "v"))
            .await
            .unwrap();

        let cached = cache
            .fetch("k", CachePolicy::UseCache, slow_producer(&calls, "new"))
            .await
            .unwrap();
        assert_eq!(cached, "v");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn reload_bypasses_completed_value() {
        let cache = cache();
        let calls = Arc::new(AtomicU32::new(0));
        cache
            .fetch("k", CachePolicy::UseCache, slow_producer(&calls, "v1"))
            .await
            .unwrap();

        let reloaded = cache
            .fetch("k", CachePolicy::ReloadIgnoringCache, slow_producer(&calls, "v2"))
            .await
            .unwrap();
        assert_eq!(reloaded, "v2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.get("k").as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn reload_still_joins_in_flight_fetch() {
        let cache = cache();
        let calls = Arc::new(AtomicU32::new(0));
        let first = cache.fetch("k", CachePolicy::UseCache, slow_producer(&calls, "v"));
        let second = cache.fetch("k", CachePolicy::ReloadIgnoringCache, slow_producer(&calls, "x"));

        assert_eq!(second.await.unwrap(), "v");
        assert_eq!(first.await.unwrap(), "v");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelling_one_caller_keeps_producer_for_others() {
        let cache = cache();
        let calls = Arc::new(AtomicU32::new(0));
        let first = cache.fetch("k", CachePolicy::UseCache, slow_producer(&calls, "v"));
        let second = cache.fetch("k", CachePolicy::UseCache, slow_producer(&calls, "v"));

        assert!(cache.cancel(first.id()));
        assert!(matches!(first.await, Err(FetchError::Cancelled)));
        assert_eq!(second.await.unwrap(), "v");
        assert_eq!(cache.get("k").as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn cancelling_last_caller_cancels_producer() {
        let cache = cache();
        let calls = Arc::new(AtomicU32::new(0));
        let fetch = cache.fetch("k", CachePolicy::UseCache, slow_producer(&calls, "v"));
        let id = fetch.id();

        assert!(cache.cancel(id));
        assert!(matches!(fetch.await, Err(FetchError::Cancelled)));
        assert!(!cache.is_in_flight("k"));
        assert!(!cache.cancel(id));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("k").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn repeated_fetches_around_completion_run_one_producer() {
        for round in 0..20 {
            let cache = cache();
            let calls = Arc::new(AtomicU32::new(0));
            let key = format!("k{round}");

            let mut callers = Vec::new();
            for _ in 0..4 {
                let cache = cache.clone();
                let calls = calls.clone();
                let key = key.clone();
                callers.push(tokio::spawn(async move {
                    for _ in 0..25 {
                        let calls = calls.clone();
                        let value = cache
                            .fetch(key.clone(), CachePolicy::UseCache, move || async move {
                                calls.fetch_add(1, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(2)).await;
                                Ok("v".to_string())
                            })
                            .await
                            .unwrap();
                        assert_eq!(value, "v");
                        tokio::task::yield_now().await;
                    }
                }));
            }
            for caller in callers {
                caller.await.unwrap();
            }
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn failed_producer_is_not_cached() {
        let cache = cache();
        let result = cache
            .fetch("k", CachePolicy::UseCache, || async {
                Err::<String, _>(anyhow::anyhow!("503 from origin"))
            })
            .await;

        match result {
            Err(FetchError::Failed(err)) => {
                assert_eq!(err.to_string(), "execution failed: 503 from origin");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(cache.get("k").is_none());
        assert!(!cache.is_in_flight("k"));
    }

    #[test]
    fn cancelled_errors_map_to_cancelled() {
        let err = FetchError::from_errors(vec![OperationError::Cancelled]);
        assert!(matches!(err, FetchError::Cancelled));
        let err = FetchError::from_errors(Vec::new());
        assert!(matches!(err, FetchError::Failed(_)));
    }
}

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use moka::ops::compute::Op;

use super::{CacheEntry, CacheError};
use crate::pool::WorkerPool;
use crate::utils::CallOnDrop;

type LoadChannel<V> = Shared<oneshot::Receiver<CacheEntry<V>>>;

/// A load in flight, shared by everyone requesting the key while it runs.
struct PendingLoad<V> {
    /// Identifies the load, so that only its own completion removes it from the map.
    generation: u64,
    channel: LoadChannel<V>,
}

/// A loaded value, tagged with the load that produced it.
#[derive(Clone)]
struct Loaded<V> {
    generation: u64,
    value: V,
}

type InMemoryCache<K, V> = moka::sync::Cache<K, Loaded<V>>;

/// Loads values at most once concurrently per key, and keeps the loaded values in memory.
///
/// Concurrent requests for the same key are deduplicated: the first request claims the key and
/// spawns the load on a [`WorkerPool`], later requests wait for that load. All of them receive
/// the same value, or the same error. Successfully loaded values are kept in memory and returned
/// without suspending until they are replaced by a later load.
pub struct SingleFlight<K, V> {
    /// The latest successfully loaded value per key.
    values: InMemoryCache<K, V>,
    /// Loads currently in flight.
    pending: Arc<DashMap<K, PendingLoad<V>>>,
    next_generation: AtomicU64,
}

impl<K, V> SingleFlight<K, V>
where
    K: Hash + Eq + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates an empty cache.
    ///
    /// With a `capacity`, the least recently used values are evicted beyond that number of
    /// entries. Without one, values are kept for the lifetime of the cache.
    pub fn new(capacity: Option<u64>) -> Self {
        let mut builder = InMemoryCache::builder();
        if let Some(capacity) = capacity {
            builder = builder.max_capacity(capacity);
        }
        SingleFlight {
            values: builder.build(),
            pending: Default::default(),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Returns the value for `key`, loading it with `load` on the `pool` if necessary.
    ///
    /// - While a load for `key` is in flight, waits for it, even if a value is in memory.
    /// - Otherwise returns the in-memory value without suspending.
    /// - Otherwise runs `load` and waits for it.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly spawn the load
    /// on the pool, even if you don't explicitly `await` its result.
    pub fn get_with<F, Fut>(
        &self,
        pool: &WorkerPool,
        key: K,
        load: F,
    ) -> BoxFuture<'static, CacheEntry<V>>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = CacheEntry<V>> + Send + 'static,
    {
        metric!(counter("caches.access") += 1);

        // Bind first so the map guard is released before anything else touches the map.
        let in_flight = self.pending.get(&key).map(|load| load.channel.clone());
        if let Some(channel) = in_flight {
            metric!(counter("caches.channel.hit") += 1);
            return Self::wait(channel);
        }

        if let Some(loaded) = self.values.get(&key) {
            metric!(counter("caches.memory.hit") += 1);
            return future::ready(Ok(loaded.value)).boxed();
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();

        match self.pending.entry(key.clone()) {
            Entry::Occupied(entry) => {
                // A concurrent request claimed the key first.
                metric!(counter("caches.channel.hit") += 1);
                return Self::wait(entry.get().channel.clone());
            }
            Entry::Vacant(entry) => {
                // The value is inserted before the pending load is removed, so a load that
                // completed since the checks above is visible here.
                if let Some(loaded) = self.values.get(&key) {
                    metric!(counter("caches.memory.hit") += 1);
                    return future::ready(Ok(loaded.value)).boxed();
                }
                metric!(counter("caches.channel.miss") += 1);
                entry.insert(PendingLoad {
                    generation,
                    channel: channel.clone(),
                });
            }
        }

        // Spawning happens outside of the map guard, as a rejected task removes its own entry
        // when dropped.
        let computation = self.computation(key.clone(), generation, load(key), sender);
        if let Err(err) = pool.spawn_handle(computation) {
            return future::ready(Err(err)).boxed();
        }
        Self::wait(channel)
    }

    /// Loads the value for `key` with `load` on the `pool`, regardless of the in-memory value.
    ///
    /// This load replaces any load of `key` in flight as the one later calls to
    /// [`get_with`](Self::get_with) wait for. Callers already waiting on an older load still
    /// receive its outcome, but its value never replaces the one stored by a newer load.
    pub fn refresh<F, Fut>(
        &self,
        pool: &WorkerPool,
        key: K,
        load: F,
    ) -> BoxFuture<'static, CacheEntry<V>>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = CacheEntry<V>> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();

        self.pending.insert(
            key.clone(),
            PendingLoad {
                generation,
                channel: channel.clone(),
            },
        );

        let computation = self.computation(key.clone(), generation, load(key), sender);
        if let Err(err) = pool.spawn_handle(computation) {
            return future::ready(Err(err)).boxed();
        }
        Self::wait(channel)
    }

    /// Returns the in-memory value for `key`, without loading or waiting.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.values.get(key).map(|loaded| loaded.value)
    }

    /// Whether a load for `key` is currently in flight.
    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    /// Wraps `load` so that it stores its value, clears its pending entry and then publishes its
    /// outcome, in that order.
    ///
    /// The value is only stored if no later load of the same key has stored one already.
    fn computation<Fut>(
        &self,
        key: K,
        generation: u64,
        load: Fut,
        sender: oneshot::Sender<CacheEntry<V>>,
    ) -> impl Future<Output = ()> + Send + 'static + use<Fut, K, V>
    where
        Fut: Future<Output = CacheEntry<V>> + Send + 'static,
    {
        let values = self.values.clone();
        let pending = Arc::clone(&self.pending);
        let token_key = key.clone();
        let remove_pending_token = CallOnDrop::new(move || {
            pending.remove_if(&token_key, |_, load| load.generation == generation);
        });

        // Tuple fields drop in order, so an abandoned load also clears its entry before its
        // waiters are woken up.
        let publish = (remove_pending_token, sender);

        async move {
            let result = load.await;
            match result {
                Ok(ref value) => {
                    values
                        .entry(key)
                        .and_compute_with(|stored| match stored {
                            Some(stored) if stored.value().generation > generation => Op::Nop,
                            _ => Op::Put(Loaded {
                                generation,
                                value: value.clone(),
                            }),
                        });
                }
                Err(ref err) => tracing::debug!(?key, %err, "Load failed"),
            }
            // Drop the token first to evict from the map. This ensures that callers either
            // get a channel that will receive data, or they create a new channel.
            let (remove_pending_token, sender) = publish;
            drop(remove_pending_token);
            sender.send(result).ok();
        }
    }

    fn wait(channel: LoadChannel<V>) -> BoxFuture<'static, CacheEntry<V>> {
        channel
            .map(|result| {
                result.unwrap_or_else(|_canceled| {
                    tracing::error!("Load channel dropped");
                    Err(CacheError::InternalError)
                })
            })
            .boxed()
    }
}

impl<K, V> std::fmt::Debug for SingleFlight<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in-memory items", &self.values.entry_count())
            .field("pending loads", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::config::WorkersConfig;

    fn pool() -> WorkerPool {
        WorkerPool::new(&WorkersConfig {
            threads: 4,
            idle_timeout: None,
        })
        .unwrap()
    }

    /// A loader that counts its invocations and takes `delay` to finish.
    fn delayed_loader(
        calls: &Arc<AtomicUsize>,
        delay: Duration,
        result: CacheEntry<u32>,
    ) -> impl FnOnce(&'static str) -> BoxFuture<'static, CacheEntry<u32>> {
        let calls = Arc::clone(calls);
        move |_key| {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                result
            }
            .boxed()
        }
    }

    fn counting_loader(
        calls: &Arc<AtomicUsize>,
        result: CacheEntry<u32>,
    ) -> impl FnOnce(&'static str) -> BoxFuture<'static, CacheEntry<u32>> {
        delayed_loader(calls, Duration::from_millis(50), result)
    }

    #[tokio::test]
    async fn test_concurrent_gets_load_once() {
        let pool = pool();
        let cache = SingleFlight::new(None);
        let calls = Arc::new(AtomicUsize::new(0));

        let requests: Vec<_> = (0..10)
            .map(|_| cache.get_with(&pool, "key", counting_loader(&calls, Ok(7))))
            .collect();
        assert!(cache.is_pending(&"key"));

        let results = futures::future::join_all(requests).await;
        assert!(results.iter().all(|result| *result == Ok(7)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.is_pending(&"key"));

        // Served from memory afterwards.
        let value = cache
            .get_with(&pool, "key", counting_loader(&calls, Ok(8)))
            .await;
        assert_eq!(value, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.peek(&"key"), Some(7));
    }

    #[tokio::test]
    async fn test_failure_reaches_all_waiters() {
        let pool = pool();
        let cache = SingleFlight::new(None);
        let calls = Arc::new(AtomicUsize::new(0));

        let requests: Vec<_> = (0..5)
            .map(|_| {
                let load = counting_loader(&calls, Err(CacheError::NotFound));
                cache.get_with(&pool, "key", load)
            })
            .collect();
        let results = futures::future::join_all(requests).await;
        assert!(results.iter().all(|result| *result == Err(CacheError::NotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Nothing is cached and nothing is pending, the next request loads again.
        assert!(!cache.is_pending(&"key"));
        assert_eq!(cache.peek(&"key"), None);
        let value = cache
            .get_with(&pool, "key", counting_loader(&calls, Ok(1)))
            .await;
        assert_eq!(value, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_is_awaited_by_gets() {
        let pool = pool();
        let cache = SingleFlight::new(None);
        let calls = Arc::new(AtomicUsize::new(0));

        let first = cache
            .get_with(&pool, "key", counting_loader(&calls, Ok(1)))
            .await;
        assert_eq!(first, Ok(1));

        let refresh = cache.refresh(&pool, "key", counting_loader(&calls, Ok(2)));
        // Waits for the refresh instead of returning the stale value.
        let get = cache.get_with(&pool, "key", counting_loader(&calls, Ok(3)));

        assert_eq!(refresh.await, Ok(2));
        assert_eq!(get.await, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.peek(&"key"), Some(2));
    }

    #[tokio::test]
    async fn test_refresh_during_load_takes_over() {
        let pool = pool();
        let cache = SingleFlight::new(None);
        let calls = Arc::new(AtomicUsize::new(0));

        let early = cache.get_with(&pool, "key", counting_loader(&calls, Ok(1)));
        let refresh = cache.refresh(&pool, "key", counting_loader(&calls, Ok(2)));
        // Requests after the refresh wait for it, not for the earlier load.
        let late = cache.get_with(&pool, "key", counting_loader(&calls, Ok(3)));

        assert_eq!(early.await, Ok(1));
        assert_eq!(refresh.await, Ok(2));
        assert_eq!(late.await, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!cache.is_pending(&"key"));
        assert_eq!(cache.peek(&"key"), Some(2));
    }

    #[tokio::test]
    async fn test_stale_load_does_not_overwrite_refresh() {
        let pool = pool();
        let cache = SingleFlight::new(None);
        let calls = Arc::new(AtomicUsize::new(0));

        let slow = cache.get_with(
            &pool,
            "key",
            delayed_loader(&calls, Duration::from_millis(300), Ok(1)),
        );
        let refresh = cache.refresh(
            &pool,
            "key",
            delayed_loader(&calls, Duration::from_millis(10), Ok(2)),
        );

        assert_eq!(refresh.await, Ok(2));
        assert_eq!(cache.get_with(&pool, "key", counting_loader(&calls, Ok(3))).await, Ok(2));

        // The earlier load still reaches its own waiters, but keeps the newer value in memory.
        assert_eq!(slow.await, Ok(1));
        assert_eq!(cache.peek(&"key"), Some(2));
        assert_eq!(cache.get_with(&pool, "key", counting_loader(&calls, Ok(3))).await, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_debug() {
        let pool = pool();
        let cache = SingleFlight::new(None);
        let calls = Arc::new(AtomicUsize::new(0));

        let pending = cache.get_with(&pool, "key", counting_loader(&calls, Ok(1)));
        let debug = format!("{cache:?}");
        assert!(debug.contains("pending loads: 1"), "{debug}");

        pending.await.unwrap();
        cache.values.run_pending_tasks();
        let debug = format!("{cache:?}");
        assert!(debug.contains("in-memory items: 1"), "{debug}");
        assert!(debug.contains("pending loads: 0"), "{debug}");
    }

    #[tokio::test]
    async fn test_shut_down_pool() {
        let pool = pool();
        pool.shutdown();
        let cache = SingleFlight::<&'static str, u32>::new(None);
        let calls = Arc::new(AtomicUsize::new(0));

        let result = cache
            .get_with(&pool, "key", counting_loader(&calls, Ok(1)))
            .await;
        assert_eq!(result, Err(CacheError::Shutdown));
        assert!(!cache.is_pending(&"key"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropped_pool_is_internal_error() {
        let pool = pool();
        let cache = SingleFlight::<&'static str, u32>::new(None);

        let request = cache.get_with(&pool, "key", |_| futures::future::pending().boxed());
        drop(pool);

        assert_eq!(request.await, Err(CacheError::InternalError));
        assert!(!cache.is_pending(&"key"));
    }
}

//! Request-scoped keyed batching
//!
//! Implements the DataLoader pattern for preventing N+1 round trips: lookups
//! issued within one short collection window are deduplicated and handed to a
//! [`BulkFetcher`] as a single batch. See: https://github.com/graphql/dataloader

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, instrument, warn};

use crate::{EntityType, Error, FetchError, Result};

/// Bulk fetcher for one entity type
#[async_trait]
pub trait BulkFetcher<K, V>: Send + Sync
where
    K: Send + Sync + Clone + Eq + Hash,
    V: Send + Sync + Clone,
{
    /// Fetch every key in a single round trip.
    ///
    /// Keys without a record are left out of the returned map; they resolve to
    /// `None`. A transport failure is an `Err`, never an empty map.
    async fn fetch(&self, keys: &[K]) -> std::result::Result<HashMap<K, V>, FetchError>;

    /// Fetch one key in its own round trip.
    async fn fetch_one(&self, key: &K) -> std::result::Result<Option<V>, FetchError> {
        let mut records = self.fetch(std::slice::from_ref(key)).await?;
        Ok(records.remove(key))
    }
}

/// Coalescing window settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// How long a batch collects keys after its first key arrives.
    ///
    /// Zero flushes as soon as the registering task yields.
    pub delay: Duration,
    /// Distinct keys at which a batch is dispatched without waiting for the window.
    pub max_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(2),
            max_batch_size: 1000,
        }
    }
}

impl BatchConfig {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }
}

type Reply<V> = std::result::Result<Option<V>, FetchError>;

/// Distinct keys collected during one window, with every waiter per key
struct Batch<K, V> {
    keys: Vec<K>,
    waiters: HashMap<K, Vec<oneshot::Sender<Reply<V>>>>,
}

impl<K, V> Default for Batch<K, V> {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            waiters: HashMap::new(),
        }
    }
}

struct State<K, V> {
    cache: HashMap<K, Option<V>>,
    open: Batch<K, V>,
    /// Bumped every time the open batch is taken for dispatch
    generation: u64,
}

impl<K, V> State<K, V> {
    fn take_batch(&mut self) -> Batch<K, V> {
        self.generation += 1;
        mem::take(&mut self.open)
    }
}

struct Shared<K, V>
where
    K: Send + Sync + Clone + Eq + Hash,
    V: Send + Sync + Clone,
{
    entity: EntityType,
    fetcher: Arc<dyn BulkFetcher<K, V>>,
    config: BatchConfig,
    state: Mutex<State<K, V>>,
}

enum Pending<V> {
    Ready(Option<V>),
    Waiting(oneshot::Receiver<Reply<V>>),
}

impl<V> Pending<V> {
    async fn resolve(self, entity: EntityType) -> Result<Option<V>> {
        match self {
            Pending::Ready(value) => Ok(value),
            Pending::Waiting(rx) => match rx.await {
                Ok(reply) => reply.map_err(Error::from),
                Err(_) => Err(Error::BatchAbandoned { entity }),
            },
        }
    }
}

impl<K, V> Shared<K, V>
where
    K: Send + Sync + Clone + Eq + Hash + 'static,
    V: Send + Sync + Clone + 'static,
{
    fn register(self: &Arc<Self>, state: &mut State<K, V>, key: K) -> Pending<V> {
        if let Some(value) = state.cache.get(&key) {
            return Pending::Ready(value.clone());
        }

        let (tx, rx) = oneshot::channel();
        if state.open.keys.is_empty() {
            self.schedule_flush(state.generation);
        }
        match state.open.waiters.entry(key) {
            Entry::Occupied(mut entry) => entry.get_mut().push(tx),
            Entry::Vacant(entry) => {
                state.open.keys.push(entry.key().clone());
                entry.insert(vec![tx]);
            }
        }

        if state.open.keys.len() >= self.config.max_batch_size {
            let batch = state.take_batch();
            let shared = Arc::clone(self);
            tokio::spawn(async move { shared.dispatch(batch).await });
        }

        Pending::Waiting(rx)
    }

    /// Close the window of batch `generation` after the configured delay.
    ///
    /// The timer only holds a weak handle, so a batcher dropped with its
    /// request never dispatches the batch it was collecting.
    fn schedule_flush(self: &Arc<Self>, generation: u64) {
        let weak = Arc::downgrade(self);
        let delay = self.config.delay;
        tokio::spawn(async move {
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }

            let Some(shared) = weak.upgrade() else {
                return;
            };
            let batch = {
                let mut state = shared.state.lock().await;
                if state.generation != generation || state.open.keys.is_empty() {
                    return;
                }
                state.take_batch()
            };
            shared.dispatch(batch).await;
        });
    }

    #[instrument(skip_all, fields(entity = %self.entity, keys = batch.keys.len()))]
    async fn dispatch(&self, batch: Batch<K, V>) {
        let Batch { keys, mut waiters } = batch;
        debug!("dispatching batch");

        match self.fetcher.fetch(&keys).await {
            Ok(mut records) => {
                let mut state = self.state.lock().await;
                for key in keys {
                    let record = records.remove(&key);
                    for tx in waiters.remove(&key).unwrap_or_default() {
                        let _ = tx.send(Ok(record.clone()));
                    }
                    state.cache.insert(key, record);
                }
            }
            Err(err) => {
                warn!(error = %err, "bulk fetch failed, failing every waiter of the batch");
                for tx in waiters.into_values().flatten() {
                    let _ = tx.send(Err(err.clone()));
                }
            }
        }
    }
}

/// Keyed batcher with a request-scoped cache
///
/// Every key is fetched at most once for the lifetime of the batcher, which
/// should be the lifetime of one inbound request. Clones share the same cache.
pub struct KeyedBatcher<K, V>
where
    K: Send + Sync + Clone + Eq + Hash + 'static,
    V: Send + Sync + Clone + 'static,
{
    shared: Arc<Shared<K, V>>,
}

impl<K, V> KeyedBatcher<K, V>
where
    K: Send + Sync + Clone + Eq + Hash + 'static,
    V: Send + Sync + Clone + 'static,
{
    /// Create an empty batcher bound to `fetcher`
    pub fn new(
        entity: EntityType,
        fetcher: Arc<dyn BulkFetcher<K, V>>,
        config: BatchConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                entity,
                fetcher,
                config,
                state: Mutex::new(State {
                    cache: HashMap::new(),
                    open: Batch::default(),
                    generation: 0,
                }),
            }),
        }
    }

    pub fn entity(&self) -> EntityType {
        self.shared.entity
    }

    /// Load a single item by key
    ///
    /// Returns cached results immediately; otherwise joins the open batch and
    /// waits for it. `Ok(None)` means the owning service has no such record.
    pub async fn load(&self, key: K) -> Result<Option<V>> {
        let pending = {
            let mut state = self.shared.state.lock().await;
            self.shared.register(&mut state, key)
        };
        pending.resolve(self.shared.entity).await
    }

    /// Load multiple items by keys
    ///
    /// Results line up with `keys`, duplicates included; every distinct
    /// uncached key joins the same batch.
    pub async fn load_many(&self, keys: &[K]) -> Result<Vec<Option<V>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let pending: Vec<Pending<V>> = {
            let mut state = self.shared.state.lock().await;
            keys.iter()
                .cloned()
                .map(|key| self.shared.register(&mut state, key))
                .collect()
        };

        let entity = self.shared.entity;
        try_join_all(pending.into_iter().map(|p| p.resolve(entity))).await
    }

    /// Clear the cache
    pub async fn clear(&self) {
        let mut state = self.shared.state.lock().await;
        state.cache.clear();
    }

    /// Prime the cache with a value
    ///
    /// Useful for seeding the cache with records fetched some other way, e.g.
    /// the parent collection of a join.
    pub async fn prime(&self, key: K, value: V) {
        let mut state = self.shared.state.lock().await;
        state.cache.insert(key, Some(value));
    }
}

impl<K, V> Clone for KeyedBatcher<K, V>
where
    K: Send + Sync + Clone + Eq + Hash + 'static,
    V: Send + Sync + Clone + 'static,
{
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct TestFetcher {
        calls: std::sync::Mutex<Vec<Vec<u32>>>,
        failing: AtomicBool,
    }

    impl TestFetcher {
        fn calls(&self) -> Vec<Vec<u32>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BulkFetcher<u32, String> for TestFetcher {
        async fn fetch(
            &self,
            keys: &[u32],
        ) -> std::result::Result<HashMap<u32, String>, FetchError> {
            self.calls.lock().unwrap().push(keys.to_vec());
            if self.failing.load(Ordering::SeqCst) {
                return Err(FetchError::Unavailable {
                    entity: EntityType::Robots,
                    message: "connection refused".to_string(),
                });
            }
            // keys >= 100 have no record
            Ok(keys
                .iter()
                .filter(|k| **k < 100)
                .map(|k| (*k, format!("value-{}", k)))
                .collect())
        }
    }

    fn batcher(fetcher: &Arc<TestFetcher>) -> KeyedBatcher<u32, String> {
        KeyedBatcher::new(EntityType::Robots, fetcher.clone(), BatchConfig::default())
    }

    #[tokio::test]
    async fn test_batcher_single_load() {
        let fetcher = Arc::new(TestFetcher::default());
        let loader = batcher(&fetcher);
        let value = assert_ok!(loader.load(1).await);
        assert_eq!(value, Some("value-1".to_string()));
        assert_eq!(fetcher.calls(), vec![vec![1]]);
    }

    #[tokio::test]
    async fn test_batcher_caching() {
        let fetcher = Arc::new(TestFetcher::default());
        let loader = batcher(&fetcher);

        assert_ok!(loader.load(1).await);
        let again = assert_ok!(loader.load(1).await);

        assert_eq!(again, Some("value-1".to_string()));
        assert_eq!(fetcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_batcher_load_many_order_and_dedup() {
        let fetcher = Arc::new(TestFetcher::default());
        let loader = batcher(&fetcher);

        let values = assert_ok!(loader.load_many(&[3, 1, 2, 1]).await);

        assert_eq!(
            values,
            vec![
                Some("value-3".to_string()),
                Some("value-1".to_string()),
                Some("value-2".to_string()),
                Some("value-1".to_string()),
            ]
        );
        assert_eq!(fetcher.calls(), vec![vec![3, 1, 2]]);
    }

    #[tokio::test]
    async fn test_batcher_concurrent_loads_coalesce() {
        let fetcher = Arc::new(TestFetcher::default());
        let loader = batcher(&fetcher);

        let loads = (0..12u32).map(|i| loader.load(i % 4));
        let values = futures::future::join_all(loads).await;

        assert!(values.iter().all(|v| v.is_ok()));
        let calls = fetcher.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_batcher_unknown_key_is_none_and_cached() {
        let fetcher = Arc::new(TestFetcher::default());
        let loader = batcher(&fetcher);

        let values = assert_ok!(loader.load_many(&[7, 404]).await);
        assert_eq!(values, vec![Some("value-7".to_string()), None]);

        assert_eq!(assert_ok!(loader.load(404).await), None);
        assert_eq!(fetcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_batcher_empty_load_many() {
        let fetcher = Arc::new(TestFetcher::default());
        let loader = batcher(&fetcher);

        let values = assert_ok!(loader.load_many(&[]).await);
        assert!(values.is_empty());
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_batcher_failure_reaches_every_waiter() {
        let fetcher = Arc::new(TestFetcher::default());
        fetcher.failing.store(true, Ordering::SeqCst);
        let loader = batcher(&fetcher);

        let (a, b, many) = tokio::join!(loader.load(1), loader.load(2), loader.load_many(&[1, 3]));

        for result in [a.map(|_| ()), b.map(|_| ()), many.map(|_| ())] {
            let err = assert_err!(result);
            assert!(matches!(
                err,
                Error::Fetch(FetchError::Unavailable { entity: EntityType::Robots, .. })
            ));
        }
        assert_eq!(fetcher.calls(), vec![vec![1, 2, 3]]);
    }

    #[tokio::test]
    async fn test_batcher_failure_is_not_cached() {
        let fetcher = Arc::new(TestFetcher::default());
        fetcher.failing.store(true, Ordering::SeqCst);
        let loader = batcher(&fetcher);

        assert_err!(loader.load(5).await);
        fetcher.failing.store(false, Ordering::SeqCst);

        let value = assert_ok!(loader.load(5).await);
        assert_eq!(value, Some("value-5".to_string()));
        assert_eq!(fetcher.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_batcher_late_key_starts_new_batch() {
        let fetcher = Arc::new(TestFetcher::default());
        let loader = batcher(&fetcher);

        assert_ok!(loader.load(1).await);
        assert_ok!(loader.load(2).await);

        assert_eq!(fetcher.calls(), vec![vec![1], vec![2]]);
    }

    #[tokio::test]
    async fn test_batcher_max_batch_size_splits() {
        let fetcher = Arc::new(TestFetcher::default());
        let config = BatchConfig::default().with_max_batch_size(2);
        let loader = KeyedBatcher::new(EntityType::Robots, fetcher.clone(), config);

        let values = assert_ok!(loader.load_many(&[1, 2, 3, 4, 5]).await);

        assert_eq!(values.len(), 5);
        assert_eq!(fetcher.calls(), vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[tokio::test]
    async fn test_batcher_zero_delay_still_coalesces() {
        let fetcher = Arc::new(TestFetcher::default());
        let config = BatchConfig::default().with_delay(Duration::ZERO);
        let loader = KeyedBatcher::new(EntityType::Robots, fetcher.clone(), config);

        let (a, b) = tokio::join!(loader.load(1), loader.load(2));

        assert_eq!(assert_ok!(a), Some("value-1".to_string()));
        assert_eq!(assert_ok!(b), Some("value-2".to_string()));
        assert_eq!(fetcher.calls(), vec![vec![1, 2]]);
    }

    #[tokio::test]
    async fn test_batcher_prime() {
        let fetcher = Arc::new(TestFetcher::default());
        let loader = batcher(&fetcher);

        loader.prime(1, "custom-value".to_string()).await;

        let value = assert_ok!(loader.load(1).await);
        assert_eq!(value, Some("custom-value".to_string()));
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_batcher_clear() {
        let fetcher = Arc::new(TestFetcher::default());
        let loader = batcher(&fetcher);

        assert_ok!(loader.load(1).await);
        loader.clear().await;
        assert_ok!(loader.load(1).await);

        assert_eq!(fetcher.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_batcher_clones_share_cache() {
        let fetcher = Arc::new(TestFetcher::default());
        let loader = batcher(&fetcher);
        let other = loader.clone();

        assert_ok!(loader.load(9).await);
        assert_ok!(other.load(9).await);

        assert_eq!(fetcher.calls().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_batcher_loads_from_spawned_tasks_coalesce() {
        let fetcher = Arc::new(TestFetcher::default());
        let config = BatchConfig::default().with_delay(Duration::from_millis(50));
        let loader = KeyedBatcher::new(EntityType::Robots, fetcher.clone(), config);

        let handles: Vec<_> = (0..64u32)
            .map(|i| {
                let loader = loader.clone();
                tokio::spawn(async move { (i % 8, loader.load(i % 8).await) })
            })
            .collect();

        for handle in handles {
            let (key, value) = handle.await.unwrap();
            assert_eq!(value.unwrap(), Some(format!("value-{}", key)));
        }

        let calls = fetcher.calls();
        assert_eq!(calls.len(), 1);
        let mut keys = calls[0].clone();
        keys.sort_unstable();
        assert_eq!(keys, (0..8).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_batcher_dropped_before_flush_never_dispatches() {
        let fetcher = Arc::new(TestFetcher::default());
        let config = BatchConfig::default().with_delay(Duration::from_millis(20));
        let loader = KeyedBatcher::new(EntityType::Robots, fetcher.clone(), config);

        let pending = {
            let mut state = loader.shared.state.lock().await;
            loader.shared.register(&mut state, 5)
        };
        drop(loader);

        let err = assert_err!(pending.resolve(EntityType::Robots).await);
        assert!(matches!(err, Error::BatchAbandoned { entity: EntityType::Robots }));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(fetcher.calls().is_empty());
    }
}


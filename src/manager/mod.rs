//! Top-level scheduler: consults the cache, coalesces concurrent requests for the
//! same key, spills misses into a bounded pending queue, dispatches them to a
//! caller-supplied provider on a bounded worker pool, retries failures, and fans results
//! back to every waiting callback while populating the cache.
//!
//! Built around a classify → dedup → dispatch admission pipeline, with a single mutex
//! guarding shared scheduler state that is released before any downstream `.await`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::cache::{CacheConfig, MemoryCache};
use crate::errors::TaskError;
use crate::hash_queue::{EnqueueOutcome, EvictionPolicy, HashQueue};
use crate::priority::Priority;
use crate::retry::RetryPolicy;

/// Terminal outcome delivered to a fetch callback: `Ok(None)` covers both an invalid key
/// and a cached "null payload" hit — from the caller's perspective both are a successful
/// lookup that yielded nothing (distinguished only in cache stats).
pub type FetchResult<P, E> = Result<Option<P>, TaskError<E>>;

type Waiter<P, E> = Box<dyn FnOnce(FetchResult<P, E>) + Send>;

/// While a multi-key provider is idle, freshly-missed keys accumulate for this long before
/// the first batch goes out, so concurrently-arriving callers land in the same provider
/// call instead of each triggering their own. Mirrors the poll/backoff cadence of the
/// teacher's `TxForwarder::run` loop, scaled down to a one-shot coalescing window.
const BATCH_COALESCE_WINDOW: Duration = Duration::from_millis(5);

/// Dual-purpose setting controlling both pending-queue pull order and overflow policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityStrategy {
    /// Pull most-recently-queued first; overflow evicts the oldest queued key.
    Lifo,
    /// Pull oldest-queued first; overflow rejects the newly requested key.
    Fifo,
}

impl PriorityStrategy {
    fn eviction_policy(self) -> EvictionPolicy {
        match self {
            Self::Lifo => EvictionPolicy::EvictOldest,
            Self::Fifo => EvictionPolicy::RejectNewest,
        }
    }
}

/// A provider that resolves one key at a time.
#[async_trait]
pub trait MonoProvide<K, P, E>: Send + Sync {
    async fn provide(&self, key: K) -> Result<Option<P>, E>;
}

/// A provider that resolves a batch of keys in one call. Keys absent from the returned
/// map on success are treated as an explicit null payload.
#[async_trait]
pub trait MultiProvide<K, P, E>: Send + Sync {
    async fn provide(&self, keys: Vec<K>) -> Result<HashMap<K, Option<P>>, E>;

    /// Maximum number of keys bundled into a single `provide` call.
    fn max_batch(&self) -> usize;
}

pub enum Provider<K, P, E> {
    Mono(Arc<dyn MonoProvide<K, P, E>>),
    Multi(Arc<dyn MultiProvide<K, P, E>>),
}

#[derive(Clone)]
pub struct ManagerConfig<K, P> {
    pub max_queueing_tasks: usize,
    pub max_running_tasks: usize,
    pub retry_count: RetryPolicy,
    pub priority_strategy: PriorityStrategy,
    pub cache_config: CacheConfig<K, P>,
}

impl<K, P> Default for ManagerConfig<K, P> {
    fn default() -> Self {
        Self {
            max_queueing_tasks: 1_000,
            max_running_tasks: 4,
            retry_count: RetryPolicy::Never,
            priority_strategy: PriorityStrategy::Fifo,
            cache_config: CacheConfig::default(),
        }
    }
}

impl<K, P> ManagerConfig<K, P> {
    pub fn with_max_queueing_tasks(mut self, n: usize) -> Self {
        self.max_queueing_tasks = n;
        self
    }

    pub fn with_max_running_tasks(mut self, n: usize) -> Self {
        self.max_running_tasks = n;
        self
    }

    pub fn with_retry_count(mut self, policy: RetryPolicy) -> Self {
        self.retry_count = policy;
        self
    }

    pub fn with_priority_strategy(mut self, strategy: PriorityStrategy) -> Self {
        self.priority_strategy = strategy;
        self
    }

    pub fn with_cache_config(mut self, cache_config: CacheConfig<K, P>) -> Self {
        self.cache_config = cache_config;
        self
    }
}

struct Inner<K, P, E> {
    cache: MemoryCache<K, P>,
    queue: HashQueue<K>,
    pending: HashMap<K, Vec<Waiter<P, E>>>,
    active: usize,
    /// Fresh keys waiting out a [`BATCH_COALESCE_WINDOW`] before the first multi-provider
    /// batch of an idle period is dispatched. Unused by mono providers.
    batch_collector: Vec<K>,
    /// Whether a collector flush is already scheduled, so a second caller arriving during
    /// the window joins the same flush instead of spawning another one.
    collecting_batch: bool,
}

pub struct KVLightTasksManager<K, P, E> {
    provider: Provider<K, P, E>,
    max_running_tasks: usize,
    retry_count: RetryPolicy,
    priority_strategy: PriorityStrategy,
    inner: AsyncMutex<Inner<K, P, E>>,
}

impl<K, P, E> KVLightTasksManager<K, P, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(provider: Provider<K, P, E>, config: ManagerConfig<K, P>) -> Arc<Self> {
        let queue = HashQueue::new(config.max_queueing_tasks);
        let cache = MemoryCache::new(config.cache_config);
        Arc::new(Self {
            provider,
            max_running_tasks: config.max_running_tasks,
            retry_count: config.retry_count,
            priority_strategy: config.priority_strategy,
            inner: AsyncMutex::new(Inner {
                cache,
                queue,
                pending: HashMap::new(),
                active: 0,
                batch_collector: Vec::new(),
                collecting_batch: false,
            }),
        })
    }

    /// Fetch a single key. `cb` is invoked exactly once, from whatever worker or calling
    /// context resolves it, never while holding the manager's internal mutex.
    pub async fn fetch<F>(self: &Arc<Self>, key: K, cb: F)
    where
        F: FnOnce(FetchResult<P, E>) + Send + 'static,
    {
        self.fetch_batch(vec![key], vec![Box::new(cb)]).await;
    }

    /// `async fn` sugar over [`fetch`](Self::fetch).
    pub async fn fetch_async(self: &Arc<Self>, key: K) -> FetchResult<P, E> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.fetch(key, move |result| {
            let _ = tx.send(result);
        })
        .await;
        rx.await.unwrap_or_else(|_| Ok(None))
    }

    /// Fetch many keys, invoking `cb` once per key with its own result. Duplicate keys in
    /// `keys` each receive their own callback invocation of the same underlying result.
    pub async fn fetch_each<F>(self: &Arc<Self>, keys: Vec<K>, cb: F)
    where
        F: Fn(K, FetchResult<P, E>) + Send + Sync + 'static,
    {
        let cb = Arc::new(cb);
        let waiters = keys
            .iter()
            .cloned()
            .map(|k| {
                let cb = Arc::clone(&cb);
                Box::new(move |result: FetchResult<P, E>| cb(k, result)) as Waiter<P, E>
            })
            .collect();
        self.fetch_batch(keys, waiters).await;
    }

    /// Fetch many keys, invoking `cb` once with the full result list in input order
    /// (duplicates reproduced in place).
    pub async fn fetch_aggregated<F>(self: &Arc<Self>, keys: Vec<K>, cb: F)
    where
        F: FnOnce(Vec<FetchResult<P, E>>) + Send + 'static,
    {
        let n = keys.len();
        let slots: Vec<std::sync::Mutex<Option<FetchResult<P, E>>>> = (0..n).map(|_| std::sync::Mutex::new(None)).collect();
        let slots = Arc::new(slots);
        let remaining = Arc::new(AtomicUsize::new(n));
        let cb = Arc::new(std::sync::Mutex::new(Some(cb)));

        let mut waiters = Vec::with_capacity(n);
        for i in 0..n {
            let slots = Arc::clone(&slots);
            let remaining = Arc::clone(&remaining);
            let cb = Arc::clone(&cb);
            waiters.push(Box::new(move |result: FetchResult<P, E>| {
                // Each position writes its own slot exactly once; the last waiter to
                // finish drains every slot and fires the aggregated callback.
                *slots[i].lock().unwrap() = Some(result);
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let collected: Vec<FetchResult<P, E>> = slots.iter().map(|slot| slot.lock().unwrap().take().expect("every slot filled before the last waiter fires")).collect();
                    if let Some(cb) = cb.lock().unwrap().take() {
                        cb(collected);
                    }
                }
            }) as Waiter<P, E>);
        }
        self.fetch_batch(keys, waiters).await;
    }

    async fn fetch_batch(self: &Arc<Self>, keys: Vec<K>, waiters: Vec<Waiter<P, E>>) {
        let mut immediate: Vec<(Waiter<P, E>, FetchResult<P, E>)> = Vec::new();
        let mut evicted: Vec<(Waiter<P, E>, TaskError<E>)> = Vec::new();
        {
            let mut fresh_keys = Vec::new();
            let mut inner = self.inner.lock().await;
            for (key, waiter) in keys.into_iter().zip(waiters.into_iter()) {
                match inner.cache.get(&key) {
                    crate::cache::AccessResult::InvalidKey | crate::cache::AccessResult::HitNull => immediate.push((waiter, Ok(None))),
                    crate::cache::AccessResult::HitNonNull(payload) => immediate.push((waiter, Ok(Some(payload)))),
                    crate::cache::AccessResult::Miss => match inner.pending.entry(key.clone()) {
                        Entry::Occupied(mut existing) => existing.get_mut().push(waiter),
                        Entry::Vacant(slot) => {
                            slot.insert(vec![waiter]);
                            fresh_keys.push(key);
                        }
                    },
                }
            }
            self.schedule(&mut inner, fresh_keys, &mut evicted);
        }
        // Every callback fires after the lock above is released, never while holding it.
        for (waiter, result) in immediate {
            waiter(result);
        }
        for (waiter, err) in evicted {
            waiter(Err(err));
        }
    }

    fn schedule(self: &Arc<Self>, inner: &mut Inner<K, P, E>, fresh_keys: Vec<K>, evicted: &mut Vec<(Waiter<P, E>, TaskError<E>)>) {
        match &self.provider {
            Provider::Mono(provider) => {
                let provider = Arc::clone(provider);
                self.schedule_mono(inner, provider, fresh_keys, evicted);
            }
            Provider::Multi(provider) => {
                let provider = Arc::clone(provider);
                self.schedule_multi(inner, provider, fresh_keys, evicted);
            }
        }
    }

    fn schedule_mono(
        self: &Arc<Self>,
        inner: &mut Inner<K, P, E>,
        provider: Arc<dyn MonoProvide<K, P, E>>,
        fresh_keys: Vec<K>,
        evicted: &mut Vec<(Waiter<P, E>, TaskError<E>)>,
    ) {
        let slots = (self.max_running_tasks.saturating_sub(inner.active)).min(fresh_keys.len());
        let mut keys = fresh_keys.into_iter();
        for _ in 0..slots {
            let key = keys.next().expect("slots bounded by fresh_keys.len()");
            inner.active += 1;
            self.spawn_mono_worker(Arc::clone(&provider), key);
        }
        for key in keys {
            self.enqueue_or_fail(inner, key, evicted);
        }
    }

    /// Multi-provider admission. While the manager is idle (no batch in flight), fresh keys
    /// join a short-lived collector instead of dispatching immediately, so concurrently
    /// arriving `fetch_async` calls land in the same provider batch (see
    /// [`BATCH_COALESCE_WINDOW`] and [`Self::flush_batch_collector`]). Once a batch is
    /// already running, later misses use the original immediate-dispatch-or-queue path —
    /// there's no longer an idle window worth coalescing into.
    fn schedule_multi(
        self: &Arc<Self>,
        inner: &mut Inner<K, P, E>,
        provider: Arc<dyn MultiProvide<K, P, E>>,
        fresh_keys: Vec<K>,
        evicted: &mut Vec<(Waiter<P, E>, TaskError<E>)>,
    ) {
        if fresh_keys.is_empty() {
            return;
        }

        if inner.active == 0 {
            inner.batch_collector.extend(fresh_keys);
            if !inner.collecting_batch {
                inner.collecting_batch = true;
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(BATCH_COALESCE_WINDOW).await;
                    this.flush_batch_collector(provider).await;
                });
            }
            return;
        }

        let max_batch = provider.max_batch().max(1);
        let mut fresh_keys = fresh_keys;
        while inner.active < self.max_running_tasks && !fresh_keys.is_empty() {
            let take = fresh_keys.len().min(max_batch);
            let batch: Vec<K> = fresh_keys.drain(..take).collect();
            inner.active += 1;
            self.spawn_multi_worker(Arc::clone(&provider), batch);
        }
        for key in fresh_keys {
            self.enqueue_or_fail(inner, key, evicted);
        }
    }

    /// Drains the batch collector after the coalescing window elapses, dispatching as many
    /// workers as `max_running_tasks` allows and queueing the rest.
    async fn flush_batch_collector(self: Arc<Self>, provider: Arc<dyn MultiProvide<K, P, E>>) {
        let max_batch = provider.max_batch().max(1);
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            inner.collecting_batch = false;
            let mut collected = std::mem::take(&mut inner.batch_collector);
            while inner.active < self.max_running_tasks && !collected.is_empty() {
                let take = collected.len().min(max_batch);
                let batch: Vec<K> = collected.drain(..take).collect();
                inner.active += 1;
                self.spawn_multi_worker(Arc::clone(&provider), batch);
            }
            for key in collected {
                self.enqueue_or_fail(&mut inner, key, &mut evicted);
            }
        }
        for (waiter, err) in evicted {
            waiter(Err(err));
        }
    }

    fn enqueue_or_fail(self: &Arc<Self>, inner: &mut Inner<K, P, E>, key: K, evicted: &mut Vec<(Waiter<P, E>, TaskError<E>)>) {
        match inner.queue.enqueue(key, self.priority_strategy.eviction_policy()) {
            EnqueueOutcome::Enqueued => {}
            EnqueueOutcome::Evicted(lost) | EnqueueOutcome::Rejected(lost) => {
                warn!("key evicted by priority strategy before a worker became available");
                if let Some(waiters) = inner.pending.remove(&lost) {
                    for waiter in waiters {
                        evicted.push((waiter, TaskError::EvictedByPriorityStrategy));
                    }
                }
            }
        }
    }

    fn spawn_mono_worker(self: &Arc<Self>, provider: Arc<dyn MonoProvide<K, P, E>>, key: K) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_mono_worker(provider, key).await });
    }

    async fn run_mono_worker(self: Arc<Self>, provider: Arc<dyn MonoProvide<K, P, E>>, mut key: K) {
        loop {
            let mut retry_policy = self.retry_count;
            loop {
                match provider.provide(key.clone()).await {
                    Ok(payload) => {
                        self.on_key_success(&key, payload).await;
                        break;
                    }
                    Err(err) => {
                        if retry_policy.should_retry() {
                            let delay = retry_policy.time_interval();
                            retry_policy = retry_policy.next();
                            debug!(delay_ms = delay.as_millis() as u64, "provider attempt failed, retrying");
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        self.on_key_failure(&key, TaskError::Provider(err)).await;
                        break;
                    }
                }
            }
            match self.pull_next_key().await {
                Some(next) => key = next,
                None => {
                    self.release_slot().await;
                    return;
                }
            }
        }
    }

    fn spawn_multi_worker(self: &Arc<Self>, provider: Arc<dyn MultiProvide<K, P, E>>, batch: Vec<K>) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_multi_worker(provider, batch).await });
    }

    async fn run_multi_worker(self: Arc<Self>, provider: Arc<dyn MultiProvide<K, P, E>>, mut batch: Vec<K>) {
        let max_batch = provider.max_batch().max(1);
        loop {
            let mut retry_policy = self.retry_count;
            loop {
                match provider.provide(batch.clone()).await {
                    Ok(map) => {
                        self.on_batch_success(&batch, map).await;
                        break;
                    }
                    Err(err) => {
                        if retry_policy.should_retry() {
                            let delay = retry_policy.time_interval();
                            retry_policy = retry_policy.next();
                            debug!(delay_ms = delay.as_millis() as u64, "batch provider attempt failed, retrying");
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        self.on_batch_failure(&batch, TaskError::Provider(err)).await;
                        break;
                    }
                }
            }
            match self.pull_next_batch(max_batch).await {
                Some(next) => batch = next,
                None => {
                    self.release_slot().await;
                    return;
                }
            }
        }
    }

    async fn on_key_success(&self, key: &K, payload: Option<P>) {
        let waiters = {
            let mut inner = self.inner.lock().await;
            let _ = inner.cache.set(key.clone(), payload.clone(), Priority::default(), None);
            inner.pending.remove(key)
        };
        if let Some(waiters) = waiters {
            for waiter in waiters {
                waiter(Ok(payload.clone()));
            }
        }
    }

    async fn on_key_failure(&self, key: &K, err: TaskError<E>) {
        let waiters = {
            let mut inner = self.inner.lock().await;
            inner.pending.remove(key)
        };
        if let Some(waiters) = waiters {
            for waiter in waiters {
                waiter(Err(err.clone()));
            }
        }
    }

    async fn on_batch_success(&self, batch: &[K], mut map: HashMap<K, Option<P>>) {
        let fanout: Vec<(Option<P>, Vec<Waiter<P, E>>)> = {
            let mut inner = self.inner.lock().await;
            let mut fanout = Vec::with_capacity(batch.len());
            for key in batch {
                let payload = map.remove(key).flatten();
                let _ = inner.cache.set(key.clone(), payload.clone(), Priority::default(), None);
                if let Some(waiters) = inner.pending.remove(key) {
                    fanout.push((payload, waiters));
                }
            }
            fanout
        };
        for (payload, waiters) in fanout {
            for waiter in waiters {
                waiter(Ok(payload.clone()));
            }
        }
    }

    async fn on_batch_failure(&self, batch: &[K], err: TaskError<E>) {
        let fanout: Vec<Vec<Waiter<P, E>>> = {
            let mut inner = self.inner.lock().await;
            batch.iter().filter_map(|key| inner.pending.remove(key)).collect()
        };
        for waiters in fanout {
            for waiter in waiters {
                waiter(Err(err.clone()));
            }
        }
    }

    async fn pull_next_key(&self) -> Option<K> {
        let mut inner = self.inner.lock().await;
        match self.priority_strategy {
            PriorityStrategy::Lifo => inner.queue.dequeue_front(),
            PriorityStrategy::Fifo => inner.queue.dequeue_back(),
        }
    }

    async fn pull_next_batch(&self, max_batch: usize) -> Option<Vec<K>> {
        let mut inner = self.inner.lock().await;
        let batch = match self.priority_strategy {
            PriorityStrategy::Lifo => inner.queue.dequeue_batch_front(max_batch),
            PriorityStrategy::Fifo => inner.queue.dequeue_batch_back(max_batch),
        };
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }

    async fn release_slot(&self) {
        let mut inner = self.inner.lock().await;
        inner.active -= 1;
        info!(active = inner.active, "worker slot released");
    }

    pub async fn cache_stats(&self) -> crate::cache::CacheStats {
        self.inner.lock().await.cache.stats()
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }
}

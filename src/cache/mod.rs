//! MemoryCache: the composite cache's public face. Adds configuration, TTL jitter,
//! memory-cost accounting, key validation, a first-class null payload ("negative cache"),
//! and access statistics on top of the TTL+priority+LRU store.
//!
//! A config-driven cache behind a single internal lock with a `get`/`insert`/`modify`
//! API shape, with eviction, jitter, and null-caching semantics layered on top.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use crate::clock::{Clock, SystemClock};
use crate::errors::CacheError;
use crate::priority::Priority;
use crate::store::{SetOutcome, TtlPriorityLruStore};

/// Both caps are enforced; `count: 0` disables the cache entirely (every `set` is rejected).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimit {
    pub count: usize,
    pub memory_bytes: usize,
}

impl Default for MemoryLimit {
    fn default() -> Self {
        Self { count: 10_000, memory_bytes: usize::MAX }
    }
}

pub type KeyValidator<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;
pub type CostProvider<P> = Arc<dyn Fn(&P) -> usize + Send + Sync>;
pub type StatisticsReport = Arc<dyn Fn(&CacheStats, AccessKind) + Send + Sync>;

/// The classification of the most recent access, passed to `statistics_report` alongside
/// the running [`CacheStats`] snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    InvalidKey,
    HitNull,
    HitNonNull,
    Miss,
}

/// Outcome of [`MemoryCache::get`]. The null payload is first-class: a key explicitly set
/// with `payload: None` reads back as `HitNull`, distinct from `Miss`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessResult<P> {
    InvalidKey,
    HitNull,
    HitNonNull(P),
    Miss,
}

#[derive(Clone)]
pub struct CacheConfig<K, P> {
    pub thread_safe: bool,
    pub memory_limit: MemoryLimit,
    pub default_ttl: Duration,
    pub default_ttl_for_null: Duration,
    pub ttl_jitter_range: Duration,
    pub key_validator: Option<KeyValidator<K>>,
    pub cost_provider: Option<CostProvider<P>>,
    pub statistics_report: Option<StatisticsReport>,
}

impl<K, P> std::fmt::Debug for CacheConfig<K, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheConfig")
            .field("thread_safe", &self.thread_safe)
            .field("memory_limit", &self.memory_limit)
            .field("default_ttl", &self.default_ttl)
            .field("default_ttl_for_null", &self.default_ttl_for_null)
            .field("ttl_jitter_range", &self.ttl_jitter_range)
            .field("key_validator", &self.key_validator.as_ref().map(|_| "<fn>"))
            .field("cost_provider", &self.cost_provider.as_ref().map(|_| "<fn>"))
            .field("statistics_report", &self.statistics_report.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl<K, P> Default for CacheConfig<K, P> {
    fn default() -> Self {
        Self {
            thread_safe: true,
            memory_limit: MemoryLimit::default(),
            default_ttl: Duration::from_secs(60),
            default_ttl_for_null: Duration::from_secs(5),
            ttl_jitter_range: Duration::ZERO,
            key_validator: None,
            cost_provider: None,
            statistics_report: None,
        }
    }
}

impl<K, P> CacheConfig<K, P> {
    pub fn with_memory_limit(mut self, limit: MemoryLimit) -> Self {
        self.memory_limit = limit;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_default_ttl_for_null(mut self, ttl: Duration) -> Self {
        self.default_ttl_for_null = ttl;
        self
    }

    pub fn with_ttl_jitter_range(mut self, range: Duration) -> Self {
        self.ttl_jitter_range = range;
        self
    }

    pub fn with_key_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&K) -> bool + Send + Sync + 'static,
    {
        self.key_validator = Some(Arc::new(validator));
        self
    }

    pub fn with_cost_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn(&P) -> usize + Send + Sync + 'static,
    {
        self.cost_provider = Some(Arc::new(provider));
        self
    }

    pub fn with_statistics_report<F>(mut self, report: F) -> Self
    where
        F: Fn(&CacheStats, AccessKind) + Send + Sync + 'static,
    {
        self.statistics_report = Some(Arc::new(report));
        self
    }

    pub fn with_thread_safe(mut self, thread_safe: bool) -> Self {
        self.thread_safe = thread_safe;
        self
    }
}

/// Monotonically increasing access counters plus a tracing id.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub trace_id: u64,
    pub invalid_key_count: u64,
    pub null_hit_count: u64,
    pub non_null_hit_count: u64,
    pub miss_count: u64,
}

impl CacheStats {
    pub fn total_accesses(&self) -> u64 {
        self.invalid_key_count + self.null_hit_count + self.non_null_hit_count + self.miss_count
    }

    pub fn hit_rate(&self) -> f64 {
        let denom = (self.total_accesses() - self.invalid_key_count).max(1);
        (self.null_hit_count + self.non_null_hit_count) as f64 / denom as f64
    }

    pub fn success_rate(&self) -> f64 {
        let denom = self.total_accesses().max(1);
        (self.null_hit_count + self.non_null_hit_count) as f64 / denom as f64
    }
}

struct StoredElement<P> {
    payload: Option<P>,
    cost: usize,
}

struct Inner<K, P> {
    store: TtlPriorityLruStore<K, StoredElement<P>>,
    total_cost: usize,
    stats: CacheStats,
}

pub struct MemoryCache<K, P> {
    config: CacheConfig<K, P>,
    clock: Arc<dyn Clock>,
    trace_ids: crate::trace_id::TraceIdFactory,
    inner: Mutex<Inner<K, P>>,
}

impl<K, P> MemoryCache<K, P>
where
    K: Eq + Hash + Clone,
{
    pub fn new(config: CacheConfig<K, P>) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig<K, P>, clock: Arc<dyn Clock>) -> Self {
        let capacity = config.memory_limit.count;
        let trace_ids = crate::trace_id::TraceIdFactory::new();
        let trace_id = trace_ids.next();
        Self {
            config,
            clock,
            trace_ids,
            inner: Mutex::new(Inner {
                store: TtlPriorityLruStore::new(capacity),
                total_cost: 0,
                stats: CacheStats { trace_id, ..Default::default() },
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().store.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }

    pub fn reset_stats(&self) {
        let mut inner = self.inner.lock();
        inner.stats = CacheStats { trace_id: self.trace_ids.next(), ..Default::default() };
    }

    fn cost_of(&self, payload: &Option<P>) -> usize {
        match (payload, &self.config.cost_provider) {
            (Some(p), Some(provider)) => provider(p),
            (Some(_), None) => 1,
            (None, _) => 1,
        }
    }

    fn jittered_ttl(&self, base: Duration) -> Duration {
        let range = self.config.ttl_jitter_range;
        if range.is_zero() {
            return base;
        }
        let offset_secs = rand::thread_rng().gen_range(-range.as_secs_f64()..=range.as_secs_f64());
        let effective = base.as_secs_f64() + offset_secs;
        Duration::from_secs_f64(effective.max(0.0))
    }

    /// Look up `key`. See [`AccessResult`] for the outcome taxonomy.
    pub fn get(&self, key: &K) -> AccessResult<P>
    where
        P: Clone,
    {
        let mut inner = self.inner.lock();
        if let Some(validator) = &self.config.key_validator {
            if !validator(key) {
                inner.stats.invalid_key_count += 1;
                self.report(&inner.stats, AccessKind::InvalidKey);
                return AccessResult::InvalidKey;
            }
        }
        let now = self.clock.now();
        let result = match inner.store.get(key, now) {
            Some(elem) => match &elem.payload {
                Some(p) => {
                    inner.stats.non_null_hit_count += 1;
                    (AccessResult::HitNonNull(p.clone()), AccessKind::HitNonNull)
                }
                None => {
                    inner.stats.null_hit_count += 1;
                    (AccessResult::HitNull, AccessKind::HitNull)
                }
            },
            None => {
                inner.stats.miss_count += 1;
                (AccessResult::Miss, AccessKind::Miss)
            }
        };
        self.report(&inner.stats, result.1);
        result.0
    }

    fn report(&self, stats: &CacheStats, kind: AccessKind) {
        if let Some(report) = &self.config.statistics_report {
            report(stats, kind);
        }
    }

    /// Insert `key` with an explicit payload (`Some`) or a null/"negative cache" entry
    /// (`None`).
    pub fn set(&self, key: K, payload: Option<P>, priority: Priority, ttl_override: Option<Duration>) -> Result<(), CacheError> {
        if self.config.memory_limit.count == 0 {
            return Err(CacheError::Rejected);
        }
        if let Some(validator) = &self.config.key_validator {
            if !validator(&key) {
                return Err(CacheError::Rejected);
            }
        }

        let now = self.clock.now();
        let cost = self.cost_of(&payload);
        let base_ttl = ttl_override.unwrap_or(if payload.is_some() { self.config.default_ttl } else { self.config.default_ttl_for_null });
        let effective_ttl = self.jittered_ttl(base_ttl);

        let mut inner = self.inner.lock();
        loop {
            let exists = inner.store.contains_key(&key);
            let old_cost = if exists { inner.store.peek(&key).map(|e| e.cost).unwrap_or(0) } else { 0 };
            let projected_cost = inner.total_cost - old_cost + cost;
            let projected_count = inner.store.len() + if exists { 0 } else { 1 };
            let fits = projected_cost <= self.config.memory_limit.memory_bytes && projected_count <= self.config.memory_limit.count;
            if fits {
                break;
            }
            let expired = inner.store.remove_expired(now);
            if !expired.is_empty() {
                for (_, elem) in expired {
                    inner.total_cost -= elem.cost;
                }
                continue;
            }
            match inner.store.remove_lru() {
                Some((_, elem)) => inner.total_cost -= elem.cost,
                None => return Err(CacheError::TooLarge),
            }
        }

        let element = StoredElement { payload, cost };
        match inner.store.set(key, element, priority, effective_ttl, now) {
            SetOutcome::Inserted => {
                inner.total_cost += cost;
                Ok(())
            }
            SetOutcome::Evicted(_, old) => {
                inner.total_cost = inner.total_cost + cost - old.cost;
                Ok(())
            }
            SetOutcome::Rejected(_, _) => Err(CacheError::TooLarge),
        }
    }

    pub fn remove(&self, key: &K) {
        let mut inner = self.inner.lock();
        if let Some(elem) = inner.store.remove(key) {
            inner.total_cost -= elem.cost;
        }
    }
}

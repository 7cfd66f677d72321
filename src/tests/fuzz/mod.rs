//! Randomized operation sequences against the cache and the pending-task queue, asserting
//! only that nothing panics and the structures stay internally consistent. Not a substitute
//! for the targeted unit tests colocated with each module — this just hammers combinations
//! those tests don't think to try.
//!
//! Run as regular `#[test]`s; no `cargo fuzz` harness required.

use std::time::Duration;

use rand::Rng;

use crate::cache::{CacheConfig, MemoryCache, MemoryLimit};
use crate::hash_queue::{EvictionPolicy, HashQueue};
use crate::priority::Priority;

#[test]
fn random_cache_operations_never_panic_and_respect_the_memory_limit() {
    let mut rng = rand::thread_rng();
    let config = CacheConfig::<u32, Vec<u8>>::default()
        .with_memory_limit(MemoryLimit { count: 32, memory_bytes: usize::MAX })
        .with_ttl_jitter_range(Duration::from_millis(5));
    let cache = MemoryCache::new(config);

    for _ in 0..5_000 {
        let key: u32 = rng.gen_range(0..64);
        match rng.gen_range(0..4) {
            0 => {
                let payload: Vec<u8> = (0..rng.gen_range(0..8)).map(|_| rng.gen()).collect();
                let priority = Priority::new(rng.gen_range(-10.0..10.0)).unwrap();
                let ttl = Duration::from_millis(rng.gen_range(0..20));
                let _ = cache.set(key, Some(payload), priority, Some(ttl));
            }
            1 => {
                let priority = Priority::new(rng.gen_range(-10.0..10.0)).unwrap();
                let _ = cache.set(key, None, priority, None);
            }
            2 => {
                let _ = cache.get(&key);
            }
            _ => cache.remove(&key),
        }
        assert!(cache.len() <= 32);
    }
}

#[test]
fn random_queue_enqueue_dequeue_never_panics_and_stays_within_capacity() {
    let mut rng = rand::thread_rng();
    let mut queue = HashQueue::<u32>::new(16);

    for _ in 0..5_000 {
        let key: u32 = rng.gen_range(0..64);
        match rng.gen_range(0..3) {
            0 => {
                let policy = if rng.gen_bool(0.5) { EvictionPolicy::EvictOldest } else { EvictionPolicy::RejectNewest };
                let _ = queue.enqueue(key, policy);
            }
            1 => {
                let _ = queue.dequeue_front();
            }
            _ => {
                let _ = queue.dequeue_back();
            }
        }
        assert!(queue.len() <= 16);
    }
}

//! TTL + priority + LRU composite store: combines the TTL min-heap (keyed on
//! expiration) with the priority-tiered LRU (keyed on priority) into one structure that
//! evicts expired entries first, then the lowest-priority LRU entry.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Instant;

use crate::collections::heap::{CompareResult, HeapEvent, IndexedHeap, InsertOutcome};
use crate::collections::priority_lru::{PriorityLru, SetResult};
use crate::priority::Priority;

#[derive(Clone)]
struct TtlEntry<K> {
    key: K,
    expiration: Instant,
}

fn ttl_cmp<K>(a: &TtlEntry<K>, b: &TtlEntry<K>) -> CompareResult {
    CompareResult::from_std(a.expiration.cmp(&b.expiration))
}

pub enum SetOutcome<K, V> {
    Inserted,
    Evicted(K, V),
    Rejected(K, V),
}

pub struct TtlPriorityLruStore<K, V> {
    priority_lru: PriorityLru<K, V>,
    ttl_heap: IndexedHeap<TtlEntry<K>, fn(&TtlEntry<K>, &TtlEntry<K>) -> CompareResult>,
    ttl_index: HashMap<K, usize>,
}

impl<K, V> TtlPriorityLruStore<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            priority_lru: PriorityLru::new(capacity),
            ttl_heap: IndexedHeap::new(capacity, ttl_cmp),
            ttl_index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.priority_lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.priority_lru.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.priority_lru.capacity()
    }

    /// Look up `key`, treating an expired entry as absent and removing it. Returns `None`
    /// both for never-stored keys and for expired ones.
    pub fn get(&mut self, key: &K, now: Instant) -> Option<&V> {
        let idx = *self.ttl_index.get(key)?;
        let expired = self.ttl_heap.get(idx).map(|e| e.expiration <= now).unwrap_or(true);
        if expired {
            self.remove(key);
            return None;
        }
        self.priority_lru.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.ttl_index.contains_key(key)
    }

    /// Non-mutating lookup: no LRU promotion, no expiry check. Used for cost bookkeeping
    /// where the caller is about to overwrite or evict the entry anyway.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.priority_lru.peek(key)
    }

    pub fn set(&mut self, key: K, value: V, priority: Priority, ttl: std::time::Duration, now: Instant) -> SetOutcome<K, V> {
        if self.contains_key(&key) {
            self.remove(&key);
        }

        let root_already_expired = self.ttl_heap.peek().map(|e| e.expiration <= now).unwrap_or(false);
        let new_entry = TtlEntry { key: key.clone(), expiration: now + ttl };

        if root_already_expired {
            return self.set_via_ttl_path(key, value, priority, new_entry);
        }
        self.set_via_priority_path(key, value, priority, new_entry)
    }

    fn set_via_ttl_path(&mut self, key: K, value: V, priority: Priority, new_entry: TtlEntry<K>) -> SetOutcome<K, V> {
        match self.ttl_heap.insert(new_entry, true) {
            InsertOutcome::Rejected(entry) => SetOutcome::Rejected(entry.key, value),
            InsertOutcome::Accepted(events) => {
                self.apply_ttl_events(events);
                self.priority_lru_insert_fresh(key, value, priority);
                SetOutcome::Inserted
            }
            InsertOutcome::Displaced(displaced, events) => {
                self.apply_ttl_events(events);
                let evicted_value = self.priority_lru.remove(&displaced.key);
                self.priority_lru_insert_fresh(key, value, priority);
                match evicted_value {
                    Some(v) => SetOutcome::Evicted(displaced.key, v),
                    None => SetOutcome::Inserted,
                }
            }
        }
    }

    fn set_via_priority_path(&mut self, key: K, value: V, priority: Priority, new_entry: TtlEntry<K>) -> SetOutcome<K, V> {
        match self.priority_lru.set(key, value, priority) {
            SetResult::Inserted => {
                self.ttl_heap_insert_fresh(new_entry);
                SetOutcome::Inserted
            }
            SetResult::Replaced(_) => unreachable!("set() removes existing keys before reaching the priority path"),
            SetResult::Evicted(evicted_key, evicted_value) => {
                self.remove_ttl_entry(&evicted_key);
                self.ttl_heap_insert_fresh(new_entry);
                SetOutcome::Evicted(evicted_key, evicted_value)
            }
            SetResult::Rejected(k, v) => SetOutcome::Rejected(k, v),
        }
    }

    fn priority_lru_insert_fresh(&mut self, key: K, value: V, priority: Priority) {
        // The TTL path only runs when the TTL heap had room to force a displacement of the
        // (already expired) root, which guarantees the priority tree has room for the new key
        // too, since both structures are capacity-aligned 1:1 with stored keys.
        if let SetResult::Rejected(_, _) = self.priority_lru.set(key, value, priority) {
            unreachable!("priority structure out of room despite a freed TTL slot");
        }
    }

    fn ttl_heap_insert_fresh(&mut self, entry: TtlEntry<K>) {
        match self.ttl_heap.insert(entry, false) {
            InsertOutcome::Accepted(events) => self.apply_ttl_events(events),
            InsertOutcome::Displaced(_, _) | InsertOutcome::Rejected(_) => {
                unreachable!("TTL heap out of room despite a freed priority slot")
            }
        }
    }

    /// Explicit removal by key (also used for expiry and priority-eviction cleanup).
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.remove_ttl_entry(key);
        self.priority_lru.remove(key)
    }

    /// Drain every entry whose expiration is at or before `now`, returning each removed
    /// key/value pair so the caller can reconcile any auxiliary accounting (e.g. cost totals).
    pub fn remove_expired(&mut self, now: Instant) -> Vec<(K, V)> {
        let mut removed = Vec::new();
        loop {
            let expired_key = match self.ttl_heap.peek() {
                Some(entry) if entry.expiration <= now => entry.key.clone(),
                _ => break,
            };
            if let Some(value) = self.remove(&expired_key) {
                removed.push((expired_key, value));
            }
        }
        removed
    }

    /// Evict the globally least-recently-used entry from the lowest occupied priority tier.
    pub fn remove_lru(&mut self) -> Option<(K, V)> {
        let (key, value) = self.priority_lru.remove_lru()?;
        self.remove_ttl_entry(&key);
        Some((key, value))
    }

    fn remove_ttl_entry(&mut self, key: &K) {
        if let Some(idx) = self.ttl_index.remove(key) {
            if let Some((_, events)) = self.ttl_heap.remove_at(idx) {
                self.apply_ttl_events(events);
            }
        }
    }

    fn apply_ttl_events(&mut self, events: Vec<HeapEvent<TtlEntry<K>>>) {
        for event in events {
            match event {
                HeapEvent::Inserted(e, idx) | HeapEvent::Moved(e, idx) => {
                    self.ttl_index.insert(e.key, idx);
                }
                HeapEvent::Removed(e) => {
                    self.ttl_index.remove(&e.key);
                }
            }
        }
    }
}

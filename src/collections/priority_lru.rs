//! Priority-tiered LRU: one [`HashedLru`] per priority tier, plus a min-heap tracking
//! which priorities are currently occupied so the lowest-priority tier can be found in
//! O(log tiers) instead of scanning every tier on eviction.

use std::collections::HashMap;
use std::hash::Hash;

use crate::collections::heap::{CompareResult, HeapEvent, IndexedHeap};
use crate::collections::lru_list::HashedLru;
use crate::priority::Priority;

pub enum SetResult<K, V> {
    /// New key, room was available.
    Inserted,
    /// Existing key; its previous value and tier are returned.
    Replaced(V),
    /// New key, capacity was full; the returned key/value was evicted to make room.
    Evicted(K, V),
    /// New key, capacity was full, and its priority was lower than every occupied tier;
    /// the input is handed back unchanged.
    Rejected(K, V),
}

pub struct PriorityLru<K, V> {
    capacity: usize,
    len: usize,
    tiers: HashMap<Priority, HashedLru<K, V>>,
    priority_of: HashMap<K, Priority>,
    priority_heap: IndexedHeap<Priority, fn(&Priority, &Priority) -> CompareResult>,
    heap_index: HashMap<Priority, usize>,
}

fn min_heap_cmp(a: &Priority, b: &Priority) -> CompareResult {
    CompareResult::from_std(a.cmp(b))
}

impl<K, V> PriorityLru<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            len: 0,
            tiers: HashMap::new(),
            priority_of: HashMap::new(),
            priority_heap: IndexedHeap::new(capacity.max(1), min_heap_cmp),
            heap_index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.priority_of.contains_key(key)
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        let priority = *self.priority_of.get(key)?;
        self.tiers.get_mut(&priority)?.get(key)
    }

    pub fn peek(&self, key: &K) -> Option<&V> {
        let priority = *self.priority_of.get(key)?;
        self.tiers.get(&priority)?.peek(key)
    }

    pub fn set(&mut self, key: K, value: V, priority: Priority) -> SetResult<K, V> {
        if let Some(old_priority) = self.priority_of.get(&key).copied() {
            let old_value = self.tier_remove(&key, old_priority).expect("priority_of implies tier membership");
            self.tier_insert_front(key.clone(), value, priority);
            self.priority_of.insert(key, priority);
            return SetResult::Replaced(old_value);
        }

        if self.len < self.capacity {
            self.tier_insert_front(key.clone(), value, priority);
            self.priority_of.insert(key, priority);
            self.len += 1;
            return SetResult::Inserted;
        }

        let min_priority = match self.priority_heap.peek().copied() {
            Some(p) => p,
            None => return SetResult::Rejected(key, value),
        };
        if priority < min_priority {
            return SetResult::Rejected(key, value);
        }

        let (evicted_key, evicted_value) = {
            let tier = self.tiers.get_mut(&min_priority).expect("heap/tiers out of sync");
            let evicted = tier.pop_back().expect("non-empty tier tracked by heap");
            if tier.is_empty() {
                self.tiers.remove(&min_priority);
                self.remove_priority_from_heap(min_priority);
            }
            evicted
        };
        self.priority_of.remove(&evicted_key);
        self.tier_insert_front(key.clone(), value, priority);
        self.priority_of.insert(key, priority);
        SetResult::Evicted(evicted_key, evicted_value)
    }

    /// Explicit removal by key (used when a key is re-inserted, or removed for other reasons
    /// such as TTL expiry).
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let priority = self.priority_of.remove(key)?;
        let v = self.tier_remove(key, priority);
        if v.is_some() {
            self.len -= 1;
        }
        v
    }

    /// Pop the least-recently-used entry from the lowest occupied priority tier.
    pub fn remove_lru(&mut self) -> Option<(K, V)> {
        let min_priority = *self.priority_heap.peek()?;
        let tier = self.tiers.get_mut(&min_priority)?;
        let (k, v) = tier.pop_back()?;
        if tier.is_empty() {
            self.tiers.remove(&min_priority);
            self.remove_priority_from_heap(min_priority);
        }
        self.priority_of.remove(&k);
        self.len -= 1;
        Some((k, v))
    }

    fn tier_remove(&mut self, key: &K, priority: Priority) -> Option<V> {
        let tier = self.tiers.get_mut(&priority)?;
        let v = tier.remove(key);
        if tier.is_empty() {
            self.tiers.remove(&priority);
            self.remove_priority_from_heap(priority);
        }
        v
    }

    fn tier_insert_front(&mut self, key: K, value: V, priority: Priority) {
        let is_new_tier = !self.tiers.contains_key(&priority);
        let tier = self.tiers.entry(priority).or_insert_with(|| HashedLru::new(None));
        tier.set(key, value);
        if is_new_tier {
            self.insert_priority_into_heap(priority);
        }
    }

    fn insert_priority_into_heap(&mut self, priority: Priority) {
        use crate::collections::heap::InsertOutcome;
        match self.priority_heap.insert(priority, true) {
            InsertOutcome::Accepted(events) | InsertOutcome::Displaced(_, events) => {
                self.apply_heap_events(events);
            }
            InsertOutcome::Rejected(_) => {
                // Heap capacity tracks `capacity.max(1)` distinct tiers, which can never be
                // exceeded: at most one tier per stored key, and the key count is bounded by
                // `capacity`.
                unreachable!("priority heap capacity exceeded distinct-tier bound")
            }
        }
    }

    fn remove_priority_from_heap(&mut self, priority: Priority) {
        if let Some(&idx) = self.heap_index.get(&priority) {
            if let Some((_, events)) = self.priority_heap.remove_at(idx) {
                self.apply_heap_events(events);
            }
        }
    }

    fn apply_heap_events(&mut self, events: Vec<HeapEvent<Priority>>) {
        for event in events {
            match event {
                HeapEvent::Inserted(p, idx) | HeapEvent::Moved(p, idx) => {
                    self.heap_index.insert(p, idx);
                }
                HeapEvent::Removed(p) => {
                    self.heap_index.remove(&p);
                }
            }
        }
    }
}

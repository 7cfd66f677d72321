//! Generic fixed-capacity binary heap with index-tracking events.
//!
//! Array growth is allowed until `capacity`; past that, `insert` either rejects the new
//! element or forcibly displaces the root, per the caller's `force` flag. Every structural
//! change (push, swap, pop) is reported back as a [`HeapEvent`] so a caller composing this
//! heap with an external index (e.g. a per-key back-pointer) can keep that index consistent
//! without the heap needing to know anything about it — keeping the heap and any external
//! structure referencing its slots as two independent, index-stable structures instead of a
//! cycle of owning pointers.

use std::cmp::Ordering as StdOrdering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareResult {
    MoreTop,
    MoreBottom,
    Equal,
}

impl CompareResult {
    pub fn from_std(ord: StdOrdering) -> Self {
        match ord {
            StdOrdering::Less => CompareResult::MoreTop,
            StdOrdering::Greater => CompareResult::MoreBottom,
            StdOrdering::Equal => CompareResult::Equal,
        }
    }
}

/// A structural change to the heap's backing array, reported synchronously so external
/// indices can stay in sync.
#[derive(Debug, Clone)]
pub enum HeapEvent<T> {
    Inserted(T, usize),
    Removed(T),
    Moved(T, usize),
}

pub enum InsertOutcome<T> {
    /// The element was accepted without displacing anything.
    Accepted(Vec<HeapEvent<T>>),
    /// The heap was full and the previous root was evicted to make room.
    Displaced(T, Vec<HeapEvent<T>>),
    /// The heap was full and the new element did not qualify for admission; returned unchanged.
    Rejected(T),
}

/// A binary heap over `T`, ordered by the caller-supplied comparator. `MoreTop` sorts
/// towards index 0 (the root).
pub struct IndexedHeap<T, C> {
    capacity: usize,
    items: Vec<T>,
    compare: C,
}

impl<T, C> IndexedHeap<T, C>
where
    T: Clone,
    C: Fn(&T, &T) -> CompareResult,
{
    pub fn new(capacity: usize, compare: C) -> Self {
        Self { capacity, items: Vec::new(), compare }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.first()
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        self.items.get(idx)
    }

    fn cmp(&self, a: &T, b: &T) -> CompareResult {
        (self.compare)(a, b)
    }

    /// Insert `item`. See module docs for the full contract.
    pub fn insert(&mut self, item: T, force: bool) -> InsertOutcome<T> {
        if self.capacity == 0 {
            return InsertOutcome::Rejected(item);
        }
        if !self.is_full() {
            let idx = self.items.len();
            self.items.push(item.clone());
            let mut events = vec![HeapEvent::Inserted(item, idx)];
            events.extend(self.sift_up(idx));
            return InsertOutcome::Accepted(events);
        }

        let root = self.items[0].clone();
        if force {
            if matches!(self.cmp(&item, &root), CompareResult::MoreTop) {
                return InsertOutcome::Rejected(item);
            }
        } else if !matches!(self.cmp(&item, &root), CompareResult::MoreBottom) {
            return InsertOutcome::Rejected(item);
        }

        self.items[0] = item.clone();
        let mut events = vec![HeapEvent::Removed(root.clone()), HeapEvent::Moved(item, 0)];
        events.extend(self.sift_down(0));
        InsertOutcome::Displaced(root, events)
    }

    /// Remove the element at `index` (default is the root, index 0).
    pub fn remove_at(&mut self, index: usize) -> Option<(T, Vec<HeapEvent<T>>)> {
        if index >= self.items.len() {
            return None;
        }
        let removed = self.items[index].clone();
        let last = self.items.len() - 1;
        let mut events = vec![HeapEvent::Removed(removed.clone())];
        if index == last {
            self.items.pop();
            return Some((removed, events));
        }
        let moved = self.items.pop().unwrap();
        self.items[index] = moved.clone();
        events.push(HeapEvent::Moved(moved, index));
        events.extend(self.sift_up(index));
        events.extend(self.sift_down(index));
        Some((removed, events))
    }

    pub fn remove_root(&mut self) -> Option<(T, Vec<HeapEvent<T>>)> {
        self.remove_at(0)
    }

    fn sift_up(&mut self, mut idx: usize) -> Vec<HeapEvent<T>> {
        let mut events = Vec::new();
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if matches!(self.cmp(&self.items[idx], &self.items[parent]), CompareResult::MoreTop) {
                self.items.swap(idx, parent);
                events.push(HeapEvent::Moved(self.items[parent].clone(), parent));
                events.push(HeapEvent::Moved(self.items[idx].clone(), idx));
                idx = parent;
            } else {
                break;
            }
        }
        events
    }

    fn sift_down(&mut self, mut idx: usize) -> Vec<HeapEvent<T>> {
        let mut events = Vec::new();
        let len = self.items.len();
        loop {
            let left = 2 * idx + 1;
            let right = 2 * idx + 2;
            let mut top = idx;
            if left < len && matches!(self.cmp(&self.items[left], &self.items[top]), CompareResult::MoreTop) {
                top = left;
            }
            if right < len && matches!(self.cmp(&self.items[right], &self.items[top]), CompareResult::MoreTop) {
                top = right;
            }
            if top == idx {
                break;
            }
            self.items.swap(idx, top);
            events.push(HeapEvent::Moved(self.items[idx].clone(), idx));
            events.push(HeapEvent::Moved(self.items[top].clone(), top));
            idx = top;
        }
        events
    }
}

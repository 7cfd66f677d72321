//! Monotonic timestamp source used for TTL comparisons across the cache and scheduler.
//!
//! `std::time::Instant` is wall-clock-free (it never goes backwards), which is exactly
//! what every expiration comparison in this crate needs. The `Clock` trait exists purely
//! so tests can swap in a `ManualClock` and assert TTL boundaries deterministically instead
//! of sleeping real milliseconds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A source of monotonic instants.
///
/// Implementors must never return a value earlier than a previously returned value.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// Production clock backed by `Instant::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Test double that advances only when told to. Useful for asserting TTL boundaries
/// without sleeping real wall-clock time.
pub struct ManualClock {
    base: Instant,
    offset_millis: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self { base: Instant::now(), offset_millis: AtomicU64::new(0) }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_millis.load(Ordering::SeqCst))
    }
}

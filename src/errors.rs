//! Public error surfaces: one `thiserror`-derived enum per component boundary.

use thiserror::Error;

/// Errors surfaced by [`crate::cache::MemoryCache::set`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// `memoryLimit` is zero (cache disabled) or the key failed the configured validator.
    #[error("key rejected: cache disabled or key invalid")]
    Rejected,
    /// The element could not be admitted even after evicting every lower-priority entry.
    #[error("element too large to admit under current memory/count limits")]
    TooLarge,
}

/// Terminal outcome surfaced to every waiter of a [`crate::manager::KVLightTasksManager`] fetch.
///
/// `E` is the caller's own provider error type. Cloneable so one outcome can be fanned
/// out to N waiters without re-deriving it N times.
#[derive(Debug, Clone, Error)]
pub enum TaskError<E> {
    /// The data provider failed on every attempt permitted by the retry policy.
    #[error("provider failed after exhausting retries: {0}")]
    Provider(E),
    /// The key was displaced from, or refused admission to, the pending queue before a
    /// worker could service it.
    #[error("evicted by priority strategy before a worker became available")]
    EvictedByPriorityStrategy,
}

/// Terminal outcome surfaced by [`crate::mono_task::MonoTask`].
#[derive(Debug, Clone, Error)]
pub enum MonoTaskError<E> {
    /// The user-supplied block failed on every attempt permitted by the retry policy.
    #[error("execution failed after exhausting retries: {0}")]
    Provider(E),
    /// `clear_result(ClearStrategy::Cancel)` was called while this waiter was registered.
    #[error("execution cancelled due to clear_result(Cancel)")]
    Cancelled,
}

//! Single-instance coalescing executor: caches one result with a TTL, merges
//! concurrent callers into the in-flight attempt, retries on failure, and supports
//! cancel/restart/allow-completion invalidation. Shares its coalescing and retry shape
//! with [`crate::manager::KVLightTasksManager`] but owns exactly one logical key.
//!
//! Built around a single-entry lock-with-waiters pattern, generalized to also hold a
//! cached payload and an execution-id generation counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::errors::MonoTaskError;
use crate::retry::RetryPolicy;

/// The user-supplied unit of work a [`MonoTask`] coalesces and caches.
#[async_trait]
pub trait MonoTaskBody<P, E>: Send + Sync {
    async fn run(&self) -> Result<P, E>;
}

/// Blanket impl so a plain async closure can be passed to [`MonoTask::new`] without an
/// explicit trait impl.
#[async_trait]
impl<P, E, F, Fut> MonoTaskBody<P, E> for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<P, E>> + Send,
{
    async fn run(&self) -> Result<P, E> {
        (self)().await
    }
}

/// How [`MonoTask::clear_result`] treats an in-flight execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearStrategy {
    /// Bump the execution id so the in-flight result is discarded when it arrives, and
    /// fail every currently-registered waiter with [`MonoTaskError::Cancelled`].
    Cancel,
    /// Clear the cached result and start a fresh execution, but let any execution
    /// already in flight complete into the void (its result is discarded, waiters are
    /// *not* notified of cancellation — they ride along with the fresh execution).
    Restart,
    /// Clear the cached result only; an in-flight execution keeps running and still
    /// completes its registered waiters normally.
    AllowCompletion,
}

type Waiter<P, E> = Box<dyn FnOnce(Result<P, MonoTaskError<E>>) + Send>;

struct Cached<P> {
    payload: P,
    expires_at: Instant,
}

enum State<P, E> {
    Idle(Option<Cached<P>>),
    Executing { exec_id: u64, waiters: Vec<Waiter<P, E>> },
}

pub struct MonoTask<P, E> {
    body: Arc<dyn MonoTaskBody<P, E> + Send + Sync>,
    clock: Arc<dyn Clock>,
    retry_policy: RetryPolicy,
    expire_duration: Duration,
    next_exec_id: AtomicU64,
    state: Mutex<State<P, E>>,
}

impl<P, E> MonoTask<P, E>
where
    P: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new<B>(body: B, retry_policy: RetryPolicy, expire_duration: Duration) -> Arc<Self>
    where
        B: MonoTaskBody<P, E> + Send + Sync + 'static,
    {
        Self::with_clock(body, retry_policy, expire_duration, Arc::new(SystemClock))
    }

    pub fn with_clock<B>(body: B, retry_policy: RetryPolicy, expire_duration: Duration, clock: Arc<dyn Clock>) -> Arc<Self>
    where
        B: MonoTaskBody<P, E> + Send + Sync + 'static,
    {
        Arc::new(Self {
            body: Arc::new(body),
            clock,
            retry_policy,
            expire_duration,
            next_exec_id: AtomicU64::new(1),
            state: Mutex::new(State::Idle(None)),
        })
    }

    /// The cached result iff it has not yet expired. Clears a stale cache as a side effect.
    pub fn current_result(&self) -> Option<P> {
        let mut state = self.state.lock();
        if let State::Idle(Some(cached)) = &*state {
            if self.clock.now() < cached.expires_at {
                return Some(cached.payload.clone());
            }
        }
        if matches!(&*state, State::Idle(Some(_))) {
            *state = State::Idle(None);
        }
        None
    }

    /// Register `callback` for the result of this task.
    pub fn execute<F>(self: &Arc<Self>, callback: F, force_update: bool)
    where
        F: FnOnce(Result<P, MonoTaskError<E>>) + Send + 'static,
    {
        let mut state = self.state.lock();
        if !force_update {
            if let State::Idle(Some(cached)) = &*state {
                if self.clock.now() < cached.expires_at {
                    let payload = cached.payload.clone();
                    drop(state);
                    callback(Ok(payload));
                    return;
                }
            }
        }

        match &mut *state {
            State::Executing { waiters, .. } => {
                waiters.push(Box::new(callback));
            }
            State::Idle(_) => {
                let exec_id = self.next_exec_id.fetch_add(1, Ordering::SeqCst);
                *state = State::Executing { exec_id, waiters: vec![Box::new(callback)] };
                drop(state);
                self.spawn_attempt(exec_id, self.retry_policy);
            }
        }
    }

    /// `async fn` sugar over [`execute`](Self::execute): a thin adapter, not a
    /// new scheduling path. A dropped future simply leaves its oneshot receiver unpolled;
    /// the underlying execution is unaffected.
    pub async fn execute_async(self: &Arc<Self>, force_update: bool) -> Result<P, MonoTaskError<E>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.execute(
            move |result| {
                let _ = tx.send(result);
            },
            force_update,
        );
        rx.await.unwrap_or(Err(MonoTaskError::Cancelled))
    }

    fn spawn_attempt(self: &Arc<Self>, exec_id: u64, retry_policy: RetryPolicy) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_attempt(exec_id, retry_policy).await;
        });
    }

    async fn run_attempt(self: Arc<Self>, exec_id: u64, mut retry_policy: RetryPolicy) {
        loop {
            let outcome = self.body.run().await;
            match outcome {
                Ok(payload) => {
                    self.complete(exec_id, Ok(payload));
                    return;
                }
                Err(err) => {
                    if !retry_policy.should_retry() {
                        warn!(exec_id, "mono-task exhausted retries");
                        self.complete(exec_id, Err(err));
                        return;
                    }
                    let delay = retry_policy.time_interval();
                    retry_policy = retry_policy.next();
                    debug!(exec_id, delay_ms = delay.as_millis() as u64, "mono-task attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    if !self.exec_id_still_live(exec_id) {
                        return;
                    }
                }
            }
        }
    }

    fn exec_id_still_live(&self, exec_id: u64) -> bool {
        matches!(&*self.state.lock(), State::Executing { exec_id: current, .. } if *current == exec_id)
    }

    fn complete(&self, exec_id: u64, outcome: Result<P, E>) {
        let waiters = {
            let mut state = self.state.lock();
            let still_live = matches!(&*state, State::Executing { exec_id: current, .. } if *current == exec_id);
            if !still_live {
                // This attempt was cancelled or superseded; discard silently.
                return;
            }
            let waiters = match std::mem::replace(&mut *state, State::Idle(None)) {
                State::Executing { waiters, .. } => waiters,
                State::Idle(_) => Vec::new(),
            };
            if let Ok(payload) = &outcome {
                *state = State::Idle(Some(Cached { payload: payload.clone(), expires_at: self.clock.now() + self.expire_duration }));
            }
            waiters
        };

        let result: Result<P, MonoTaskError<E>> = outcome.map_err(MonoTaskError::Provider);
        for waiter in waiters {
            waiter(result.clone());
        }
    }

    /// Invalidate the cached/in-flight result per `strategy`. See [`ClearStrategy`].
    pub fn clear_result(self: &Arc<Self>, strategy: ClearStrategy) {
        let mut state = self.state.lock();
        match strategy {
            ClearStrategy::Cancel => {
                let old = std::mem::replace(&mut *state, State::Idle(None));
                if let State::Executing { waiters, .. } = old {
                    drop(state);
                    for waiter in waiters {
                        waiter(Err(MonoTaskError::Cancelled));
                    }
                }
            }
            ClearStrategy::Restart => match &mut *state {
                State::Idle(cached) => {
                    *cached = None;
                }
                State::Executing { waiters, .. } => {
                    // Bump exec id so the in-flight attempt's own completion is discarded,
                    // but keep waiters: the fresh attempt will fan out to them.
                    let exec_id = self.next_exec_id.fetch_add(1, Ordering::SeqCst);
                    let carried_waiters = std::mem::take(waiters);
                    *state = State::Executing { exec_id, waiters: carried_waiters };
                    drop(state);
                    self.spawn_attempt(exec_id, self.retry_policy);
                }
            },
            ClearStrategy::AllowCompletion => {
                if let State::Idle(cached) = &mut *state {
                    *cached = None;
                }
            }
        }
    }
}

//! Single callback execution context
//!
//! Every handler invocation and every timer expiry runs on one worker task
//! draining an unbounded queue, so handlers never run concurrently with each
//! other. Delayed tasks carry their own cancellation token.

use crate::error::{CentralError, CentralResult};
use dashmap::DashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Unit of work run on the executor
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Identifier of a pending delayed task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl TimerId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// Serializing executor for handler invocations and timers
pub trait CallbackExecutor: Send + Sync {
    /// Queue a task behind everything already posted
    fn post(&self, task: Task);

    /// Queue a task once `delay` has elapsed, unless cancelled first
    fn post_delayed(&self, delay: Duration, task: Task) -> TimerId;

    /// Cancel a pending delayed task. Returns false if it already fired or
    /// was cancelled.
    fn cancel(&self, timer: TimerId) -> bool;

    fn cancel_all(&self);
}

/// Default executor: one tokio task draining an mpsc queue
pub struct QueueExecutor {
    tx: mpsc::UnboundedSender<Task>,
    timers: Arc<DashMap<TimerId, CancellationToken>>,
    next_timer: AtomicU64,
    runtime: Handle,
}

impl QueueExecutor {
    /// Start the worker on the current tokio runtime
    pub fn spawn() -> CentralResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| CentralError::Config(format!("no tokio runtime available: {}", e)))?;
        Ok(Self::spawn_on(runtime))
    }

    /// Start the worker on the given runtime
    pub fn spawn_on(runtime: Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();

        runtime.spawn(async move {
            debug!("Callback executor started");
            while let Some(task) = rx.recv().await {
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!("Handler panicked on callback executor");
                }
            }
            debug!("Callback executor stopped");
        });

        Self {
            tx,
            timers: Arc::new(DashMap::new()),
            next_timer: AtomicU64::new(1),
            runtime,
        }
    }

    /// Number of delayed tasks still pending
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }
}

impl CallbackExecutor for QueueExecutor {
    fn post(&self, task: Task) {
        if self.tx.send(task).is_err() {
            debug!("Callback executor closed, dropping task");
        }
    }

    fn post_delayed(&self, delay: Duration, task: Task) -> TimerId {
        let id = TimerId(self.next_timer.fetch_add(1, Ordering::Relaxed));
        let token = CancellationToken::new();
        self.timers.insert(id, token.clone());

        let timers = Arc::clone(&self.timers);
        let tx = self.tx.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    // Whoever removes the entry first owns the timer
                    if timers.remove(&id).is_some() && tx.send(task).is_err() {
                        debug!("Callback executor closed, dropping {}", id);
                    }
                }
            }
        });

        id
    }

    fn cancel(&self, timer: TimerId) -> bool {
        match self.timers.remove(&timer) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn cancel_all(&self) {
        self.timers.retain(|_, token| {
            token.cancel();
            false
        });
    }
}

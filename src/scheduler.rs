//! Cooperative retry scheduler.
//!
//! Combines the circuit breaker, the backoff table and a single-threaded executor. Work submitted
//! through [`RetryScheduler::execute_with_retry`] becomes a task on a `futures` [`LocalPool`]; the
//! submitting call returns at once and nothing runs until the host calls
//! [`RetryScheduler::update`].
//!
//! Semantics:
//! - `max_retries` counts total invocations of the operation (initial try + retries).
//! - After failed attempt `n < max_retries` the task sleeps `delays[n]` of virtual time, which only
//!   advances through `update(dt)`; there is no blocking sleep anywhere.
//! - On success the breaker records a success, then `on_success` runs.
//! - On exhaustion the breaker records exactly one failure for the whole task (not one per
//!   attempt), then `on_failure` runs once with the last error.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use courier::{RetryConfig, RetryScheduler, TaskContext};
//!
//! let scheduler = RetryScheduler::new(RetryConfig::default()).unwrap();
//! let handle = scheduler.execute_with_retry(
//!     || async { Ok::<_, String>(42) },
//!     TaskContext::new("doc"),
//!     |value| assert_eq!(value, 42),
//!     |err| panic!("unexpected failure: {err}"),
//! );
//! assert_eq!(handle.attempts(), 0); // nothing ran yet
//! scheduler.update(Duration::ZERO);
//! assert!(handle.is_finished());
//! ```

use crate::backoff::{Backoff, BackoffError, DelayTable};
use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
};
use crate::clock::Clock;
use crate::jitter::Jitter;
use crate::timer::TickTimer;
use futures::executor::{LocalPool, LocalSpawner};
use futures::task::LocalSpawnExt;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

/// Retry and breaker settings for one scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total invocations per task (initial + retries). Must be > 0.
    pub max_retries: usize,
    /// Wait after the first failed attempt; doubles for each later one.
    pub retry_delay: Duration,
    /// Optional ceiling on any single wait.
    pub max_retry_delay: Option<Duration>,
    /// How long the breaker stays open before allowing a probe.
    pub reset_timeout: Duration,
    /// Consecutive exhausted tasks that open the breaker.
    pub failure_threshold: usize,
    pub jitter: Jitter,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            max_retry_delay: None,
            reset_timeout: Duration::from_secs(60),
            failure_threshold: 3,
            jitter: Jitter::None,
        }
    }
}

/// Errors produced while building a scheduler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// `max_retries` must be > 0.
    #[error("max_retries must be > 0 (got {0})")]
    InvalidMaxRetries(usize),
    #[error(transparent)]
    Breaker(#[from] CircuitBreakerError),
    #[error(transparent)]
    Backoff(#[from] BackoffError),
}

/// Free-form key/value context attached to a task for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskContext {
    operation: String,
    fields: BTreeMap<String, String>,
}

impl TaskContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self { operation: operation.into(), fields: BTreeMap::new() }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.fields.insert(key.into(), value.to_string());
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

impl fmt::Display for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.operation)?;
        for (key, value) in &self.fields {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}

/// Terminal state of a task, as seen through its handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TaskOutcome {
    #[default]
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Default)]
struct TaskProgress {
    attempts: Cell<usize>,
    waited: Cell<Duration>,
    outcome: Cell<TaskOutcome>,
}

/// Read-only view of a submitted task. Dropping it does not cancel the task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    progress: Rc<TaskProgress>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Invocations of the operation so far.
    pub fn attempts(&self) -> usize {
        self.progress.attempts.get()
    }

    /// Virtual time the task has spent waiting between attempts.
    pub fn total_wait(&self) -> Duration {
        self.progress.waited.get()
    }

    pub fn outcome(&self) -> TaskOutcome {
        self.progress.outcome.get()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome() != TaskOutcome::Pending
    }
}

/// Breaker and executor state for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub state: CircuitState,
    pub is_open: bool,
    pub is_half_open: bool,
    pub failure_count: usize,
    pub consecutive_failures: usize,
    pub active_tasks: usize,
    /// Whether an attempt would be permitted right now. Computed without side effects.
    pub can_attempt: bool,
    pub open_for: Option<Duration>,
}

struct ActiveGuard(Rc<Cell<usize>>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

/// Breaker + backoff + cooperative task execution. Not `Send`: it belongs to the host thread.
pub struct RetryScheduler {
    config: RetryConfig,
    delays: Rc<DelayTable>,
    breaker: Rc<CircuitBreaker>,
    timer: TickTimer,
    pool: RefCell<LocalPool>,
    spawner: LocalSpawner,
    active: Rc<Cell<usize>>,
    next_id: Cell<u64>,
}

impl fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("config", &self.config)
            .field("delays", &self.delays)
            .field("breaker", &self.breaker)
            .field("active_tasks", &self.active.get())
            .field("pool", &"<local pool>")
            .finish()
    }
}

impl RetryScheduler {
    /// Validate `config`, precompute the backoff table, and start with a closed breaker.
    pub fn new(config: RetryConfig) -> Result<Self, SchedulerError> {
        if config.max_retries == 0 {
            return Err(SchedulerError::InvalidMaxRetries(0));
        }
        let breaker_config =
            CircuitBreakerConfig::new(config.failure_threshold, config.reset_timeout)?;
        let mut backoff = Backoff::exponential(config.retry_delay);
        if let Some(max) = config.max_retry_delay {
            backoff = backoff.with_max(max)?;
        }
        let delays = backoff.table(config.max_retries);
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        Ok(Self {
            config,
            delays: Rc::new(delays),
            breaker: Rc::new(CircuitBreaker::new(breaker_config)),
            timer: TickTimer::new(),
            pool: RefCell::new(pool),
            spawner,
            active: Rc::new(Cell::new(0)),
            next_id: Cell::new(0),
        })
    }

    /// Override the breaker clock. Call before submitting work; the breaker restarts closed.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        let config = self.breaker.config().clone();
        self.breaker = Rc::new(CircuitBreaker::new(config).with_clock(clock));
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn delays(&self) -> &DelayTable {
        &self.delays
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Virtual time accumulated from `update(dt)` calls.
    pub fn now(&self) -> Duration {
        self.timer.now()
    }

    pub fn can_attempt(&self) -> bool {
        self.breaker.can_attempt()
    }

    pub fn record_success(&self) {
        self.breaker.record_success();
    }

    pub fn record_failure(&self) {
        self.breaker.record_failure();
    }

    /// Administrative override: close the breaker and zero its counters.
    pub fn reset(&self) {
        self.breaker.reset();
    }

    pub fn active_tasks(&self) -> usize {
        self.active.get()
    }

    /// Submit `operation` with retry semantics. Returns immediately; the first attempt runs on the
    /// next [`update`](Self::update).
    pub fn execute_with_retry<T, E, Op, Fut, S, F>(
        &self,
        mut operation: Op,
        context: TaskContext,
        on_success: S,
        on_failure: F,
    ) -> TaskHandle
    where
        T: 'static,
        E: fmt::Display + 'static,
        Op: FnMut() -> Fut + 'static,
        Fut: Future<Output = Result<T, E>> + 'static,
        S: FnOnce(T) + 'static,
        F: FnOnce(E) + 'static,
    {
        let handle = self.new_handle();
        let progress = Rc::clone(&handle.progress);
        let breaker = Rc::clone(&self.breaker);
        let delays = Rc::clone(&self.delays);
        let timer = self.timer.clone();
        let jitter = self.config.jitter;
        let max_retries = self.config.max_retries;
        let task_id = handle.id;

        let task = async move {
            loop {
                let attempt = progress.attempts.get() + 1;
                progress.attempts.set(attempt);
                match operation().await {
                    Ok(value) => {
                        breaker.record_success();
                        progress.outcome.set(TaskOutcome::Succeeded);
                        tracing::debug!(task = task_id, attempt, %context, "task succeeded");
                        on_success(value);
                        return;
                    }
                    Err(err) if attempt < max_retries => {
                        let delay = jitter.apply(delays.get(attempt));
                        tracing::warn!(
                            task = task_id,
                            attempt,
                            max_retries,
                            delay = ?delay,
                            error = %err,
                            %context,
                            "attempt failed; retrying after backoff"
                        );
                        let before = timer.now();
                        timer.sleep(delay).await;
                        progress.waited.set(progress.waited.get() + (timer.now() - before));
                    }
                    Err(err) => {
                        breaker.record_failure();
                        progress.outcome.set(TaskOutcome::Failed);
                        tracing::error!(
                            task = task_id,
                            attempts = attempt,
                            waited = ?progress.waited.get(),
                            error = %err,
                            %context,
                            "retries exhausted"
                        );
                        on_failure(err);
                        return;
                    }
                }
            }
        };
        self.spawn_tracked(task);
        handle
    }

    /// Run `future` once on the executor, without retries or breaker bookkeeping.
    pub fn spawn<Fut>(&self, context: TaskContext, future: Fut)
    where
        Fut: Future<Output = ()> + 'static,
    {
        tracing::trace!(%context, "spawning one-shot task");
        self.spawn_tracked(future);
    }

    /// Advance virtual time by `dt` and run every task that can make progress.
    ///
    /// Called from inside a task callback, this is a no-op.
    pub fn update(&self, dt: Duration) {
        let Ok(mut pool) = self.pool.try_borrow_mut() else {
            tracing::debug!("re-entrant scheduler update ignored");
            return;
        };
        self.timer.advance(dt);
        pool.run_until_stalled();
    }

    pub fn status(&self) -> SchedulerStatus {
        let snap = self.breaker.snapshot();
        SchedulerStatus {
            state: snap.state,
            is_open: snap.state == CircuitState::Open,
            is_half_open: snap.state == CircuitState::HalfOpen,
            failure_count: snap.failure_count,
            consecutive_failures: snap.consecutive_failures,
            active_tasks: self.active.get(),
            can_attempt: self.breaker.would_attempt(),
            open_for: snap.open_for,
        }
    }

    fn new_handle(&self) -> TaskHandle {
        let id = self.next_id.get();
        self.next_id.set(id.wrapping_add(1));
        TaskHandle { id, progress: Rc::new(TaskProgress::default()) }
    }

    fn spawn_tracked<Fut>(&self, task: Fut)
    where
        Fut: Future<Output = ()> + 'static,
    {
        self.active.set(self.active.get() + 1);
        let guard = ActiveGuard(Rc::clone(&self.active));
        let wrapped = async move {
            let _guard = guard;
            task.await;
        };
        if let Err(err) = self.spawner.spawn_local(wrapped) {
            tracing::error!(error = %err, "failed to spawn task on local executor");
        }
    }
}

//! Bounded-admission thread pool.
//!
//! This module provides [`Pool`], which combines an [`AdmissionGate`] with an
//! elastic set of worker threads. The two bounds are independent:
//!
//! - the gate caps how many tasks may be outstanding (queued or executing)
//!   at once, at `capacity + maximum`
//! - the workers cap how many tasks execute at once, at `maximum`
//!
//! Submitting blocks while every permit is held, providing backpressure
//! instead of unbounded queue growth.
//!
//! # Lifecycle
//!
//! ```text
//! Running ──shutdown()─────> ShuttingDown ──workers exit──> Terminated
//! Running ──shutdown_now()─> Stopping ──────workers exit──> Terminated
//! ShuttingDown ──shutdown_now()─> Stopping
//! ```
//!
//! Both shutdown paths close the admission gate, so submitters blocked
//! waiting for a permit are woken and see [`Error::Rejected`].
//!
//! # Example
//!
//! ```
//! use bounded_executor::{config::Config, Pool};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let config = Config::builder()
//!     .capacity(4).unwrap()
//!     .maximum(2).unwrap()
//!     .build().unwrap();
//! let pool = Pool::with_config(config).unwrap();
//! let done = Arc::new(AtomicUsize::new(0));
//!
//! for _ in 0..10 {
//!     let done = done.clone();
//!     // Blocks while 6 tasks are outstanding
//!     pool.submit(move || {
//!         done.fetch_add(1, Ordering::SeqCst);
//!     }).unwrap();
//! }
//!
//! pool.shutdown();
//! assert!(pool.await_termination(time::Duration::seconds(10)));
//! assert_eq!(done.load(Ordering::SeqCst), 10);
//! ```

use super::*;
use crate::admission::{self, AdmissionGate, Permit};
use crate::worker::Job;
use crate::worker_pool::WorkerPool;
use thiserror::Error;
use tracing::{debug, info};

#[cfg(feature = "instrument")]
use tracing::instrument;

/// A specialized `Result` type for pool operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors returned by [`Pool`] operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The pool has been shut down and no longer accepts tasks.
    #[error("The pool is shut down and no longer accepts tasks")]
    Rejected,

    /// A worker thread could not be started.
    #[error("Failed to start worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Why [`Pool::try_submit`] did not accept a task.
///
/// The task is handed back so that the caller may run it elsewhere.
#[derive(Error)]
pub enum TrySubmitError {
    /// Every admission permit is held.
    #[error("The pool is at capacity")]
    Full(Task),

    /// The pool has been shut down.
    #[error("The pool is shut down and no longer accepts tasks")]
    Rejected(Task),
}

impl TrySubmitError {
    /// Returns the task that was not submitted.
    pub fn into_inner(self) -> Task {
        match self {
            Self::Full(task) | Self::Rejected(task) => task,
        }
    }
}

impl core::fmt::Debug for TrySubmitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Rejected(_) => f.write_str("Rejected(..)"),
        }
    }
}

/// Lifecycle state of a [`Pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Accepting and running tasks.
    Running,
    /// [`Pool::shutdown`] was called; admitted tasks are still running.
    ShuttingDown,
    /// [`Pool::shutdown_now`] was called; running tasks have been signalled
    /// to stop.
    Stopping,
    /// No workers remain.
    Terminated,
}

/// Point-in-time pool statistics, see [`Pool::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Live worker threads.
    pub workers: usize,
    /// Workers waiting for a task.
    pub idle_workers: usize,
    /// Tasks currently executing.
    pub active_tasks: usize,
    /// Tasks queued but not yet picked up by a worker.
    pub queued_tasks: usize,
    /// Tasks holding an admission permit, queued or executing.
    pub outstanding_tasks: usize,
    /// Tasks that have finished, including those that panicked.
    pub completed_tasks: u64,
    /// Tasks that panicked.
    pub panicked_tasks: u64,
}

/// A thread pool that bounds the number of outstanding tasks.
///
/// See the [module documentation](self) for an overview.
///
/// Dropping the pool performs a graceful [`shutdown`](Pool::shutdown):
/// admitted tasks still run, but nothing waits for them.
pub struct Pool {
    config: Config,
    gate: AdmissionGate,
    workers: WorkerPool,
    cancel_token: CancellationToken,
}

impl Pool {
    /// Creates a pool, starting `config.minimum()` workers through `factory`.
    pub fn new(config: Config, factory: impl WorkerFactory + 'static) -> Result<Self> {
        metrics::describe_counter!(
            "executor_completed_tasks",
            metrics::Unit::Count,
            "Total number of tasks run to completion or panic"
        );
        metrics::describe_counter!(
            "executor_panicked_tasks",
            metrics::Unit::Count,
            "Total number of tasks that panicked"
        );
        metrics::describe_counter!(
            "executor_rejected_tasks",
            metrics::Unit::Count,
            "Total number of submissions rejected after shutdown"
        );
        metrics::describe_gauge!(
            "executor_workers",
            metrics::Unit::Count,
            "Number of live worker threads"
        );

        let permits = core::num::NonZeroUsize::new(config.permits())
            .unwrap_or(core::num::NonZeroUsize::MIN);
        let workers = WorkerPool::new(&config, Box::new(factory))?;

        debug!(
            "Pool started with {} permits and {}..={} workers",
            permits,
            config.minimum(),
            config.maximum()
        );

        Ok(Self {
            config,
            gate: AdmissionGate::new(permits),
            workers,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Creates a pool using the default [`NamedWorkers`] factory.
    pub fn with_config(config: Config) -> Result<Self> {
        Self::new(config, NamedWorkers::default())
    }

    /// Submits a task, blocking until an admission permit is available.
    ///
    /// Returns once the task is queued; the task's own outcome, including a
    /// panic, is never reported here. Fails with [`Error::Rejected`] if the
    /// pool is shut down before or while waiting.
    ///
    /// Must not be called from inside an async task, use
    /// [`submit_async`](Pool::submit_async) there.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let permit = self.gate.acquire().map_err(|_| self.rejected())?;
        self.dispatch(Box::new(task), permit)
    }

    /// Submits a task, waiting asynchronously for an admission permit.
    pub async fn submit_async<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let permit = self.gate.acquire_async().await.map_err(|_| self.rejected())?;
        self.dispatch(Box::new(task), permit)
    }

    /// Submits a task only if a permit is immediately available.
    pub fn try_submit<F>(&self, task: F) -> core::result::Result<(), TrySubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        let task: Task = Box::new(task);
        let permit = match self.gate.try_acquire() {
            Ok(permit) => permit,
            Err(admission::Error::Full) => return Err(TrySubmitError::Full(task)),
            Err(admission::Error::Closed) => {
                self.rejected();
                return Err(TrySubmitError::Rejected(task));
            }
        };

        self.workers
            .execute(Job::new(task, permit))
            .map_err(|job| {
                self.rejected();
                TrySubmitError::Rejected(job.into_task())
            })
    }

    fn dispatch(&self, task: Task, permit: Permit) -> Result<()> {
        // A rejected job is dropped here, returning its permit
        self.workers
            .execute(Job::new(task, permit))
            .map_err(|_| self.rejected())
    }

    fn rejected(&self) -> Error {
        debug!("Task rejected, pool is {:?}", self.state());
        metrics::counter!("executor_rejected_tasks").increment(1);
        Error::Rejected
    }

    /// Stops accepting tasks; admitted tasks run to completion.
    ///
    /// Submitters blocked waiting for a permit are woken with
    /// [`Error::Rejected`]. Does not wait, see
    /// [`await_termination`](Pool::await_termination). Calling this more than
    /// once has no further effect.
    #[cfg_attr(feature = "instrument", instrument(skip(self)))]
    pub fn shutdown(&self) {
        self.gate.close();
        if self.workers.shutdown() {
            info!(
                "Shutting down, {} admitted tasks still outstanding",
                self.gate.outstanding()
            );
        }
    }

    /// Stops accepting tasks, signals running tasks to stop and returns the
    /// tasks that were queued but never started.
    ///
    /// Running tasks are interrupted cooperatively through
    /// [`cancel_token`](Pool::cancel_token); a task that never checks it runs
    /// to completion. The returned tasks no longer hold admission permits.
    #[cfg_attr(feature = "instrument", instrument(skip(self)))]
    pub fn shutdown_now(&self) -> Vec<Task> {
        self.gate.close();
        let (changed, jobs) = self.workers.stop_now();

        // Only signal running tasks once nothing queued can start
        self.cancel_token.cancel();

        let tasks: Vec<Task> = jobs.into_iter().map(Job::into_task).collect();

        if changed {
            info!("Stopping, {} queued tasks were never started", tasks.len());
        }
        tasks
    }

    /// Blocks until the pool has terminated or `timeout` elapses.
    ///
    /// Returns `true` if termination was observed. A zero or negative
    /// timeout only checks the current state.
    #[cfg_attr(feature = "instrument", instrument(skip(self)))]
    pub fn await_termination(&self, timeout: time::Duration) -> bool {
        if !timeout.is_positive() {
            return self.is_terminated();
        }

        let timeout: std::time::Duration = timeout.try_into().unwrap_or(std::time::Duration::MAX);
        self.workers.await_termination(timeout)
    }

    /// `true` once shutdown has been requested but workers are still running.
    pub fn is_terminating(&self) -> bool {
        matches!(self.state(), State::ShuttingDown | State::Stopping)
    }

    /// `true` once shutdown has been requested and every worker has exited.
    pub fn is_terminated(&self) -> bool {
        self.state() == State::Terminated
    }

    pub fn state(&self) -> State {
        self.workers.state()
    }

    /// The token cancelled by [`shutdown_now`](Pool::shutdown_now).
    ///
    /// Long-running tasks should clone this and check it periodically.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Creates a child token that is cancelled along with the pool's token,
    /// but can also be cancelled independently.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Admission permits not currently held.
    pub fn available_permits(&self) -> usize {
        self.gate.available()
    }

    pub fn stats(&self) -> Stats {
        let counts = self.workers.counts();
        Stats {
            workers: counts.live,
            idle_workers: counts.idle,
            active_tasks: counts.active,
            queued_tasks: counts.queued,
            outstanding_tasks: self.gate.outstanding(),
            completed_tasks: counts.completed,
            panicked_tasks: counts.panicked,
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl core::fmt::Debug for Pool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("available_permits", &self.available_permits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn config(capacity: usize, minimum: usize, maximum: usize) -> Config {
        Config::builder()
            .capacity(capacity)
            .unwrap()
            .minimum(minimum)
            .unwrap()
            .maximum(maximum)
            .unwrap()
            .build()
            .unwrap()
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn runs_submitted_tasks() {
        let pool = Pool::with_config(config(4, 1, 2)).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let done = done.clone();
            pool.submit(move || {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown();
        assert!(pool.await_termination(time::Duration::seconds(5)));
        assert_eq!(done.load(Ordering::SeqCst), 50);
        assert_eq!(pool.stats().completed_tasks, 50);
        assert_eq!(pool.available_permits(), 6);
    }

    #[test]
    fn lifecycle_states() {
        let pool = Pool::with_config(Config::default()).unwrap();
        assert_eq!(pool.state(), State::Running);
        assert!(!pool.is_terminating());
        assert!(!pool.is_terminated());
        assert!(!pool.await_termination(time::Duration::ZERO));

        let (release, blocked) = flume::bounded::<()>(0);
        pool.submit(move || {
            let _ = blocked.recv();
        })
        .unwrap();

        pool.shutdown();
        assert_eq!(pool.state(), State::ShuttingDown);
        assert!(pool.is_terminating());
        assert!(!pool.await_termination(time::Duration::milliseconds(50)));

        // Idempotent
        pool.shutdown();
        assert_eq!(pool.state(), State::ShuttingDown);

        drop(release);
        assert!(pool.await_termination(time::Duration::seconds(5)));
        assert!(pool.is_terminated());
        assert!(!pool.is_terminating());
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let pool = Pool::with_config(config(2, 1, 1)).unwrap();
        pool.shutdown();

        assert!(matches!(pool.submit(|| {}), Err(Error::Rejected)));
        assert!(matches!(
            pool.try_submit(|| {}),
            Err(TrySubmitError::Rejected(_))
        ));
        assert_eq!(pool.available_permits(), 3);
    }

    #[test]
    fn try_submit_reports_full() {
        let pool = Pool::with_config(config(1, 1, 1)).unwrap();
        let (release, blocked) = flume::bounded::<()>(0);

        for _ in 0..2 {
            let blocked = blocked.clone();
            pool.try_submit(move || {
                let _ = blocked.recv();
            })
            .unwrap();
        }

        let (tx, rx) = flume::bounded(1);
        let err = pool.try_submit(move || tx.send(()).unwrap()).unwrap_err();
        assert!(matches!(err, TrySubmitError::Full(_)));

        // The caller gets the task back intact
        err.into_inner()();
        assert!(rx.try_recv().is_ok());

        drop(release);
        pool.shutdown();
        assert!(pool.await_termination(time::Duration::seconds(5)));
    }

    #[test]
    fn tasks_can_observe_cancellation() {
        let pool = Pool::with_config(Config::default()).unwrap();
        let token = pool.child_token();
        let (started_tx, started) = flume::bounded(1);

        pool.submit(move || {
            started_tx.send(()).unwrap();
            while !token.is_cancelled() {
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

        started.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(pool.shutdown_now().is_empty());
        assert!(matches!(pool.state(), State::Stopping | State::Terminated));
        assert!(pool.cancel_token().is_cancelled());
        assert!(pool.await_termination(time::Duration::seconds(5)));
    }

    #[test]
    fn shutdown_now_after_shutdown_returns_queued_tasks() {
        let pool = Pool::with_config(config(4, 1, 1)).unwrap();
        let (release, blocked) = flume::bounded::<()>(0);
        let (started_tx, started) = flume::bounded(1);
        let ran = Arc::new(AtomicUsize::new(0));

        pool.submit(move || {
            started_tx.send(()).unwrap();
            let _ = blocked.recv();
        })
        .unwrap();
        started.recv_timeout(Duration::from_secs(5)).unwrap();

        for _ in 0..3 {
            let ran = ran.clone();
            pool.submit(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown();
        assert_eq!(pool.state(), State::ShuttingDown);
        assert!(!pool.cancel_token().is_cancelled());

        let unstarted = pool.shutdown_now();
        assert_eq!(unstarted.len(), 3);
        assert_eq!(pool.state(), State::Stopping);
        assert!(pool.cancel_token().is_cancelled());
        assert_eq!(pool.available_permits(), 4);

        drop(release);
        assert!(pool.await_termination(time::Duration::seconds(5)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(pool.available_permits(), 5);
    }

    #[test]
    fn drop_shuts_down_gracefully() {
        let done = Arc::new(AtomicUsize::new(0));
        {
            let pool = Pool::with_config(config(8, 1, 1)).unwrap();
            for _ in 0..5 {
                let done = done.clone();
                pool.submit(move || {
                    std::thread::sleep(Duration::from_millis(2));
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }

        // Workers drain the queue after the pool handle is gone
        assert!(wait_for(|| done.load(Ordering::SeqCst) == 5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn submit_async_waits_for_permit() {
        let pool = Arc::new(Pool::with_config(config(1, 1, 1)).unwrap());
        let (release, blocked) = flume::bounded::<()>(0);

        for _ in 0..2 {
            let blocked = blocked.clone();
            pool.submit_async(move || {
                let _ = blocked.recv();
            })
            .await
            .unwrap();
        }
        assert_eq!(pool.available_permits(), 0);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit_async(|| {}).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(release);
        assert!(waiter.await.unwrap().is_ok());

        pool.shutdown();
        assert!(
            tokio::task::spawn_blocking(move || pool.await_termination(time::Duration::seconds(5)))
                .await
                .unwrap()
        );
    }
}

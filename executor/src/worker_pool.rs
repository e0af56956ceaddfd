//! Elastic set of worker threads fed by an unbounded queue.
//!
//! [`WorkerPool`] keeps at least `minimum` workers alive and starts more, up
//! to `maximum`, whenever queued jobs outnumber idle workers. Workers above
//! `minimum` that find no work within `keep_alive` retire.
//!
//! The queue itself is unbounded; the admission gate in front of it caps how
//! many jobs can ever be queued.
//!
//! # Accounting
//!
//! All bookkeeping lives in a single mutex-protected [`Inner`]:
//!
//! - `queued` counts jobs sent but not yet picked up by a worker
//! - `idle` counts workers waiting on the queue
//!
//! A worker decrements both in one critical section when it picks up a job,
//! so `queued > idle` is exactly "a job has no worker waiting for it". A
//! worker only retires while `queued == 0`, so a job can never be stranded by
//! a retiring worker.
//!
//! Picking a job off the channel and claiming it are two steps. Once the pool
//! is `Stopping`, a claim is refused and the job is parked in `Inner` for
//! [`WorkerPool::stop_now`], which waits for `queued` to reach zero so that it
//! returns every job no worker has started.

use super::*;
use crate::pool::State;
use crate::worker::{Job, Worker};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

struct Inner {
    tx: Option<flume::Sender<Job>>,
    state: State,
    live: usize,
    idle: usize,
    queued: usize,
    refused: Vec<Job>,
}

impl Inner {
    /// Moves towards `next`, returning `false` if the request is redundant.
    fn request(&mut self, next: State) -> bool {
        match (self.state, next) {
            (State::Running, State::ShuttingDown | State::Stopping)
            | (State::ShuttingDown, State::Stopping) => {
                self.state = next;
                true
            }
            _ => false,
        }
    }

    /// Marks the pool terminated once shutdown was requested and no workers remain.
    fn check_terminated(&mut self) -> bool {
        if matches!(self.state, State::ShuttingDown | State::Stopping) && self.live == 0 {
            self.state = State::Terminated;
            true
        } else {
            false
        }
    }
}

/// State shared between the pool handle and its workers.
pub(crate) struct Shared {
    minimum: usize,
    maximum: usize,
    keep_alive: std::time::Duration,
    inner: Mutex<Inner>,
    terminated: Condvar,
    claimed: Condvar,
    active: AtomicUsize,
    completed: AtomicU64,
    panicked: AtomicU64,
    next_index: AtomicUsize,
    factory: Box<dyn WorkerFactory>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Nothing panics while holding the lock, tasks run outside it
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_if_terminated(&self, inner: &mut Inner) {
        if inner.check_terminated() {
            info!("Pool terminated");
            self.terminated.notify_all();
        }
    }

    /// Registers the calling worker as idle.
    ///
    /// Returns the keep-alive to wait for if this worker may retire, or
    /// `None` if it should wait indefinitely.
    pub(crate) fn enter_idle(&self) -> Option<std::time::Duration> {
        let mut inner = self.lock();
        inner.idle += 1;
        (inner.live > self.minimum).then_some(self.keep_alive)
    }

    /// Claims a job taken off the queue.
    ///
    /// Returns `None` if the pool is stopping, in which case the job is kept
    /// for [`WorkerPool::stop_now`] instead of being run.
    pub(crate) fn job_received(&self, job: Job) -> Option<Job> {
        let mut inner = self.lock();
        inner.idle -= 1;
        inner.queued -= 1;
        if inner.state == State::Stopping {
            inner.refused.push(job);
            self.claimed.notify_all();
            None
        } else {
            Some(job)
        }
    }

    /// Called after an idle wait timed out. Returns `true` if the worker
    /// should exit.
    pub(crate) fn try_retire(&self) -> bool {
        let mut inner = self.lock();
        inner.idle -= 1;
        if inner.queued == 0 && inner.live > self.minimum {
            metrics::gauge!("executor_workers").decrement(1.0);
            self.release_slot(&mut inner);
            true
        } else {
            false
        }
    }

    /// Called when the queue is closed and empty.
    pub(crate) fn exit_closed(&self) {
        let mut inner = self.lock();
        inner.idle -= 1;
        metrics::gauge!("executor_workers").decrement(1.0);
        self.release_slot(&mut inner);
    }

    fn release_slot(&self, inner: &mut Inner) {
        inner.live -= 1;
        self.notify_if_terminated(inner);
    }

    pub(crate) fn task_started(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_finished(&self, panicked: bool) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("executor_completed_tasks").increment(1);
        if panicked {
            self.panicked.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("executor_panicked_tasks").increment(1);
        }
    }
}

/// Point-in-time view of the worker pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Counts {
    pub live: usize,
    pub idle: usize,
    pub queued: usize,
    pub active: usize,
    pub completed: u64,
    pub panicked: u64,
}

pub(crate) struct WorkerPool {
    shared: Arc<Shared>,
    rx: flume::Receiver<Job>,
}

impl WorkerPool {
    /// Creates the pool and starts `minimum` workers.
    ///
    /// Fails if any of the initial workers cannot be started, in which case
    /// the workers already started are stopped again.
    pub(crate) fn new(config: &Config, factory: Box<dyn WorkerFactory>) -> std::io::Result<Self> {
        let (tx, rx) = flume::unbounded();
        let pool = Self {
            shared: Arc::new(Shared {
                minimum: config.minimum(),
                maximum: config.maximum(),
                keep_alive: config.keep_alive().try_into().unwrap_or_default(),
                inner: Mutex::new(Inner {
                    tx: Some(tx),
                    state: State::Running,
                    live: 0,
                    idle: 0,
                    queued: 0,
                    refused: Vec::new(),
                }),
                terminated: Condvar::new(),
                claimed: Condvar::new(),
                active: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                panicked: AtomicU64::new(0),
                next_index: AtomicUsize::new(0),
                factory,
            }),
            rx,
        };

        for _ in 0..config.minimum() {
            pool.shared.lock().live += 1;
            if let Err(e) = pool.spawn_worker() {
                pool.shutdown();
                return Err(e);
            }
        }
        Ok(pool)
    }

    /// Starts a worker whose slot has already been counted in `live`.
    fn spawn_worker(&self) -> std::io::Result<()> {
        let index = self.shared.next_index.fetch_add(1, Ordering::Relaxed);
        let worker = Worker::new(index, self.shared.clone(), self.rx.clone());

        match self.shared.factory.builder(index).spawn(move || worker.run()) {
            Ok(_) => {
                metrics::gauge!("executor_workers").increment(1.0);
                Ok(())
            }
            Err(e) => {
                let mut inner = self.shared.lock();
                self.shared.release_slot(&mut inner);
                Err(e)
            }
        }
    }

    /// Queues a job, growing the pool if no idle worker is available.
    ///
    /// Hands the job back if the pool no longer accepts work; dropping it
    /// releases its permit.
    pub(crate) fn execute(&self, job: Job) -> Result<(), Job> {
        let grow = {
            let mut inner = self.shared.lock();
            let Some(tx) = &inner.tx else {
                return Err(job);
            };
            tx.send(job).map_err(|flume::SendError(job)| job)?;

            inner.queued += 1;
            if inner.queued > inner.idle && inner.live < self.shared.maximum {
                inner.live += 1;
                true
            } else {
                false
            }
        };

        if grow {
            match self.spawn_worker() {
                Ok(()) => debug!("Started additional worker to meet demand"),
                Err(e) => warn!("Failed to start additional worker, job remains queued: {e}"),
            }
        }
        Ok(())
    }

    /// Stops accepting jobs; workers finish the queued jobs and then exit.
    ///
    /// Returns `false` if shutdown had already been requested.
    pub(crate) fn shutdown(&self) -> bool {
        let mut inner = self.shared.lock();
        inner.tx = None;
        let changed = inner.request(State::ShuttingDown);
        self.shared.notify_if_terminated(&mut inner);
        changed
    }

    /// Stops accepting jobs and removes every job no worker has started.
    ///
    /// No job starts once this has taken the lock: jobs still in the channel
    /// are drained, and jobs a worker has taken but not yet claimed are
    /// refused by [`Shared::job_received`] and collected here. The flag is
    /// `false` if the pool was already stopping.
    pub(crate) fn stop_now(&self) -> (bool, Vec<Job>) {
        let mut inner = self.shared.lock();
        inner.tx = None;
        let changed = inner.request(State::Stopping);

        let drained: Vec<Job> = self.rx.drain().collect();
        inner.queued -= drained.len();

        // Wait for workers holding a job they have not claimed yet
        while inner.queued > 0 {
            inner = self
                .shared
                .claimed
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }

        // Refused jobs left the queue before the drained ones
        let mut jobs = core::mem::take(&mut inner.refused);
        jobs.extend(drained);

        self.shared.notify_if_terminated(&mut inner);
        (changed, jobs)
    }

    /// Blocks until the pool is terminated or `timeout` elapses.
    pub(crate) fn await_termination(&self, timeout: std::time::Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut inner = self.shared.lock();

        while inner.state != State::Terminated {
            inner = match deadline {
                Some(deadline) => {
                    let Some(remaining) = deadline
                        .checked_duration_since(Instant::now())
                        .filter(|remaining| !remaining.is_zero())
                    else {
                        return false;
                    };
                    self.shared
                        .terminated
                        .wait_timeout(inner, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .shared
                    .terminated
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
        true
    }

    pub(crate) fn state(&self) -> State {
        self.shared.lock().state
    }

    pub(crate) fn counts(&self) -> Counts {
        let (live, idle, queued) = {
            let inner = self.shared.lock();
            (inner.live, inner.idle, inner.queued)
        };
        Counts {
            live,
            idle,
            queued,
            active: self.shared.active.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            panicked: self.shared.panicked.load(Ordering::Relaxed),
        }
    }
}

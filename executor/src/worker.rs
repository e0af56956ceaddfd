//! Worker threads and the factory that creates them.
//!
//! Every worker runs the same loop: wait for a job on the shared queue, run
//! it, repeat. Workers above the pool's minimum wait at most `keep_alive` for
//! a job before retiring; the remaining workers wait indefinitely. A worker
//! also exits once the queue has been closed and drained.
//!
//! Threads are created through a [`WorkerFactory`], which lets the owner of
//! the pool choose thread names and stack sizes.

use super::*;
use crate::admission::Permit;
use crate::worker_pool::Shared;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Creates the threads a [`Pool`](crate::Pool) runs its workers on.
///
/// `index` increases monotonically for every worker a pool starts, including
/// replacements for retired workers.
///
/// Any `Fn(usize) -> std::thread::Builder` closure is a factory:
///
/// ```
/// use bounded_executor::{config::Config, Pool};
///
/// let pool = Pool::new(Config::default(), |index: usize| {
///     std::thread::Builder::new().name(format!("ingest-{index}"))
/// })
/// .unwrap();
/// # pool.shutdown();
/// ```
pub trait WorkerFactory: Send + Sync {
    fn builder(&self, index: usize) -> std::thread::Builder;
}

impl<F> WorkerFactory for F
where
    F: Fn(usize) -> std::thread::Builder + Send + Sync,
{
    fn builder(&self, index: usize) -> std::thread::Builder {
        self(index)
    }
}

/// The default factory: threads named `<prefix>-<index>`.
#[derive(Debug, Clone)]
pub struct NamedWorkers {
    prefix: String,
    stack_size: Option<usize>,
}

impl NamedWorkers {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            stack_size: None,
        }
    }

    /// Sets the stack size, in bytes, of every worker thread.
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }
}

impl Default for NamedWorkers {
    fn default() -> Self {
        Self::new("executor-worker")
    }
}

impl WorkerFactory for NamedWorkers {
    fn builder(&self, index: usize) -> std::thread::Builder {
        let builder = std::thread::Builder::new().name(format!("{}-{index}", self.prefix));
        match self.stack_size {
            Some(stack_size) => builder.stack_size(stack_size),
            None => builder,
        }
    }
}

/// An admitted task, carrying the permit that admitted it.
pub(crate) struct Job {
    task: Task,
    permit: Permit,
}

impl Job {
    pub(crate) fn new(task: Task, permit: Permit) -> Self {
        Self { task, permit }
    }

    /// Runs the task to completion, catching any panic.
    ///
    /// The permit is released before this returns, on both paths.
    fn run(self) -> Result<(), String> {
        let Job { task, permit } = self;
        let result = std::panic::catch_unwind(AssertUnwindSafe(task));
        drop(permit);

        result.map_err(|payload| {
            if let Some(msg) = payload.downcast_ref::<&str>() {
                msg.to_string()
            } else if let Some(msg) = payload.downcast_ref::<String>() {
                msg.clone()
            } else {
                "non-string panic payload".to_string()
            }
        })
    }

    /// Gives up the task without running it, releasing the permit.
    pub(crate) fn into_task(self) -> Task {
        self.task
    }
}

pub(crate) struct Worker {
    index: usize,
    shared: Arc<Shared>,
    rx: flume::Receiver<Job>,
}

impl Worker {
    pub(crate) fn new(index: usize, shared: Arc<Shared>, rx: flume::Receiver<Job>) -> Self {
        Self { index, shared, rx }
    }

    pub(crate) fn run(self) {
        debug!("Worker {} started", self.index);

        loop {
            let received = match self.shared.enter_idle() {
                Some(keep_alive) => recv_for(&self.rx, keep_alive),
                None => self
                    .rx
                    .recv()
                    .map_err(|_| flume::RecvTimeoutError::Disconnected),
            };

            match received {
                Ok(job) => {
                    if let Some(job) = self.shared.job_received(job) {
                        self.execute(job);
                    }
                }
                Err(flume::RecvTimeoutError::Timeout) => {
                    if self.shared.try_retire() {
                        debug!("Worker {} retired after keep-alive", self.index);
                        return;
                    }
                }
                Err(flume::RecvTimeoutError::Disconnected) => {
                    self.shared.exit_closed();
                    debug!("Worker {} stopped, queue closed", self.index);
                    return;
                }
            }
        }
    }

    fn execute(&self, job: Job) {
        self.shared.task_started();
        let outcome = job.run();
        self.shared.task_finished(outcome.is_err());

        if let Err(msg) = outcome {
            warn!("Task panicked on worker {}: {msg}", self.index);
        }
    }
}

fn recv_for(
    rx: &flume::Receiver<Job>,
    timeout: std::time::Duration,
) -> Result<Job, flume::RecvTimeoutError> {
    match Instant::now().checked_add(timeout) {
        Some(deadline) => rx.recv_deadline(deadline),
        None => rx
            .recv()
            .map_err(|_| flume::RecvTimeoutError::Disconnected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionGate;
    use core::num::NonZeroUsize;

    #[test]
    fn named_workers_builder() {
        let factory = NamedWorkers::new("unit").stack_size(256 * 1024);
        let handle = factory
            .builder(7)
            .spawn(|| std::thread::current().name().map(str::to_string))
            .unwrap();

        assert_eq!(handle.join().unwrap().as_deref(), Some("unit-7"));
    }

    #[test]
    fn closure_factory() {
        let factory = |index: usize| std::thread::Builder::new().name(format!("closure-{index}"));
        let handle = WorkerFactory::builder(&factory, 3)
            .spawn(|| std::thread::current().name().map(str::to_string))
            .unwrap();

        assert_eq!(handle.join().unwrap().as_deref(), Some("closure-3"));
    }

    #[test]
    fn job_releases_permit_on_panic() {
        let gate = AdmissionGate::new(NonZeroUsize::new(1).unwrap());
        let job = Job::new(Box::new(|| panic!("boom")), gate.acquire().unwrap());
        assert_eq!(gate.available(), 0);

        assert_eq!(job.run().unwrap_err(), "boom");
        assert_eq!(gate.available(), 1);
    }

    #[test]
    fn job_into_task_releases_permit() {
        let gate = AdmissionGate::new(NonZeroUsize::new(1).unwrap());
        let (tx, rx) = flume::bounded(1);
        let job = Job::new(
            Box::new(move || tx.send(()).unwrap()),
            gate.acquire().unwrap(),
        );

        let task = job.into_task();
        assert_eq!(gate.available(), 1);

        // The task comes back intact
        task();
        assert!(rx.try_recv().is_ok());
    }
}

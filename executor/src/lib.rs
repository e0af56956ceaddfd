//! Elastic thread pool with bounded task admission.
//!
//! This crate decouples "how many tasks may be outstanding at once" from "how
//! many worker threads exist". A [`Pool`] owns two independent bounds:
//!
//! - an [`AdmissionGate`](admission::AdmissionGate) holding
//!   `capacity + maximum` permits, one per queued or executing task
//! - an elastic set of `minimum..=maximum` worker threads fed by an
//!   unbounded queue
//!
//! Submitting a task first takes a permit, blocking while none is free, so
//! producers feel backpressure instead of growing the queue without limit.
//! The permit travels with the task and is released exactly once, whether
//! the task completes, panics, is rejected, or is drained by
//! [`Pool::shutdown_now`].
//!
//! # Features
//!
//! - **serde**: deserialize [`Config`](config::Config) from configuration files
//! - **instrument**: `tracing` spans on the lifecycle operations
//!
//! # Example
//!
//! ```
//! use bounded_executor::{Pool, config::Config};
//!
//! let config = Config::builder()
//!     .capacity(16).unwrap()
//!     .minimum(1).unwrap()
//!     .maximum(4).unwrap()
//!     .keep_alive(time::Duration::seconds(30)).unwrap()
//!     .build().unwrap();
//!
//! let pool = Pool::with_config(config).unwrap();
//! let cancel = pool.cancel_token().clone();
//!
//! pool.submit(move || {
//!     for _chunk in 0..4 {
//!         if cancel.is_cancelled() {
//!             return;
//!         }
//!         // Process a chunk
//!     }
//! }).unwrap();
//!
//! pool.shutdown();
//! assert!(pool.await_termination(time::Duration::seconds(10)));
//! ```

mod worker_pool;

pub mod admission;
pub mod config;
pub mod pool;
pub mod worker;

// Re-export commonly used types at crate root
pub use config::Config;
pub use pool::{Pool, State, Stats, TrySubmitError};
pub use tokio_util::sync::CancellationToken;
pub use worker::{NamedWorkers, WorkerFactory};

/// A unit of work run by a [`Pool`].
///
/// Tasks are opaque to the pool; they return nothing and their panics are
/// contained by the worker that runs them.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Returns the number of available hardware threads, or 1 if unknown.
pub fn available_parallelism() -> core::num::NonZeroUsize {
    std::thread::available_parallelism().unwrap_or(core::num::NonZeroUsize::MIN)
}

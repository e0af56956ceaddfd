//! Admission control for outstanding tasks.
//!
//! This module provides [`AdmissionGate`], a counting permit pool that bounds
//! how many tasks may be outstanding (queued or executing) at once,
//! independently of how many workers exist. A task may only be handed to the
//! worker pool while it holds a [`Permit`]; the permit travels with the task
//! and is released when it is dropped, whichever way the task leaves the pool.
//!
//! # Pattern
//!
//! The gate is a thin wrapper over [`tokio::sync::Semaphore`], which is
//! runtime-agnostic and fair: blocked acquirers are served in FIFO order.
//! Synchronous callers block the current thread in [`AdmissionGate::acquire`],
//! async callers await [`AdmissionGate::acquire_async`].
//!
//! Closing the gate wakes every blocked acquirer with [`Error::Closed`], so no
//! caller is left waiting for a permit that will never be granted.
//!
//! # Example
//!
//! ```
//! use bounded_executor::admission::{AdmissionGate, Error};
//!
//! let gate = AdmissionGate::new(core::num::NonZeroUsize::new(1).unwrap());
//!
//! let permit = gate.acquire().unwrap();
//! assert_eq!(gate.try_acquire().unwrap_err(), Error::Full);
//!
//! drop(permit);
//! assert_eq!(gate.available(), 1);
//! ```

use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// The largest number of permits a gate can hold.
pub const MAX_PERMITS: usize = tokio::sync::Semaphore::MAX_PERMITS;

/// A specialized `Result` type for admission operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Reasons a permit was not granted.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Every permit is currently held.
    #[error("No admission permits available")]
    Full,

    /// The gate has been closed and grants no further permits.
    #[error("The admission gate is closed")]
    Closed,
}

/// A counting permit pool bounding the number of outstanding tasks.
#[derive(Debug)]
pub struct AdmissionGate {
    semaphore: Arc<tokio::sync::Semaphore>,
    permits: usize,
}

/// Authorises exactly one task to be outstanding.
///
/// The permit is returned to its gate when dropped, which happens exactly
/// once however the owning task finishes.
#[derive(Debug)]
#[must_use = "dropping a permit releases it immediately"]
pub struct Permit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl AdmissionGate {
    /// Creates a gate holding `permits` permits, capped at [`MAX_PERMITS`].
    pub fn new(permits: core::num::NonZeroUsize) -> Self {
        let permits = permits.get().min(MAX_PERMITS);
        Self {
            semaphore: Arc::new(tokio::sync::Semaphore::new(permits)),
            permits,
        }
    }

    /// Blocks the current thread until a permit is available.
    ///
    /// The wait ends only when a permit is granted or the gate is closed.
    /// Do not call this from inside an async task; use
    /// [`acquire_async`](AdmissionGate::acquire_async) there instead.
    pub fn acquire(&self) -> Result<Permit> {
        futures::executor::block_on(self.acquire_async())
    }

    /// Waits asynchronously until a permit is available.
    pub async fn acquire_async(&self) -> Result<Permit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Closed)?;

        trace!("Admission permit acquired, {} remaining", self.available());
        Ok(Permit { _permit: permit })
    }

    /// Takes a permit if one is immediately available.
    pub fn try_acquire(&self) -> Result<Permit> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(Permit { _permit: permit }),
            Err(tokio::sync::TryAcquireError::NoPermits) => Err(Error::Full),
            Err(tokio::sync::TryAcquireError::Closed) => Err(Error::Closed),
        }
    }

    /// Stops granting permits and wakes every blocked acquirer.
    ///
    /// Permits already held are still returned to the gate when dropped.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Permits not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Total permits the gate was created with.
    pub fn permits(&self) -> usize {
        self.permits
    }

    /// Permits currently held, i.e. outstanding tasks.
    pub fn outstanding(&self) -> usize {
        self.permits.saturating_sub(self.available())
    }
}

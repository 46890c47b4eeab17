//! Serialized, rate-limited execution of device operations.
//!
//! Some gateway operations (parameter access, trouble-code fetches)
//! must not overlap and need a minimum gap between consecutive runs, or
//! the device drops requests. A [`SerialQueue`] wraps both constraints
//! around an arbitrary future.

use crate::Error;
use core::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Runs futures one at a time with a minimum gap between completions.
pub struct SerialQueue {
    gap: Duration,
    /// Completion instant of the most recent run; `None` until the first.
    slot: Mutex<Option<Instant>>,
}

impl SerialQueue {
    /// Constructs a queue with the given minimum gap between runs.
    #[must_use]
    pub fn new(gap: Duration) -> Self {
        Self {
            gap,
            slot: Mutex::new(None),
        }
    }

    /// Runs the future once the queue slot is free and the gap since the
    /// previous run has elapsed.
    ///
    /// Callers waiting on a busy slot are served in FIFO order.
    pub async fn run<F: Future>(&self, fut: F) -> F::Output {
        let mut slot = self.slot.lock().await;

        if let Some(last) = *slot {
            sleep_until(last + self.gap).await;
        }

        let output = fut.await;

        *slot = Some(Instant::now());

        output
    }

    /// Like [`SerialQueue::run`], but fails immediately when the slot
    /// is busy instead of waiting.
    ///
    /// # Errors
    ///
    /// - [`Error::TooManyCommandsRunning`] if another run is in progress.
    pub async fn try_run<F: Future>(&self, fut: F) -> Result<F::Output, Error> {
        let mut slot = self
            .slot
            .try_lock()
            .map_err(|_| Error::TooManyCommandsRunning)?;

        if let Some(last) = *slot {
            sleep_until(last + self.gap).await;
        }

        let output = fut.await;

        *slot = Some(Instant::now());

        Ok(output)
    }
}

//! Lock output seam.
//!
//! The control logic only ever asks for "locked" or "unlocked" through
//! [`LockActuator`]. [`TrackedActuator`] wraps a driver, skips redundant
//! writes and remembers the last commanded state.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Errors raised by a lock output driver.
#[derive(Debug, Error)]
pub enum ActuatorError {
    /// The driver program could not be started.
    #[error("failed to start '{program}': {message}")]
    Spawn {
        /// Program that was run.
        program: String,
        /// Underlying failure.
        message: String,
    },

    /// The driver program exited unsuccessfully.
    #[error("'{program}' exited with {status}")]
    ExitStatus {
        /// Program that was run.
        program: String,
        /// Exit status as reported by the OS.
        status: String,
    },

    /// The driver program did not finish in time.
    #[error("'{program}' did not finish within {timeout_ms} ms")]
    Timeout {
        /// Program that was run.
        program: String,
        /// Time limit in milliseconds.
        timeout_ms: u64,
    },

    /// Any other driver failure.
    #[error("{0}")]
    Other(String),
}

/// A driver for the machine's lock output.
#[async_trait]
pub trait LockActuator: Send + Sync {
    /// Drive the output to the locked (`true`) or unlocked (`false`) level.
    async fn set_locked(&self, locked: bool) -> Result<(), ActuatorError>;
}

#[async_trait]
impl<T: LockActuator + ?Sized> LockActuator for Box<T> {
    async fn set_locked(&self, locked: bool) -> Result<(), ActuatorError> {
        (**self).set_locked(locked).await
    }
}

/// Idempotent, state-tracking wrapper around a [`LockActuator`].
///
/// Writes are serialized. A write is skipped when the output is already
/// known to be at the requested level; after a failed write the level is
/// unknown and the next request always reaches the driver.
#[derive(Debug)]
pub struct TrackedActuator<A> {
    inner: A,
    state: Mutex<Option<bool>>,
}

impl<A: LockActuator> TrackedActuator<A> {
    /// Wrap `inner`; the initial level is unknown.
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            state: Mutex::new(None),
        }
    }

    /// Last successfully commanded level, `None` if unknown.
    pub async fn current(&self) -> Option<bool> {
        *self.state.lock().await
    }

    /// Command the output. Returns `true` if the driver was called.
    ///
    /// # Errors
    ///
    /// Returns the driver's error; the tracked level becomes unknown.
    pub async fn set_locked(&self, locked: bool) -> Result<bool, ActuatorError> {
        let mut state = self.state.lock().await;
        self.write(&mut state, locked).await
    }

    async fn write(&self, state: &mut Option<bool>, locked: bool) -> Result<bool, ActuatorError> {
        if *state == Some(locked) {
            debug!(locked, "Lock output already at requested level");
            return Ok(false);
        }

        match self.inner.set_locked(locked).await {
            Ok(()) => {
                *state = Some(locked);
                info!(locked, "Lock output set");
                Ok(true)
            }
            Err(e) => {
                *state = None;
                Err(e)
            }
        }
    }

    /// Command unlocked unless `stop` has fired. The token is checked while
    /// holding the write lock, so an unlock queued behind a lock issued
    /// after `stop` was cancelled is dropped.
    ///
    /// Returns `false` if the unlock was refused.
    pub async fn unlock_unless(&self, stop: &CancellationToken) -> bool {
        let mut state = self.state.lock().await;
        if stop.is_cancelled() {
            debug!("Unlock refused, session is ending");
            return false;
        }
        if let Err(e) = self.write(&mut state, false).await {
            error!(error = %e, "Failed to unlock");
        }
        true
    }

    /// Command unlocked, logging a failure instead of returning it.
    pub async fn unlock(&self) {
        if let Err(e) = self.set_locked(false).await {
            error!(error = %e, "Failed to unlock");
        }
    }

    /// Command locked, logging a failure instead of returning it. Used on
    /// every fail-safe path.
    pub async fn lock(&self) {
        if let Err(e) = self.set_locked(true).await {
            error!(error = %e, "Failed to lock");
        }
    }

    /// The wrapped driver.
    pub const fn inner(&self) -> &A {
        &self.inner
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    /// Records every level it is driven to.
    #[derive(Debug, Default)]
    pub struct RecordingActuator {
        writes: Mutex<Vec<bool>>,
        failures: AtomicU32,
        delay: Duration,
    }

    impl RecordingActuator {
        pub fn failing(count: u32) -> Self {
            Self {
                failures: AtomicU32::new(count),
                ..Self::default()
            }
        }

        /// Driver that takes `delay` per write, like a relay tool that
        /// has to be spawned.
        pub fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        pub fn writes(&self) -> Vec<bool> {
            self.writes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LockActuator for RecordingActuator {
        async fn set_locked(&self, locked: bool) -> Result<(), ActuatorError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ActuatorError::Other("output busy".to_string()));
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.writes.lock().unwrap().push(locked);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingActuator;
    use super::*;

    #[tokio::test]
    async fn test_redundant_writes_are_skipped() {
        let actuator = TrackedActuator::new(RecordingActuator::default());
        assert_eq!(actuator.current().await, None);

        assert!(actuator.set_locked(true).await.unwrap());
        assert!(!actuator.set_locked(true).await.unwrap());
        assert!(actuator.set_locked(false).await.unwrap());
        assert!(!actuator.set_locked(false).await.unwrap());

        assert_eq!(actuator.inner().writes(), vec![true, false]);
        assert_eq!(actuator.current().await, Some(false));
    }

    #[tokio::test]
    async fn test_failed_write_makes_level_unknown() {
        let actuator = TrackedActuator::new(RecordingActuator::failing(1));

        assert!(actuator.set_locked(true).await.is_err());
        assert_eq!(actuator.current().await, None);

        actuator.lock().await;
        assert_eq!(actuator.current().await, Some(true));
        assert_eq!(actuator.inner().writes(), vec![true]);
    }

    #[tokio::test]
    async fn test_unlock_refused_once_stopped() {
        let actuator = TrackedActuator::new(RecordingActuator::default());
        let stop = CancellationToken::new();

        assert!(actuator.unlock_unless(&stop).await);
        actuator.lock().await;
        stop.cancel();
        assert!(!actuator.unlock_unless(&stop).await);

        assert_eq!(actuator.inner().writes(), vec![false, true]);
        assert_eq!(actuator.current().await, Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_unlock_loses_to_lock_issued_after_stop() {
        let actuator = std::sync::Arc::new(TrackedActuator::new(RecordingActuator::slow(
            std::time::Duration::from_millis(50),
        )));
        actuator.unlock().await;
        let stop = CancellationToken::new();

        stop.cancel();
        let locker = {
            let actuator = actuator.clone();
            tokio::spawn(async move { actuator.lock().await })
        };
        tokio::task::yield_now().await;
        let unlocked = actuator.unlock_unless(&stop).await;
        locker.await.unwrap();

        assert!(!unlocked);
        assert_eq!(actuator.inner().writes(), vec![false, true]);
    }

    #[tokio::test]
    async fn test_boxed_driver() {
        let boxed: Box<dyn LockActuator> = Box::new(RecordingActuator::default());
        let actuator = TrackedActuator::new(boxed);
        actuator.unlock().await;
        assert_eq!(actuator.current().await, Some(false));
    }
}

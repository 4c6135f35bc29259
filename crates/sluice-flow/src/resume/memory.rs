//! In-memory resume signaller for testing.
//!
//! [`InMemoryResumeQueue`] buffers delivered signals so tests can inspect
//! which suspended steps were woken and in what order.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: Signals are never delivered anywhere
//! - **Single-process only**: Signals are not visible across process boundaries

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use sluice_core::ConsumerId;

use super::{ResumeOutcome, ResumeSignal, ResumeSignaller};
use crate::error::{Error, Result};

/// Buffers resume signals in memory.
///
/// ## Example
///
/// ```rust
/// use sluice_flow::resume::memory::InMemoryResumeQueue;
///
/// let queue = InMemoryResumeQueue::new();
/// assert_eq!(queue.len().unwrap(), 0);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryResumeQueue {
    signals: RwLock<VecDeque<ResumeSignal>>,
    unavailable: AtomicBool,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("resume queue lock poisoned")
}

impl InMemoryResumeQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent delivery fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Takes the oldest buffered signal.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn take(&self) -> Result<Option<ResumeSignal>> {
        let mut signals = self.signals.write().map_err(poison_err)?;
        let signal = signals.pop_front();
        drop(signals);
        Ok(signal)
    }

    /// Removes and returns every buffered signal.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn drain(&self) -> Result<Vec<ResumeSignal>> {
        let mut signals = self.signals.write().map_err(poison_err)?;
        let drained: Vec<_> = signals.drain(..).collect();
        drop(signals);
        Ok(drained)
    }

    /// Removes every buffered signal and returns the callback ids with the
    /// given outcome, in delivery order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn drain_ids(&self, outcome: ResumeOutcome) -> Result<Vec<ConsumerId>> {
        Ok(self
            .drain()?
            .into_iter()
            .filter(|s| s.outcome == outcome)
            .map(|s| s.callback_id)
            .collect())
    }

    /// Returns the number of buffered signals.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let signals = self.signals.read().map_err(poison_err)?;
        Ok(signals.len())
    }

    /// Returns true if no signals are buffered.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl ResumeSignaller for InMemoryResumeQueue {
    async fn signal(&self, signal: ResumeSignal) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Signal {
                message: format!("resume queue unavailable for {}", signal.callback_id),
            });
        }
        let mut signals = self.signals.write().map_err(poison_err)?;
        signals.push_back(signal);
        drop(signals);
        Ok(())
    }
}

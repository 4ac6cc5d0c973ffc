//! Deadline-bound, cancellable call context.
//!
//! Every blocking point in the queue (lock acquisition, save waits, storage
//! I/O) takes a `Context`. Waiting is bounded by the deadline and polls the
//! cancel flag at least every [`POLL_INTERVAL`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::{Error, Result};

pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expiry {
    Cancelled,
    DeadlineExceeded,
}

impl Context {
    /// A context with no deadline. It can still be cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn expiry(&self) -> Option<Expiry> {
        if self.is_cancelled() {
            return Some(Expiry::Cancelled);
        }
        match self.remaining() {
            Some(left) if left.is_zero() => Some(Expiry::DeadlineExceeded),
            _ => None,
        }
    }

    /// How long a condvar wait may sleep before re-checking the context.
    pub(crate) fn wait_slice(&self) -> Duration {
        match self.remaining() {
            Some(left) => left.min(POLL_INTERVAL),
            None => POLL_INTERVAL,
        }
    }

    pub(crate) fn check_lock(&self) -> Result<()> {
        match self.expiry() {
            Some(Expiry::Cancelled) => Err(Error::Cancelled),
            Some(Expiry::DeadlineExceeded) => Err(Error::LockTimeout),
            None => Ok(()),
        }
    }

    pub(crate) fn check_save(&self) -> Result<()> {
        match self.expiry() {
            Some(Expiry::Cancelled) => Err(Error::Cancelled),
            Some(Expiry::DeadlineExceeded) => Err(Error::SaveTimeout),
            None => Ok(()),
        }
    }
}

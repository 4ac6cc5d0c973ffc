//! One-shot save completion signals and the dirty/persisted version pair
//! they hang off.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::core::{Context, Result};

#[derive(Debug, Default)]
struct SignalInner {
    done: Mutex<bool>,
    fired: Condvar,
}

/// A one-shot completion handle. Cloning shares the same underlying signal.
#[derive(Debug, Clone, Default)]
pub struct SaveSignal {
    inner: Arc<SignalInner>,
}

impl SaveSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed() -> Self {
        let signal = Self::new();
        signal.complete();
        signal
    }

    pub fn complete(&self) {
        let mut done = self
            .inner
            .done
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *done = true;
        drop(done);
        self.inner.fired.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        *self
            .inner
            .done
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Blocks until the signal fires or the context expires.
    pub fn wait(&self, ctx: &Context) -> Result<()> {
        let mut done = self
            .inner
            .done
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while !*done {
            ctx.check_save()?;
            let (next, _) = self
                .inner
                .fired
                .wait_timeout(done, ctx.wait_slice())
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            done = next;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct VersionState {
    dirty: u64,
    persisted: u64,
    waiters: Vec<(u64, SaveSignal)>,
}

/// Dirty/persisted version pair with the save waiters registered against it.
///
/// `persisted <= dirty` always holds. Waiters are keyed by the version they
/// need and fire as a batch once a save covers it.
#[derive(Debug, Default)]
pub struct VersionTracker {
    state: Mutex<VersionState>,
}

impl VersionTracker {
    pub fn new(version: u64) -> Self {
        Self {
            state: Mutex::new(VersionState {
                dirty: version,
                persisted: version,
                waiters: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VersionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Raises the dirty version to at least `version`; returns the result.
    pub fn mark_dirty(&self, version: u64) -> u64 {
        let mut state = self.lock();
        state.dirty = state.dirty.max(version);
        state.dirty
    }

    /// Bumps the dirty version by one.
    pub fn bump(&self) -> u64 {
        let mut state = self.lock();
        state.dirty += 1;
        state.dirty
    }

    pub fn dirty(&self) -> u64 {
        self.lock().dirty
    }

    pub fn persisted(&self) -> u64 {
        self.lock().persisted
    }

    pub fn is_clean(&self) -> bool {
        let state = self.lock();
        state.dirty == state.persisted
    }

    /// The version a save should write, or `None` when nothing is pending.
    pub fn pending(&self) -> Option<u64> {
        let state = self.lock();
        (state.dirty > state.persisted).then_some(state.dirty)
    }

    /// Records that `version` reached storage and fires every waiter it covers.
    pub fn mark_persisted(&self, version: u64) {
        let mut state = self.lock();
        if version > state.persisted {
            state.persisted = version;
        }
        if state.dirty < state.persisted {
            state.dirty = state.persisted;
        }
        let persisted = state.persisted;
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.waiters)
            .into_iter()
            .partition(|(needed, _)| *needed <= persisted);
        state.waiters = waiting;
        drop(state);
        for (_, signal) in ready {
            signal.complete();
        }
    }

    /// Resets both versions, as after a reload from storage.
    pub fn reset(&self, version: u64) {
        let mut state = self.lock();
        state.dirty = version;
        state.persisted = version;
    }

    /// Registers a waiter for `version`. Already-covered versions return a
    /// completed signal.
    pub fn wait_for(&self, version: u64) -> SaveSignal {
        let mut state = self.lock();
        if version <= state.persisted {
            return SaveSignal::completed();
        }
        let signal = SaveSignal::new();
        state.waiters.push((version, signal.clone()));
        signal
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.lock().waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_signal_wakes_waiter() {
        let signal = SaveSignal::new();
        let remote = signal.clone();
        let handle = thread::spawn(move || remote.wait(&Context::with_timeout(Duration::from_secs(5))));
        thread::sleep(Duration::from_millis(20));
        signal.complete();
        handle.join().expect("join").expect("wait");
        assert!(signal.is_complete());
    }

    #[test]
    fn test_signal_wait_times_out() {
        let signal = SaveSignal::new();
        let err = signal
            .wait(&Context::with_timeout(Duration::from_millis(15)))
            .expect_err("must time out");
        assert!(matches!(err, crate::core::Error::SaveTimeout));
    }

    #[test]
    fn test_tracker_fires_only_covered_waiters() {
        let tracker = VersionTracker::new(0);
        tracker.mark_dirty(5);
        let early = tracker.wait_for(5);
        tracker.mark_dirty(9);
        let late = tracker.wait_for(9);
        assert_eq!(tracker.pending(), Some(9));

        tracker.mark_persisted(5);
        assert!(early.is_complete());
        assert!(!late.is_complete());
        assert_eq!(tracker.waiter_count(), 1);

        tracker.mark_persisted(9);
        assert!(late.is_complete());
        assert!(tracker.is_clean());
        assert!(tracker.pending().is_none());
    }

    #[test]
    fn test_covered_version_returns_completed_signal() {
        let tracker = VersionTracker::new(3);
        assert!(tracker.wait_for(2).is_complete());
        assert_eq!(tracker.waiter_count(), 0);
    }
}

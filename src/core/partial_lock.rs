//! Reader/writer lock with in-place promotion.
//!
//! `PartialLock` hands out shared (`read`) and exclusive (`write`) guards
//! like a standard rwlock, and additionally lets one shared holder promote
//! its hold to exclusive without releasing it first. The promoter claims a
//! single upgrade slot, new readers are held back while the slot is taken,
//! and the promotion completes once every other reader has left. No writer
//! can slip in between the shared check and the exclusive mutation.
//!
//! A second shared holder asking to promote while the slot is taken gets
//! `Error::PromoteContended` immediately: both would otherwise wait on each
//! other forever.
//!
//! All acquisitions are bounded by a [`Context`]; expiry returns
//! `Error::LockTimeout` (or `Error::Cancelled`) and leaves the lock state
//! untouched.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::core::{Context, Error, Result};

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
    upgrading: bool,
}

pub struct PartialLock<T> {
    state: Mutex<LockState>,
    changed: Condvar,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is mediated by `state`; shared guards only hand
// out `&T` and an exclusive guard exists only while `writer` is set and no
// readers remain.
unsafe impl<T: Send> Send for PartialLock<T> {}
unsafe impl<T: Send + Sync> Sync for PartialLock<T> {}

impl<T: fmt::Debug> fmt::Debug for PartialLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("PartialLock");
        match self.try_read() {
            Some(guard) => out.field("data", &&*guard),
            None => out.field("data", &format_args!("<locked>")),
        };
        out.finish()
    }
}

impl<T: Default> Default for PartialLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> PartialLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            changed: Condvar::new(),
            data: UnsafeCell::new(value),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Waits on the condvar until `ready` holds or the context expires.
    fn wait_until<'a>(
        &'a self,
        ctx: &Context,
        mut state: MutexGuard<'a, LockState>,
        ready: impl Fn(&LockState) -> bool,
    ) -> Result<MutexGuard<'a, LockState>> {
        while !ready(&state) {
            ctx.check_lock()?;
            let (next, _) = self
                .changed
                .wait_timeout(state, ctx.wait_slice())
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = next;
        }
        Ok(state)
    }

    pub fn read(&self, ctx: &Context) -> Result<ReadGuard<'_, T>> {
        let state = self.lock_state();
        let mut state = self.wait_until(ctx, state, |s| !s.writer && !s.upgrading)?;
        state.readers += 1;
        Ok(ReadGuard { lock: self })
    }

    pub fn write(&self, ctx: &Context) -> Result<WriteGuard<'_, T>> {
        let state = self.lock_state();
        let mut state = self.wait_until(ctx, state, |s| {
            !s.writer && !s.upgrading && s.readers == 0
        })?;
        state.writer = true;
        Ok(WriteGuard { lock: self })
    }

    /// Non-blocking shared acquisition.
    pub fn try_read(&self) -> Option<ReadGuard<'_, T>> {
        let mut state = self.lock_state();
        if state.writer || state.upgrading {
            return None;
        }
        state.readers += 1;
        Some(ReadGuard { lock: self })
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn release_read(&self) {
        let mut state = self.lock_state();
        state.readers -= 1;
        drop(state);
        self.changed.notify_all();
    }

    fn release_write(&self) {
        let mut state = self.lock_state();
        state.writer = false;
        drop(state);
        self.changed.notify_all();
    }
}

pub struct ReadGuard<'a, T> {
    lock: &'a PartialLock<T>,
}

impl<'a, T> ReadGuard<'a, T> {
    /// Converts this shared hold into an exclusive one without releasing it.
    ///
    /// On failure the shared hold is handed back untouched alongside the
    /// error, so the caller decides whether to drop it or keep reading.
    pub fn try_promote(self, ctx: &Context) -> std::result::Result<WriteGuard<'a, T>, (Self, Error)> {
        let lock = self.lock;
        let mut state = lock.lock_state();
        if state.upgrading {
            drop(state);
            return Err((self, Error::PromoteContended));
        }
        state.upgrading = true;
        let waited = lock.wait_until(ctx, state, |s| s.readers == 1 && !s.writer);
        match waited {
            Ok(mut state) => {
                state.upgrading = false;
                state.readers = 0;
                state.writer = true;
                drop(state);
                std::mem::forget(self);
                Ok(WriteGuard { lock })
            }
            Err(err) => {
                let mut state = lock.lock_state();
                state.upgrading = false;
                drop(state);
                lock.changed.notify_all();
                Err((self, err))
            }
        }
    }
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a shared hold excludes any writer.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

pub struct WriteGuard<'a, T> {
    lock: &'a PartialLock<T>,
}

impl<'a, T> WriteGuard<'a, T> {
    /// Converts this exclusive hold back into a shared one. Nothing can
    /// acquire the lock exclusively in between.
    pub fn reduce(self) -> ReadGuard<'a, T> {
        let lock = self.lock;
        let mut state = lock.lock_state();
        state.writer = false;
        state.readers += 1;
        drop(state);
        std::mem::forget(self);
        lock.changed.notify_all();
        ReadGuard { lock }
    }
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: exclusive hold.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: exclusive hold.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

use std::{
    ops::{Deref, DerefMut},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard, WaitTimeoutResult};

/// Mutex paired with a condition variable. Every waiter re-checks its own
/// predicate, so a single condvar is shared by all conditions guarded by `T`.
pub struct Monitor<T> {
    lock: Mutex<T>,
    condvar: Condvar,
}

impl<T> Monitor<T> {
    pub fn new(val: T) -> Self {
        Self {
            lock: Mutex::new(val),
            condvar: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MonitorLock<'_, T> {
        MonitorLock {
            lock: self.lock.lock(),
            condvar: &self.condvar,
        }
    }

    pub fn notify_all(&self) -> usize {
        self.condvar.notify_all()
    }
}

impl<T: Default> Default for Monitor<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct MonitorLock<'a, T> {
    lock: MutexGuard<'a, T>,
    condvar: &'a Condvar,
}

impl<'a, T> MonitorLock<'a, T> {
    pub fn wait(&mut self) {
        self.condvar.wait(&mut self.lock);
    }

    pub fn wait_timeout(&mut self, timeout: Duration) -> WaitTimeoutResult {
        self.condvar.wait_for(&mut self.lock, timeout)
    }

    pub fn wait_until(&mut self, deadline: Instant) -> WaitTimeoutResult {
        self.condvar.wait_until(&mut self.lock, deadline)
    }

    /// Temporarily releases the lock while `f` runs.
    pub fn unlocked<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        MutexGuard::unlocked(&mut self.lock, f)
    }

    pub fn notify_one(&self) -> bool {
        self.condvar.notify_one()
    }

    pub fn notify_all(&self) -> usize {
        self.condvar.notify_all()
    }
}

impl<'a, T> Deref for MonitorLock<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.lock
    }
}

impl<'a, T> DerefMut for MonitorLock<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.lock
    }
}

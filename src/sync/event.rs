//! Waitable events used by the collector to park its own threads.
//!
//! An event is created uninitialized and must be initialized with one of the
//! `create_*` calls. Operations on an uninitialized or closed event report
//! failure instead of panicking.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{
    sync::monitor::Monitor,
    thread::{self, PreemptiveScope},
};

/// Timeout value meaning "wait forever".
pub const INFINITE: u32 = u32::MAX;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WaitResult {
    Signaled,
    TimedOut,
    Failed,
}

impl WaitResult {
    /// Win32-style status code.
    pub const fn code(self) -> u32 {
        match self {
            WaitResult::Signaled => 0,
            WaitResult::TimedOut => 0x102,
            WaitResult::Failed => u32::MAX,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ResetMode {
    /// Stays signaled until reset; releases every waiter.
    Manual,
    /// A successful wait consumes the signal; releases one waiter.
    Auto,
}

struct EventState {
    signaled: bool,
    closed: bool,
}

struct EventCore {
    mode: ResetMode,
    os_event: bool,
    state: Monitor<EventState>,
}

impl EventCore {
    fn new(mode: ResetMode, os_event: bool, initial: bool) -> Self {
        Self {
            mode,
            os_event,
            state: Monitor::new(EventState {
                signaled: initial,
                closed: false,
            }),
        }
    }

    fn set(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.signaled = true;
        match self.mode {
            ResetMode::Manual => {
                state.notify_all();
            }
            ResetMode::Auto => {
                state.notify_one();
            }
        }
        true
    }

    fn reset(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.signaled = false;
        true
    }

    fn wait(&self, timeout: Option<Duration>) -> WaitResult {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return WaitResult::Failed;
            }

            if state.signaled {
                if self.mode == ResetMode::Auto {
                    state.signaled = false;
                }
                return WaitResult::Signaled;
            }

            match deadline {
                None => state.wait(),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return WaitResult::TimedOut;
                    }
                    state.wait_until(deadline);
                }
            }
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.notify_all();
    }
}

pub struct BlockingEvent {
    core: Mutex<Option<Arc<EventCore>>>,
}

impl BlockingEvent {
    pub fn new() -> Self {
        Self {
            core: Mutex::new(None),
        }
    }

    pub fn create_manual(&self, initial: bool) -> bool {
        self.create(ResetMode::Manual, false, initial)
    }

    pub fn create_auto(&self, initial: bool) -> bool {
        self.create(ResetMode::Auto, false, initial)
    }

    /// OS events never change the waiter's GC mode.
    pub fn create_os_manual(&self, initial: bool) -> bool {
        self.create(ResetMode::Manual, true, initial)
    }

    pub fn create_os_auto(&self, initial: bool) -> bool {
        self.create(ResetMode::Auto, true, initial)
    }

    fn create(&self, mode: ResetMode, os_event: bool, initial: bool) -> bool {
        let mut core = self.core.lock();
        if core.is_some() {
            log::warn!(target: "gc-event", "event already initialized");
            return false;
        }
        *core = Some(Arc::new(EventCore::new(mode, os_event, initial)));
        log::trace!(target: "gc-event", "created {:?} event (os: {}, initial: {})", mode, os_event, initial);
        true
    }

    pub fn is_valid(&self) -> bool {
        self.core.lock().is_some()
    }

    pub fn set(&self) -> bool {
        self.core().map_or(false, |core| core.set())
    }

    pub fn reset(&self) -> bool {
        self.core().map_or(false, |core| core.reset())
    }

    /// Blocks until the event is signaled or `timeout_ms` elapses.
    ///
    /// A cooperative runtime thread waiting on a non-OS event is switched to
    /// preemptive mode for the duration of the wait, so it never holds up a
    /// collection. `alertable` is accepted for interface compatibility; there
    /// is no APC-style delivery, so it has no effect.
    pub fn wait(&self, timeout_ms: u32, alertable: bool) -> WaitResult {
        let core = match self.core() {
            Some(core) => core,
            None => return WaitResult::Failed,
        };
        let _ = alertable;

        let timeout = (timeout_ms != INFINITE).then(|| Duration::from_millis(timeout_ms as u64));
        if core.os_event {
            return core.wait(timeout);
        }

        let current = thread::current();
        let _scope = current
            .as_deref()
            .filter(|thread| thread.is_preemptive_disabled())
            .map(PreemptiveScope::new);
        core.wait(timeout)
    }

    /// Releases the event. Blocked waiters return [`WaitResult::Failed`].
    /// Closing twice is a no-op.
    pub fn close(&self) {
        if let Some(core) = self.core.lock().take() {
            core.close();
            log::trace!(target: "gc-event", "closed {:?} event", core.mode);
        }
    }

    fn core(&self) -> Option<Arc<EventCore>> {
        self.core.lock().clone()
    }
}

impl Default for BlockingEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BlockingEvent {
    fn drop(&mut self) {
        self.close();
    }
}

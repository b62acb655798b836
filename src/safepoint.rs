//! Stop-the-world suspension.
//!
//! Mutators poll a global trap counter: on every transition back into
//! cooperative mode and at explicit safe points. The suspending thread bumps
//! the counter and then waits until every other registered thread is either
//! preemptive or parked at a safe point.
//!
//! Ordering: a mutator stores its mode and then loads the trap counter; the
//! suspender stores the trap counter and then loads each mode. Both sides use
//! `SeqCst`, so at least one of them observes the other and a thread can never
//! slip into cooperative code unnoticed.

use std::{
    sync::Arc,
    thread::ThreadId,
    time::{Duration, Instant},
};

use parking_lot_core::SpinWait;

use crate::{
    collector::{handle_fatal_error, FATAL_NESTED_SUSPEND, FATAL_RESTART_WITHOUT_SUSPEND},
    error::EnvError,
    sync::{
        monitor::{Monitor, MonitorLock},
        shared_vars::{SharedCounter, SharedFlag},
    },
    thread::{self, registry::ThreadRegistry, GcMode, RuntimeThread},
};

/// Why the world is being stopped.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SuspendReason {
    ForGc,
    ForGcPrep,
    ForAppDomainShutdown,
    ForShutdown,
    ForDebugger,
    ForDebuggerSweep,
    Other,
}

/// Logs the duration of a pause when dropped.
pub struct PausePhase {
    reason: SuspendReason,
    start: Instant,
}

impl PausePhase {
    pub fn new(reason: SuspendReason) -> Self {
        Self {
            reason,
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for PausePhase {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        log::info!(target: "gc", "Pause {:?} {}ms", self.reason, elapsed.as_micros() as f64 / 1000.0);
    }
}

#[derive(Default)]
pub(crate) struct PauseState {
    active: bool,
    suspender: Option<ThreadId>,
    reason: Option<SuspendReason>,
    phase: Option<PausePhase>,
    pauses: u64,
}

pub struct SuspensionCoordinator {
    trap_returning_threads: SharedCounter,
    gc_in_progress: SharedFlag,
    state: Monitor<PauseState>,
    warn_timeout: Duration,
    spin: bool,
}

impl SuspensionCoordinator {
    pub fn new(warn_timeout: Duration) -> Self {
        Self {
            trap_returning_threads: SharedCounter::new(),
            gc_in_progress: SharedFlag::new(),
            state: Monitor::new(PauseState::default()),
            warn_timeout,
            spin: num_cpus::get() > 1,
        }
    }

    /// True while a suspension is pending or running.
    #[inline]
    pub fn trap_returning_threads(&self) -> bool {
        self.trap_returning_threads.is_set()
    }

    #[inline]
    pub fn gc_in_progress(&self) -> bool {
        self.gc_in_progress.is_set()
    }

    /// Number of completed pauses.
    pub fn pauses(&self) -> u64 {
        self.state.lock().pauses
    }

    pub fn current_reason(&self) -> Option<SuspendReason> {
        self.state.lock().reason
    }

    /// True if the calling OS thread is the one that stopped the world.
    pub fn is_current_suspender(&self) -> bool {
        let me = std::thread::current().id();
        self.state.lock().suspender == Some(me)
    }

    /// Stops every cooperative thread in `threads` except the caller.
    ///
    /// Returns once each registered thread is preemptive or parked at a safe
    /// point. If another thread is already running a pause, the caller parks
    /// until that pause ends and then starts its own.
    pub fn suspend_all(&self, threads: &ThreadRegistry, reason: SuspendReason) {
        let me = std::thread::current().id();
        let start = Instant::now();
        let mut state = self.state.lock();

        if state.active {
            if state.suspender == Some(me) {
                drop(state);
                handle_fatal_error(FATAL_NESTED_SUSPEND);
            }

            let current = self.cooperative_current();
            Self::wait_for_pause_end(&mut state, current.as_deref());
        }

        state.active = true;
        state.suspender = Some(me);
        state.reason = Some(reason);
        state.phase = Some(PausePhase::new(reason));
        self.gc_in_progress.set();
        self.trap_returning_threads.increment();

        log::debug!(target: "gc-safepoint", "suspending runtime for {:?}", reason);

        let mut spinner = SpinWait::new();
        let mut warned = false;
        let stopped = loop {
            let mut pending = 0;
            let mut others = 0;
            for thread in threads.iter() {
                if thread.os_id() == me {
                    continue;
                }
                others += 1;
                if thread.owes_check_in() {
                    pending += 1;
                }
            }

            if pending == 0 {
                break others;
            }

            if !warned && start.elapsed() > self.warn_timeout {
                self.report_stragglers(threads, me, start);
                warned = true;
            }

            if self.spin && state.unlocked(|| spinner.spin()) {
                continue;
            }

            state.wait_timeout(Duration::from_millis(10));
        };

        if warned {
            log::warn!(target: "gc-safepoint", "suspension completed after {} ms", start.elapsed().as_millis());
        }
        log::debug!(target: "gc-safepoint", "stopped the world ({} thread(s)) in {} ms", stopped, start.elapsed().as_millis());
    }

    fn report_stragglers(&self, threads: &ThreadRegistry, me: ThreadId, start: Instant) {
        log::warn!(
            target: "gc-safepoint",
            "suspension taking longer than expected ({} ms, {} thread(s) registered)",
            start.elapsed().as_millis(),
            threads.len()
        );
        for thread in threads.iter() {
            if thread.os_id() != me && thread.owes_check_in() {
                log::warn!(target: "gc-safepoint", "  {} ({:?}) has not reached a safe point", thread.handle(), thread.name());
            }
        }
    }

    /// Releases every thread parked by the pause started with [`Self::suspend_all`].
    pub fn resume_all(&self, finished_gc: bool) {
        let me = std::thread::current().id();
        let mut state = self.state.lock();

        if !state.active || state.suspender != Some(me) {
            drop(state);
            handle_fatal_error(FATAL_RESTART_WITHOUT_SUSPEND);
        }

        self.trap_returning_threads.decrement();
        self.gc_in_progress.unset();
        state.active = false;
        state.suspender = None;
        state.reason = None;
        state.pauses += 1;
        let phase = state.phase.take();
        state.notify_all();
        drop(state);

        log::debug!(target: "gc-safepoint", "resumed runtime (finished gc: {})", finished_gc);
        drop(phase);
    }

    /// Locks the pause state once no pause is running. Holding the returned
    /// lock keeps new pauses from starting, which is what attach and detach
    /// need to change the registry.
    ///
    /// A cooperative registered caller is parked at a safe point while it
    /// waits, so it never holds up the pause it is waiting on.
    pub(crate) fn lock_quiescent(&self) -> Result<MonitorLock<'_, PauseState>, EnvError> {
        let current = self.cooperative_current();
        self.lock_quiescent_as(std::thread::current().id(), current.as_deref())
    }

    /// [`Self::lock_quiescent`] for an explicit caller identity. Used from
    /// thread-exit paths where the current-thread accessors are gone.
    pub(crate) fn lock_quiescent_as(
        &self,
        me: ThreadId,
        parked: Option<&RuntimeThread>,
    ) -> Result<MonitorLock<'_, PauseState>, EnvError> {
        let mut state = self.state.lock();
        if state.suspender == Some(me) {
            return Err(EnvError::PauseInProgress);
        }

        Self::wait_for_pause_end(&mut state, parked);
        Ok(state)
    }

    /// The calling thread, if it is registered here and cooperative.
    fn cooperative_current(&self) -> Option<Arc<RuntimeThread>> {
        thread::current().filter(|t| t.belongs_to(self) && t.gc_mode() == GcMode::Cooperative)
    }

    /// Waits out someone else's pause. `parked` is checked in at a safe
    /// point for the duration.
    fn wait_for_pause_end(state: &mut MonitorLock<'_, PauseState>, parked: Option<&RuntimeThread>) {
        if !state.active {
            return;
        }

        if let Some(thread) = parked {
            thread.set_at_safe_point(true);
            state.notify_all();
        }
        while state.active {
            state.wait();
        }
        if let Some(thread) = parked {
            thread.set_at_safe_point(false);
        }
    }

    /// Wakes a suspender that may be waiting on a mode change.
    pub(crate) fn notify_mode_change(&self) {
        let state = self.state.lock();
        state.notify_all();
    }

    /// Parks `thread` at a safe point until the running pause ends.
    pub(crate) fn park_at_safe_point(&self, thread: &RuntimeThread) {
        let me = thread.os_id();
        let mut state = self.state.lock();
        if !state.active || state.suspender == Some(me) {
            return;
        }

        if thread.gc_mode() != GcMode::Cooperative {
            return;
        }

        thread.set_at_safe_point(true);
        state.notify_all();
        while state.active && state.suspender != Some(me) {
            state.wait();
        }
        thread.set_at_safe_point(false);
    }

    /// Slow path of a preemptive -> cooperative switch that observed a
    /// pending suspension. The thread backs out to preemptive, waits for the
    /// pause to end and re-enters cooperative mode under the pause lock, so
    /// no new pause can start between the store and the return.
    pub(crate) fn rare_disable_preemptive(&self, thread: &RuntimeThread) {
        let me = thread.os_id();
        let mut state = self.state.lock();
        if !state.active || state.suspender == Some(me) {
            return;
        }

        thread.store_mode(GcMode::Preemptive);
        state.notify_all();
        log::trace!(target: "gc-safepoint", "{} waiting for pause to end before entering cooperative mode", thread.handle());

        while state.active {
            state.wait();
        }
        thread.store_mode(GcMode::Cooperative);
    }
}

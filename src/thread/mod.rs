//! Runtime threads and their GC mode.
//!
//! Every thread that runs managed code is attached to a [`crate::GcEnv`] and
//! owns a [`RuntimeThread`]. The thread is either *cooperative* (it may touch
//! heap references, so the collector must wait for it) or *preemptive* (it
//! promises not to, so the collector may run concurrently with it).

pub mod alloc_context;
pub mod registry;
pub mod roots;

use std::{
    cell::RefCell,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
    thread::ThreadId,
};

use atomic::Atomic;
use parking_lot::{Mutex, MutexGuard};

use crate::{
    collector::{PromoteFlags, RootVisitor, ScanContext},
    gcenv::GcEnv,
    safepoint::SuspensionCoordinator,
};

use self::{
    alloc_context::AllocContext,
    roots::{GcRoot, RootEntry},
};

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcMode {
    /// Running managed code; must be stopped before a collection proceeds.
    Cooperative = 0,
    /// Running native or blocking code; ignored by suspension.
    Preemptive = 1,
}

/// Opaque per-process thread identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ThreadHandle(u64);

impl ThreadHandle {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

pub struct RuntimeThread {
    handle: ThreadHandle,
    os_id: ThreadId,
    name: Option<String>,
    created_by_collector: bool,
    gc_mode: Atomic<GcMode>,
    at_safe_point: AtomicBool,
    detached: AtomicBool,
    alloc_context: Mutex<AllocContext>,
    roots: Mutex<Vec<RootEntry>>,
    coordinator: Arc<SuspensionCoordinator>,
    pub(crate) next: Mutex<Option<Arc<RuntimeThread>>>,
}

impl RuntimeThread {
    /// New threads start cooperative: attaching means the caller is about to
    /// run managed code.
    pub(crate) fn new(coordinator: Arc<SuspensionCoordinator>, created_by_collector: bool) -> Self {
        let current = std::thread::current();
        Self {
            handle: ThreadHandle::next(),
            os_id: current.id(),
            name: current.name().map(String::from),
            created_by_collector,
            gc_mode: Atomic::new(GcMode::Cooperative),
            at_safe_point: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            alloc_context: Mutex::new(AllocContext::new()),
            roots: Mutex::new(Vec::new()),
            coordinator,
            next: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> ThreadHandle {
        self.handle
    }

    pub fn os_id(&self) -> ThreadId {
        self.os_id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_created_by_collector(&self) -> bool {
        self.created_by_collector
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub(crate) fn mark_detached(&self) {
        self.detached.store(true, Ordering::Release);
    }

    pub(crate) fn belongs_to(&self, coordinator: &SuspensionCoordinator) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.coordinator), coordinator)
    }

    #[inline]
    pub fn gc_mode(&self) -> GcMode {
        self.gc_mode.load(Ordering::SeqCst)
    }

    /// True while the thread runs cooperatively.
    #[inline]
    pub fn is_preemptive_disabled(&self) -> bool {
        self.gc_mode() == GcMode::Cooperative
    }

    pub(crate) fn store_mode(&self, mode: GcMode) {
        self.gc_mode.store(mode, Ordering::SeqCst);
    }

    pub fn at_safe_point(&self) -> bool {
        self.at_safe_point.load(Ordering::SeqCst)
    }

    pub(crate) fn set_at_safe_point(&self, value: bool) {
        self.at_safe_point.store(value, Ordering::SeqCst);
    }

    /// True if a pending suspension still waits on this thread.
    pub(crate) fn owes_check_in(&self) -> bool {
        self.is_preemptive_disabled() && !self.at_safe_point()
    }

    /// True when the thread should stop at its next safe point.
    pub fn catch_at_safe_point(&self) -> bool {
        self.coordinator.trap_returning_threads() && self.owes_check_in()
    }

    /// Switches to preemptive mode. Never blocks; repeated calls are no-ops.
    pub fn enable_preemptive(&self) {
        debug_assert_eq!(std::thread::current().id(), self.os_id, "mode switch on a foreign thread");
        self.store_mode(GcMode::Preemptive);
        if self.coordinator.trap_returning_threads() {
            self.coordinator.notify_mode_change();
        }
    }

    /// Switches to cooperative mode, blocking while a suspension started by
    /// another thread is pending or running.
    pub fn disable_preemptive(&self) {
        debug_assert_eq!(std::thread::current().id(), self.os_id, "mode switch on a foreign thread");
        self.store_mode(GcMode::Cooperative);
        if self.coordinator.trap_returning_threads() {
            self.coordinator.rare_disable_preemptive(self);
        }
    }

    /// Polls for a pending suspension and parks until it is over.
    #[inline]
    pub fn safepoint(&self) {
        if self.coordinator.trap_returning_threads() {
            self.coordinator.park_at_safe_point(self);
        }
    }

    pub fn alloc_context(&self) -> MutexGuard<'_, AllocContext> {
        self.alloc_context.lock()
    }

    /// Registers a root slot holding `value`. The slot is reported to the
    /// collector until the returned guard is dropped.
    pub fn add_root(&self, value: usize, flags: PromoteFlags) -> GcRoot<'_> {
        let slot = Arc::new(AtomicUsize::new(value));
        self.roots.lock().push(RootEntry {
            slot: slot.clone(),
            flags,
        });
        GcRoot::new(self, slot)
    }

    pub(crate) fn remove_root(&self, slot: &Arc<AtomicUsize>) {
        let mut roots = self.roots.lock();
        if let Some(index) = roots.iter().rposition(|entry| Arc::ptr_eq(&entry.slot, slot)) {
            roots.swap_remove(index);
        }
    }

    pub fn root_count(&self) -> usize {
        self.roots.lock().len()
    }

    /// Reports every non-null root of this thread. Returns the number reported.
    pub(crate) fn scan_roots(&self, visitor: &mut dyn RootVisitor, sc: &ScanContext) -> usize {
        let roots = self.roots.lock();
        let mut reported = 0;
        for entry in roots.iter() {
            if entry.slot.load(Ordering::Acquire) == 0 {
                continue;
            }
            visitor.visit_root(&entry.slot, sc, entry.flags);
            reported += 1;
        }
        reported
    }
}

impl fmt::Debug for RuntimeThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeThread")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("gc_mode", &self.gc_mode())
            .field("at_safe_point", &self.at_safe_point())
            .finish()
    }
}

struct CurrentSlot {
    thread: Arc<RuntimeThread>,
    env: Weak<GcEnv>,
}

impl Drop for CurrentSlot {
    fn drop(&mut self) {
        if self.thread.is_detached() {
            return;
        }

        // Exiting without detaching: never hold up a pause, then unregister.
        log::warn!(target: "gc-thread", "{} exited while attached", self.thread.handle());
        self.thread.store_mode(GcMode::Preemptive);
        self.thread.coordinator.notify_mode_change();
        if let Some(env) = self.env.upgrade() {
            env.detach_exited(&self.thread);
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<CurrentSlot>> = const { RefCell::new(None) };
}

/// The runtime thread bound to the calling OS thread, if any.
pub fn current() -> Option<Arc<RuntimeThread>> {
    CURRENT
        .try_with(|slot| slot.borrow().as_ref().map(|s| s.thread.clone()))
        .ok()
        .flatten()
}

pub fn is_attached() -> bool {
    current().is_some()
}

/// Binds `thread` to the calling OS thread. If the OS thread exits while
/// still attached, `thread` is detached from `env`.
pub(crate) fn bind_current(thread: Arc<RuntimeThread>, env: Weak<GcEnv>) {
    let previous = CURRENT.with(|slot| slot.replace(Some(CurrentSlot { thread, env })));
    drop(previous);
}

pub(crate) fn unbind_current() {
    let previous = CURRENT.with(|slot| slot.take());
    drop(previous);
}

/// Runs the enclosed code preemptively, restoring cooperative mode on drop
/// if the thread was cooperative on entry.
pub struct PreemptiveScope<'a> {
    thread: &'a RuntimeThread,
    was_cooperative: bool,
}

impl<'a> PreemptiveScope<'a> {
    pub fn new(thread: &'a RuntimeThread) -> Self {
        let was_cooperative = thread.is_preemptive_disabled();
        if was_cooperative {
            thread.enable_preemptive();
        }
        Self {
            thread,
            was_cooperative,
        }
    }
}

impl<'a> Drop for PreemptiveScope<'a> {
    fn drop(&mut self) {
        if self.was_cooperative {
            self.thread.disable_preemptive();
        }
    }
}

/// Runs the enclosed code cooperatively. Entering may block while a pause
/// is in progress.
pub struct CooperativeScope<'a> {
    thread: &'a RuntimeThread,
    was_preemptive: bool,
}

impl<'a> CooperativeScope<'a> {
    pub fn new(thread: &'a RuntimeThread) -> Self {
        let was_preemptive = !thread.is_preemptive_disabled();
        if was_preemptive {
            thread.disable_preemptive();
        }
        Self {
            thread,
            was_preemptive,
        }
    }
}

impl<'a> Drop for CooperativeScope<'a> {
    fn drop(&mut self) {
        if self.was_preemptive {
            self.thread.enable_preemptive();
        }
    }
}

//! The boundary between the collector and the execution environment.
//!
//! Outward calls (collector to environment) are methods on [`GcEnv`]: root
//! scanning, allocation-context enumeration, configuration lookups, thread
//! identity queries, background thread creation, write barrier updates and
//! fatal error escalation. Inward calls (environment to collector) go through
//! the [`GcHeap`] trait.

use std::{
    cell::Cell,
    ptr::NonNull,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::MutexGuard;

use crate::{
    gcenv::GcEnv,
    safepoint::SuspendReason,
    thread::{alloc_context::AllocContext, RuntimeThread},
    write_barrier::{WriteBarrierOp, WriteBarrierParameters},
    EnvError,
};

pub const FATAL_NESTED_SUSPEND: u32 = 0x8013_1501;
pub const FATAL_RESTART_WITHOUT_SUSPEND: u32 = 0x8013_1502;
pub const FATAL_SCAN_OUTSIDE_PAUSE: u32 = 0x8013_1503;

/// Terminates the process. Reached only when GC-mode or suspension state
/// can no longer be trusted.
#[cold]
pub fn handle_fatal_error(code: u32) -> ! {
    log::error!(target: "gc", "fatal error {:#010x}", code);
    std::process::abort()
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
pub struct PromoteFlags(u32);

impl PromoteFlags {
    pub const NONE: Self = Self(0);
    /// The slot may point into the middle of an object.
    pub const INTERIOR: Self = Self(0x1);
    /// The object must not move.
    pub const PINNED: Self = Self(0x2);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
pub struct AllocFlags(u32);

impl AllocFlags {
    pub const NONE: Self = Self(0);
    pub const FINALIZE: Self = Self(0x1);
    pub const CONTAINS_REF: Self = Self(0x2);
    pub const LARGE_OBJECT: Self = Self(0x4);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CollectionMode {
    Default,
    Blocking,
    NonBlocking,
    Optimized,
    Compacting,
}

/// Per-scan state handed to root callbacks.
#[derive(Debug, Default)]
pub struct ScanContext {
    pub thread_under_crawl: Option<Arc<RuntimeThread>>,
    pub thread_number: usize,
    /// Marking (true) or relocating (false).
    pub promotion: bool,
    pub concurrent: bool,
}

impl ScanContext {
    pub fn new(promotion: bool) -> Self {
        Self {
            promotion,
            ..Default::default()
        }
    }
}

pub trait RootVisitor {
    fn visit_root(&mut self, slot: &AtomicUsize, sc: &ScanContext, flags: PromoteFlags);
}

impl<F> RootVisitor for F
where
    F: FnMut(&AtomicUsize, &ScanContext, PromoteFlags),
{
    fn visit_root(&mut self, slot: &AtomicUsize, sc: &ScanContext, flags: PromoteFlags) {
        self(slot, sc, flags)
    }
}

pub trait AllocContextVisitor {
    fn visit_alloc_context(&mut self, ctx: &mut AllocContext);
}

impl<F> AllocContextVisitor for F
where
    F: FnMut(&mut AllocContext),
{
    fn visit_alloc_context(&mut self, ctx: &mut AllocContext) {
        self(ctx)
    }
}

/// The collector as seen from the environment.
pub trait GcHeap: Send + Sync {
    /// Called once after the environment is constructed.
    fn initialize(&self, env: &GcEnv) -> Result<(), EnvError> {
        let _ = env;
        Ok(())
    }

    /// Slow path: refill `ctx` or satisfy `size` directly. `None` means the
    /// heap is exhausted; the caller may collect and retry.
    fn alloc(
        &self,
        env: &GcEnv,
        ctx: &mut AllocContext,
        size: usize,
        flags: AllocFlags,
    ) -> Option<NonNull<u8>>;

    /// Returns the unused part of `ctx` to the heap.
    fn fix_alloc_context(&self, ctx: &mut AllocContext);

    /// Runs a collection. `None` condemns every generation.
    fn garbage_collect(&self, env: &GcEnv, generation: Option<u32>, mode: CollectionMode) -> bool;

    fn max_generation(&self) -> u32;
}

impl<H: GcHeap + ?Sized> GcHeap for Arc<H> {
    fn initialize(&self, env: &GcEnv) -> Result<(), EnvError> {
        (**self).initialize(env)
    }

    fn alloc(
        &self,
        env: &GcEnv,
        ctx: &mut AllocContext,
        size: usize,
        flags: AllocFlags,
    ) -> Option<NonNull<u8>> {
        (**self).alloc(env, ctx, size, flags)
    }

    fn fix_alloc_context(&self, ctx: &mut AllocContext) {
        (**self).fix_alloc_context(ctx)
    }

    fn garbage_collect(&self, env: &GcEnv, generation: Option<u32>, mode: CollectionMode) -> bool {
        (**self).garbage_collect(env, generation, mode)
    }

    fn max_generation(&self) -> u32 {
        (**self).max_generation()
    }
}

thread_local! {
    static SCANNING: Cell<bool> = const { Cell::new(false) };
}

impl GcEnv {
    /// Reports every root of every registered thread to `promote`.
    ///
    /// Only valid while the world is stopped.
    pub fn gc_scan_roots(
        &self,
        promote: &mut dyn RootVisitor,
        condemned: u32,
        max_gen: u32,
        sc: &mut ScanContext,
    ) {
        if !self.gc_in_progress() {
            handle_fatal_error(FATAL_SCAN_OUTSIDE_PAUSE);
        }

        SCANNING.with(|scanning| scanning.set(true));
        let mut total = 0;
        for (index, thread) in self.registry().iter().enumerate() {
            sc.thread_number = index;
            sc.thread_under_crawl = Some(thread.clone());
            let reported = thread.scan_roots(promote, sc);
            log::trace!(target: "gc", "{}: {} root(s) (gen {}/{})", thread.handle(), reported, condemned, max_gen);
            total += reported;
        }
        sc.thread_under_crawl = None;
        SCANNING.with(|scanning| scanning.set(false));

        log::debug!(target: "gc", "scanned {} root(s) for gen {}", total, condemned);
    }

    pub fn gc_enum_alloc_contexts(&self, visitor: &mut dyn AllocContextVisitor) {
        for thread in self.registry().iter() {
            visitor.visit_alloc_context(&mut thread.alloc_context());
        }
    }

    pub fn get_alloc_context<'a>(&self, thread: &'a RuntimeThread) -> MutexGuard<'a, AllocContext> {
        thread.alloc_context()
    }

    pub fn gc_start_work(&self, condemned: u32, max_gen: u32) {
        self.stats().gc_started(condemned);
        log::debug!(target: "gc", "start gen {}/{}", condemned, max_gen);
    }

    pub fn after_gc_scan_roots(&self, condemned: u32, max_gen: u32, sc: &mut ScanContext) {
        log::trace!(target: "gc", "roots scanned gen {}/{} (promotion: {})", condemned, max_gen, sc.promotion);
    }

    pub fn gc_done(&self, condemned: u32) {
        self.stats().gc_finished();
        log::debug!(target: "gc", "done gen {}", condemned);
    }

    /// True inside a root-scan callback on the calling thread.
    pub fn is_scanning_roots(&self) -> bool {
        SCANNING.with(|scanning| scanning.get())
    }

    /// Wakes the finalizer thread if finalizable objects were found.
    pub fn enable_finalization(&self, found_finalizers: bool) {
        if found_finalizers {
            self.finalizer_event().set();
        }
    }

    pub fn force_full_gc_to_be_blocking(&self) -> bool {
        self.config().force_blocking
    }

    pub fn get_boolean_config_value(&self, key: &str) -> Option<bool> {
        let value = self.config_source().get_bool(key);
        log::trace!(target: "gc-config", "{} -> {:?}", key, value);
        value
    }

    pub fn get_int_config_value(&self, key: &str) -> Option<i64> {
        let value = self.config_source().get_int(key);
        log::trace!(target: "gc-config", "{} -> {:?}", key, value);
        value
    }

    pub fn get_string_config_value(&self, key: &str) -> Option<String> {
        let value = self.config_source().get_string(key);
        log::trace!(target: "gc-config", "{} -> {:?}", key, value);
        value
    }

    /// True for collector-owned threads and for whichever thread is
    /// currently running a pause.
    pub fn is_gc_thread(&self) -> bool {
        self.was_current_thread_created_by_gc() || self.coordinator().is_current_suspender()
    }

    pub fn was_current_thread_created_by_gc(&self) -> bool {
        self.gc_thread_flags()
            .get()
            .map_or(false, |flag| flag.get())
    }

    /// Starts a collector background thread. Suspendable threads are
    /// attached for the duration of `start`. Returns false if the OS thread
    /// could not be created.
    pub fn create_thread<F>(self: &Arc<Self>, start: F, is_suspendable: bool, name: &str) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let env = self.clone();
        let builder = std::thread::Builder::new().name(name.to_string());
        let spawned = builder.spawn(move || {
            let flag = env.gc_thread_flags().get_or(|| Cell::new(false));
            flag.set(true);

            let attached = is_suspendable
                && match env.attach_thread(true) {
                    Ok(_) => true,
                    Err(err) => {
                        log::error!(target: "gc-thread", "failed to attach collector thread: {}", err);
                        false
                    }
                };

            let _exit = CollectorThreadExit {
                env: &env,
                flag,
                attached,
            };
            start();
        });

        match spawned {
            Ok(_) => {
                log::debug!(target: "gc-thread", "created collector thread {:?} (suspendable: {})", name, is_suspendable);
                true
            }
            Err(err) => {
                log::error!(target: "gc-thread", "failed to create thread {:?}: {}", name, err);
                false
            }
        }
    }

    /// Publishes new write barrier bounds. A resize while the runtime is
    /// running stops the world around the update.
    pub fn stomp_write_barrier(&self, args: &WriteBarrierParameters) {
        let needs_pause = args.operation == WriteBarrierOp::StompResize
            && !args.is_runtime_suspended
            && !self.coordinator().is_current_suspender();

        if needs_pause {
            self.suspend_ee(SuspendReason::ForGcPrep);
            self.write_barrier().stomp(args);
            self.restart_ee(false);
        } else {
            self.write_barrier().stomp(args);
        }
    }
}

/// Undoes collector-thread setup when `start` returns or unwinds.
struct CollectorThreadExit<'a> {
    env: &'a GcEnv,
    flag: &'a Cell<bool>,
    attached: bool,
}

impl<'a> Drop for CollectorThreadExit<'a> {
    fn drop(&mut self) {
        if self.attached {
            if let Err(err) = self.env.detach_current_thread() {
                log::warn!(target: "gc-thread", "failed to detach collector thread: {}", err);
            }
        }
        self.flag.set(false);
    }
}

/// Counters maintained across collections.
#[derive(Default)]
pub struct GcStats {
    collections: AtomicUsize,
    last_condemned: AtomicUsize,
    in_progress: AtomicUsize,
}

impl GcStats {
    fn gc_started(&self, condemned: u32) {
        self.last_condemned.store(condemned as usize, Ordering::Relaxed);
        self.in_progress.fetch_add(1, Ordering::AcqRel);
    }

    fn gc_finished(&self) {
        self.in_progress.fetch_sub(1, Ordering::AcqRel);
        self.collections.fetch_add(1, Ordering::AcqRel);
    }

    pub fn collections(&self) -> usize {
        self.collections.load(Ordering::Acquire)
    }

    pub fn last_condemned(&self) -> usize {
        self.last_condemned.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::{
        env::{MapConfig, KEY_FORCE_BLOCKING},
        sync::event::{BlockingEvent, WaitResult, INFINITE},
        test_util::{test_env, test_env_with},
    };

    #[test]
    fn config_lookups_pass_through() {
        let env = test_env_with(
            MapConfig::new()
                .set("GCgen0size", "0x2000")
                .set("GCServer", "true")
                .set("GCName", "sample")
                .set(KEY_FORCE_BLOCKING, "1"),
        );
        assert_eq!(env.get_int_config_value("GCgen0size"), Some(0x2000));
        assert_eq!(env.get_boolean_config_value("GCServer"), Some(true));
        assert_eq!(env.get_string_config_value("GCName").as_deref(), Some("sample"));
        assert_eq!(env.get_int_config_value("GCMissing"), None);
        assert!(env.force_full_gc_to_be_blocking());
    }

    fn release_event() -> Arc<BlockingEvent> {
        let event = Arc::new(BlockingEvent::new());
        assert!(event.create_manual(false));
        event
    }

    #[test]
    fn scan_roots_reports_non_null_roots_of_every_thread() {
        let env = test_env();
        let release = release_event();
        let (ready_tx, ready_rx) = mpsc::channel();

        let workers = (0..3usize)
            .map(|i| {
                let env = env.clone();
                let release = release.clone();
                let ready_tx = ready_tx.clone();
                std::thread::spawn(move || {
                    let thread = env.attach_current_thread().unwrap();
                    let a = thread.add_root(0x1000 * (i + 1), PromoteFlags::NONE);
                    let b = thread.add_root(0, PromoteFlags::NONE);
                    let c = thread.add_root(0x10 + i, PromoteFlags::INTERIOR.union(PromoteFlags::PINNED));
                    ready_tx.send(()).unwrap();
                    // Cooperative wait: the event flips the thread to preemptive.
                    assert_eq!(release.wait(INFINITE, false), WaitResult::Signaled);
                    drop((a, b, c));
                    env.detach_current_thread().unwrap();
                })
            })
            .collect::<Vec<_>>();

        for _ in 0..3 {
            ready_rx.recv().unwrap();
        }

        env.suspend_ee(SuspendReason::ForGc);
        let mut seen = Vec::new();
        let mut pinned = 0;
        let mut sc = ScanContext::new(true);
        env.gc_scan_roots(
            &mut |slot: &AtomicUsize, sc: &ScanContext, flags: PromoteFlags| {
                assert!(sc.thread_under_crawl.is_some());
                if flags.contains(PromoteFlags::PINNED) {
                    pinned += 1;
                }
                seen.push(slot.load(Ordering::Relaxed));
            },
            0,
            2,
            &mut sc,
        );
        env.restart_ee(true);
        assert!(sc.thread_under_crawl.is_none());
        assert!(!env.is_scanning_roots());

        seen.sort();
        assert_eq!(seen, vec![0x10, 0x11, 0x12, 0x1000, 0x2000, 0x3000]);
        assert_eq!(pinned, 3);

        assert!(release.set());
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn enum_alloc_contexts_visits_every_thread() {
        let env = test_env();
        let release = release_event();
        let (ready_tx, ready_rx) = mpsc::channel();
        let workers = (0..2)
            .map(|_| {
                let env = env.clone();
                let release = release.clone();
                let ready_tx = ready_tx.clone();
                std::thread::spawn(move || {
                    env.attach_current_thread().unwrap();
                    env.alloc(24, AllocFlags::NONE).unwrap();
                    ready_tx.send(()).unwrap();
                    release.wait(INFINITE, false);
                    env.detach_current_thread().unwrap();
                })
            })
            .collect::<Vec<_>>();
        for _ in 0..2 {
            ready_rx.recv().unwrap();
        }

        env.suspend_ee(SuspendReason::ForGc);
        let mut visited = 0;
        env.gc_enum_alloc_contexts(&mut |ctx: &mut AllocContext| {
            assert_eq!(ctx.alloc_count(), 1);
            visited += 1;
        });
        env.restart_ee(true);
        assert_eq!(visited, 2);

        assert!(release.set());
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn collector_threads_are_flagged() {
        let env = test_env();
        assert!(!env.was_current_thread_created_by_gc());
        assert!(!env.is_gc_thread());

        let (tx, rx) = mpsc::channel();
        let inner = env.clone();
        assert!(env.create_thread(
            move || {
                let current = crate::thread::current().unwrap();
                tx.send((
                    inner.was_current_thread_created_by_gc(),
                    inner.is_gc_thread(),
                    current.is_created_by_collector(),
                    current.name().map(String::from),
                ))
                .unwrap();
            },
            true,
            "gc-worker",
        ));

        let (created_by_gc, is_gc, flagged, name) = rx.recv().unwrap();
        assert!(created_by_gc);
        assert!(is_gc);
        assert!(flagged);
        assert_eq!(name.as_deref(), Some("gc-worker"));
        assert!(!env.was_current_thread_created_by_gc());
    }

    #[test]
    fn panicking_collector_thread_is_detached() {
        let env = test_env();
        let (tx, rx) = mpsc::channel();
        assert!(env.create_thread(
            move || {
                tx.send(crate::thread::current().unwrap()).unwrap();
                panic!("collector thread failed");
            },
            true,
            "gc-failing",
        ));

        let thread = rx.recv().unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !thread.is_detached() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(thread.is_detached());
        assert!(env.registry().is_empty());
        assert!(!env.was_current_thread_created_by_gc());
        env.shutdown().unwrap();
    }

    #[test]
    fn suspender_counts_as_gc_thread() {
        let env = test_env();
        env.suspend_ee(SuspendReason::ForGc);
        assert!(env.is_gc_thread());
        env.restart_ee(true);
        assert!(!env.is_gc_thread());
    }

    #[test]
    fn running_resize_stomp_stops_the_world() {
        let env = test_env();
        let pauses = env.coordinator().pauses();
        env.stomp_write_barrier(&WriteBarrierParameters {
            lowest_address: 0x1000,
            highest_address: 0x9000,
            ..WriteBarrierParameters::new(WriteBarrierOp::StompResize)
        });
        assert_eq!(env.coordinator().pauses(), pauses + 1);
        assert!(env.write_barrier().in_heap(0x2000));

        env.stomp_write_barrier(&WriteBarrierParameters::new(WriteBarrierOp::SwitchToWriteWatch));
        assert_eq!(env.coordinator().pauses(), pauses + 1);
    }

    #[test]
    fn promote_flags_compose() {
        let flags = PromoteFlags::INTERIOR.union(PromoteFlags::PINNED);
        assert!(flags.contains(PromoteFlags::PINNED));
        assert!(flags.contains(PromoteFlags::INTERIOR));
        assert!(!PromoteFlags::NONE.contains(PromoteFlags::PINNED));
        assert_eq!(flags.bits(), 3);
    }
}

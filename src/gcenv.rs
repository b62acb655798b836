use std::{
    cell::Cell,
    ptr::NonNull,
    sync::{Arc, Weak},
    thread::JoinHandle,
    time::Duration,
};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use thread_local::ThreadLocal;

use crate::{
    collector::{AllocFlags, CollectionMode, GcHeap, GcStats},
    env::{ConfigSource, EnvConfig, GcConfig},
    error::EnvError,
    safepoint::{SuspendReason, SuspensionCoordinator},
    sync::{event::BlockingEvent, shared_vars::SharedFlag},
    thread::{
        self,
        alloc_context::{align_up, ALLOC_ALIGNMENT},
        registry::ThreadRegistry,
        CooperativeScope, RuntimeThread,
    },
    write_barrier::WriteBarrierState,
};

/// Owner of every piece of process-wide GC coordination state: the thread
/// registry, the suspension coordinator, configuration and the heap.
pub struct GcEnv {
    this: Weak<GcEnv>,
    config: GcConfig,
    config_source: Box<dyn ConfigSource>,
    coordinator: Arc<SuspensionCoordinator>,
    registry: ThreadRegistry,
    heap: Box<dyn GcHeap>,
    write_barrier: WriteBarrierState,
    finalizer_event: BlockingEvent,
    gc_thread_flags: ThreadLocal<Cell<bool>>,
    stats: GcStats,
    shut_down: SharedFlag,
}

impl GcEnv {
    pub fn new(heap: Box<dyn GcHeap>, config_source: Box<dyn ConfigSource>) -> Result<Arc<Self>, EnvError> {
        let config = GcConfig::resolve(&*config_source);
        let coordinator = Arc::new(SuspensionCoordinator::new(Duration::from_millis(
            config.suspend_warn_timeout_ms,
        )));

        let finalizer_event = BlockingEvent::new();
        if !finalizer_event.create_auto(false) {
            return Err(EnvError::EventCreation("finalizer"));
        }

        let env = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            config_source,
            coordinator,
            registry: ThreadRegistry::new(),
            heap,
            write_barrier: WriteBarrierState::new(),
            finalizer_event,
            gc_thread_flags: ThreadLocal::new(),
            stats: GcStats::default(),
            shut_down: SharedFlag::new(),
        });

        env.heap.initialize(&env)?;
        log::info!(target: "gc", "environment ready (max generation {})", env.heap.max_generation());
        Ok(env)
    }

    /// Environment backed by `GCENV_*` process environment variables.
    pub fn from_env(heap: Box<dyn GcHeap>) -> Result<Arc<Self>, EnvError> {
        Self::new(heap, Box::new(EnvConfig::new()))
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub(crate) fn config_source(&self) -> &dyn ConfigSource {
        &*self.config_source
    }

    pub fn coordinator(&self) -> &SuspensionCoordinator {
        &self.coordinator
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub fn heap(&self) -> &dyn GcHeap {
        &*self.heap
    }

    pub fn write_barrier(&self) -> &WriteBarrierState {
        &self.write_barrier
    }

    pub fn finalizer_event(&self) -> &BlockingEvent {
        &self.finalizer_event
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub(crate) fn gc_thread_flags(&self) -> &ThreadLocal<Cell<bool>> {
        &self.gc_thread_flags
    }

    pub fn gc_in_progress(&self) -> bool {
        self.coordinator.gc_in_progress()
    }

    pub fn trap_returning_threads(&self) -> bool {
        self.coordinator.trap_returning_threads()
    }

    fn owns(&self, thread: &RuntimeThread) -> bool {
        thread.belongs_to(&self.coordinator)
    }

    /// The calling thread's runtime thread, if it is attached to this environment.
    pub fn current_thread(&self) -> Result<Arc<RuntimeThread>, EnvError> {
        match thread::current() {
            None => Err(EnvError::NotAttached),
            Some(thread) if !self.owns(&thread) => Err(EnvError::ForeignThread),
            Some(thread) => Ok(thread),
        }
    }

    pub fn get_thread(&self) -> Option<Arc<RuntimeThread>> {
        self.current_thread().ok()
    }

    /// Registers the calling OS thread. The new thread is cooperative.
    pub fn attach_current_thread(&self) -> Result<Arc<RuntimeThread>, EnvError> {
        self.attach_thread(false)
    }

    pub(crate) fn attach_thread(&self, created_by_collector: bool) -> Result<Arc<RuntimeThread>, EnvError> {
        if thread::current().is_some() {
            return Err(EnvError::AlreadyAttached);
        }

        let thread = Arc::new(RuntimeThread::new(self.coordinator.clone(), created_by_collector));
        {
            let _quiescent = self.coordinator.lock_quiescent()?;
            thread.alloc_context().init();
            self.registry.push(thread.clone());
        }
        thread::bind_current(thread.clone(), self.this.clone());

        log::debug!(target: "gc-thread", "attached {} ({:?})", thread.handle(), thread.name());
        Ok(thread)
    }

    /// Unregisters the calling thread. Waits for a running pause to end;
    /// the thread running a pause cannot detach.
    pub fn detach_current_thread(&self) -> Result<(), EnvError> {
        let thread = self.current_thread()?;
        if self.coordinator.is_current_suspender() {
            return Err(EnvError::PauseInProgress);
        }

        thread.enable_preemptive();
        {
            let _quiescent = self.coordinator.lock_quiescent()?;
            self.unregister(&thread);
        }
        thread::unbind_current();

        log::debug!(target: "gc-thread", "detached {}", thread.handle());
        Ok(())
    }

    /// Detach path for a thread whose OS thread is exiting while still
    /// attached. The thread is already preemptive.
    pub(crate) fn detach_exited(&self, thread: &RuntimeThread) {
        match self.coordinator.lock_quiescent_as(thread.os_id(), None) {
            Ok(_quiescent) => {
                self.unregister(thread);
                log::debug!(target: "gc-thread", "detached exited {}", thread.handle());
            }
            Err(err) => {
                log::error!(target: "gc-thread", "{} exited during its own pause: {}", thread.handle(), err);
            }
        }
    }

    /// Must be called with the pause state locked and no pause running.
    fn unregister(&self, thread: &RuntimeThread) {
        self.heap.fix_alloc_context(&mut thread.alloc_context());
        self.registry.unlink(thread);
        thread.mark_detached();
    }

    pub fn suspend_ee(&self, reason: SuspendReason) {
        self.coordinator.suspend_all(&self.registry, reason);
    }

    pub fn restart_ee(&self, finished_gc: bool) {
        self.coordinator.resume_all(finished_gc);
    }

    /// Allocates `size` bytes for the calling thread. The fast path bumps the
    /// thread's allocation context; the slow path asks the heap and collects
    /// once before giving up.
    pub fn alloc(&self, size: usize, flags: AllocFlags) -> Result<NonNull<u8>, EnvError> {
        let thread = self.current_thread()?;
        let _managed = CooperativeScope::new(&thread);

        if self.gc_in_progress() {
            thread.safepoint();
        }

        let aligned = align_up(size.max(1), ALLOC_ALIGNMENT).ok_or(EnvError::OutOfMemory { size })?;

        if !flags.contains(AllocFlags::LARGE_OBJECT) {
            if let Some(ptr) = thread.alloc_context().allocate(aligned) {
                return Ok(ptr);
            }
        }

        for attempt in 0..2 {
            let result = {
                let mut ctx = thread.alloc_context();
                self.heap.alloc(self, &mut ctx, aligned, flags)
            };
            if let Some(ptr) = result {
                return Ok(ptr);
            }

            if attempt == 0 {
                log::debug!(target: "gc", "allocation of {} bytes failed, collecting", aligned);
                self.collect(None, CollectionMode::Blocking);
            }
        }

        log::warn!(target: "gc", "out of memory allocating {} bytes", aligned);
        Err(EnvError::OutOfMemory { size })
    }

    /// Forces a collection. `None` collects every generation.
    pub fn collect(&self, generation: Option<u32>, mode: CollectionMode) -> bool {
        let current = self.get_thread();
        let _managed = current.as_deref().map(CooperativeScope::new);

        let mode = if mode == CollectionMode::NonBlocking && self.force_full_gc_to_be_blocking() {
            CollectionMode::Blocking
        } else {
            mode
        };
        self.heap.garbage_collect(self, generation, mode)
    }

    /// Tears the environment down. Fails while a pause runs or threads are
    /// still attached.
    pub fn shutdown(&self) -> Result<(), EnvError> {
        {
            let _quiescent = self.coordinator.lock_quiescent()?;
            let attached = self.registry.len();
            if attached != 0 {
                return Err(EnvError::ThreadsStillAttached(attached));
            }
            self.shut_down.set();
        }
        self.finalizer_event.close();
        log::info!(target: "gc", "environment shut down after {} collection(s)", self.stats.collections());
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.is_set()
    }
}

struct DetachOnDrop<'a>(&'a GcEnv);

impl<'a> Drop for DetachOnDrop<'a> {
    fn drop(&mut self) {
        if let Err(err) = self.0.detach_current_thread() {
            log::warn!(target: "gc-thread", "failed to detach on exit: {}", err);
        }
    }
}

/// Spawns an OS thread attached to `env` for the lifetime of `f`. The thread
/// is detached even if `f` panics.
pub fn spawn<F, R>(env: &Arc<GcEnv>, f: F) -> JoinHandle<Result<R, EnvError>>
where
    F: FnOnce(&RuntimeThread) -> R + Send + 'static,
    R: Send + 'static,
{
    let env = env.clone();
    std::thread::spawn(move || {
        let thread = env.attach_current_thread()?;
        let _detach = DetachOnDrop(&env);
        Ok(f(&thread))
    })
}

static GLOBAL: Lazy<RwLock<Option<Arc<GcEnv>>>> = Lazy::new(|| RwLock::new(None));

/// Makes `env` the process-wide environment.
pub fn install(env: Arc<GcEnv>) -> Result<(), EnvError> {
    let mut global = GLOBAL.write();
    if global.is_some() {
        return Err(EnvError::AlreadyInstalled);
    }
    *global = Some(env);
    Ok(())
}

pub fn global() -> Option<Arc<GcEnv>> {
    GLOBAL.read().clone()
}

/// Shuts down and removes the process-wide environment.
pub fn uninstall() -> Result<Option<Arc<GcEnv>>, EnvError> {
    let mut global = GLOBAL.write();
    if let Some(env) = global.as_ref() {
        env.shutdown()?;
    }
    Ok(global.take())
}

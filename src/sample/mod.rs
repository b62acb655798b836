//! A minimal heap driving the environment boundary end to end.
//!
//! Memory is a single reserved range handed out in bump-allocated quanta.
//! A collection stops the world, retires every allocation context and
//! counts the live roots, but never reclaims anything.

pub mod virtual_memory;

use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    collector::{AllocFlags, CollectionMode, GcHeap, PromoteFlags, ScanContext},
    env::GcConfig,
    error::EnvError,
    gcenv::GcEnv,
    safepoint::SuspendReason,
    thread::alloc_context::AllocContext,
    write_barrier::{WriteBarrierOp, WriteBarrierParameters},
};

use self::virtual_memory::VirtualMemory;

pub const MAX_GENERATION: u32 = 2;

pub struct SampleHeap {
    memory: VirtualMemory,
    quantum: usize,
    top: Mutex<usize>,
    wasted: AtomicUsize,
    live_roots: AtomicUsize,
}

impl SampleHeap {
    pub fn new(limit: usize, quantum: usize) -> Result<Self, EnvError> {
        let memory = VirtualMemory::allocate(limit)?;
        let top = memory.start();
        Ok(Self {
            memory,
            quantum: quantum.max(crate::thread::alloc_context::ALLOC_ALIGNMENT),
            top: Mutex::new(top),
            wasted: AtomicUsize::new(0),
            live_roots: AtomicUsize::new(0),
        })
    }

    pub fn from_config(config: &GcConfig) -> Result<Self, EnvError> {
        Self::new(config.heap_hard_limit, config.alloc_quantum)
    }

    pub fn contains(&self, address: usize) -> bool {
        self.memory.contains(address)
    }

    pub fn used(&self) -> usize {
        *self.top.lock() - self.memory.start()
    }

    pub fn capacity(&self) -> usize {
        self.memory.size()
    }

    /// Bytes abandoned in retired allocation windows.
    pub fn wasted(&self) -> usize {
        self.wasted.load(Ordering::Relaxed)
    }

    /// Roots into this heap seen by the last collection.
    pub fn live_roots(&self) -> usize {
        self.live_roots.load(Ordering::Relaxed)
    }

    fn bump(&self, size: usize) -> Option<usize> {
        let mut top = self.top.lock();
        let start = *top;
        if self.memory.end() - start < size {
            return None;
        }
        *top = start + size;
        Some(start)
    }
}

impl GcHeap for SampleHeap {
    fn initialize(&self, env: &GcEnv) -> Result<(), EnvError> {
        env.stomp_write_barrier(&WriteBarrierParameters {
            is_runtime_suspended: true,
            requires_upper_bounds_check: true,
            lowest_address: self.memory.start(),
            highest_address: self.memory.end(),
            ephemeral_low: self.memory.start(),
            ephemeral_high: self.memory.end(),
            ..WriteBarrierParameters::new(WriteBarrierOp::Initialize)
        });
        Ok(())
    }

    fn alloc(
        &self,
        _env: &GcEnv,
        ctx: &mut AllocContext,
        size: usize,
        flags: AllocFlags,
    ) -> Option<NonNull<u8>> {
        if flags.contains(AllocFlags::LARGE_OBJECT) || size >= self.quantum / 2 {
            let start = self.bump(size)?;
            ctx.record_large(size);
            return NonNull::new(start as *mut u8);
        }

        let window = self.bump(self.quantum)?;
        self.wasted.fetch_add(ctx.retire(), Ordering::Relaxed);
        ctx.refill(window, self.quantum);
        ctx.allocate(size)
    }

    fn fix_alloc_context(&self, ctx: &mut AllocContext) {
        self.wasted.fetch_add(ctx.retire(), Ordering::Relaxed);
    }

    fn garbage_collect(&self, env: &GcEnv, generation: Option<u32>, mode: CollectionMode) -> bool {
        let condemned = generation.map_or(MAX_GENERATION, |g| g.min(MAX_GENERATION));
        env.suspend_ee(SuspendReason::ForGc);
        env.gc_start_work(condemned, MAX_GENERATION);
        log::debug!(target: "gc", "collecting gen {} ({:?})", condemned, mode);

        let mut wasted = 0;
        env.gc_enum_alloc_contexts(&mut |ctx: &mut AllocContext| {
            wasted += ctx.retire();
        });
        self.wasted.fetch_add(wasted, Ordering::Relaxed);

        let mut live = 0;
        let mut sc = ScanContext::new(true);
        env.gc_scan_roots(
            &mut |slot: &AtomicUsize, _sc: &ScanContext, _flags: PromoteFlags| {
                if self.contains(slot.load(Ordering::Acquire)) {
                    live += 1;
                }
            },
            condemned,
            MAX_GENERATION,
            &mut sc,
        );
        env.after_gc_scan_roots(condemned, MAX_GENERATION, &mut sc);
        self.live_roots.store(live, Ordering::Relaxed);

        env.enable_finalization(false);
        env.gc_done(condemned);
        env.restart_ee(true);
        true
    }

    fn max_generation(&self) -> u32 {
        MAX_GENERATION
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{gcenv::spawn, test_util::sample_env};

    #[test]
    fn init_stomps_write_barrier_with_reserved_range() {
        let (env, heap) = sample_env();
        assert_eq!(env.write_barrier().version(), 1);
        assert!(env.write_barrier().in_heap(heap.memory.start()));
        assert!(!env.write_barrier().in_heap(heap.memory.end()));
        assert!(env.write_barrier().needs_card_mark(heap.memory.start(), heap.memory.start() + 64));
    }

    #[test]
    fn large_allocations_bypass_the_window() {
        let (env, _heap) = sample_env();
        spawn(&env, {
            let env = env.clone();
            move |thread| {
                let small = env.alloc(32, AllocFlags::NONE).unwrap().as_ptr() as usize;
                let big = env.alloc(64 * 1024, AllocFlags::NONE).unwrap().as_ptr() as usize;
                let flagged = env.alloc(64, AllocFlags::LARGE_OBJECT).unwrap().as_ptr() as usize;
                let ctx = thread.alloc_context();
                assert_eq!(ctx.alloc_bytes_uoh(), 64 * 1024 + 64);
                assert_eq!(ctx.alloc_count(), 3);
                assert!(small < ctx.alloc_ptr());
                assert!(big > small && flagged > big);
            }
        })
        .join()
        .unwrap()
        .unwrap();
    }

    #[test]
    fn collection_counts_roots_into_heap() {
        let (env, heap) = sample_env();
        spawn(&env, {
            let env = env.clone();
            move |thread| {
                let obj = env.alloc(48, AllocFlags::NONE).unwrap().as_ptr() as usize;
                let _inside = thread.add_root(obj, PromoteFlags::NONE);
                let _outside = thread.add_root(0x10, PromoteFlags::NONE);
                assert!(env.collect(Some(0), CollectionMode::Default));
                assert!(thread.alloc_context().is_empty());
            }
        })
        .join()
        .unwrap()
        .unwrap();

        assert_eq!(heap.live_roots(), 1);
        assert_eq!(env.stats().collections(), 1);
        assert_eq!(env.stats().last_condemned(), 0);
        assert!(heap.wasted() > 0);
        assert!(heap.used() <= heap.capacity());
    }
}

use std::ptr::NonNull;

/// Minimum alignment of every object handed out from an allocation context.
pub const ALLOC_ALIGNMENT: usize = 16;

/// Rounds `value` up to `align`, a power of two. `None` on overflow.
#[inline(always)]
pub fn align_up(value: usize, align: usize) -> Option<usize> {
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

// AllocContext: the window [alloc_ptr, alloc_limit) a thread bumps through
//               without taking any heap lock. It is private to its thread
//               while the thread runs cooperatively; the collector only
//               touches it while the owner is suspended or preemptive.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AllocContext {
    alloc_ptr: usize,
    alloc_limit: usize,
    /// Bytes handed to this context by the heap, including the current window.
    alloc_bytes: usize,
    /// Bytes of large allocations satisfied outside the window.
    alloc_bytes_uoh: usize,
    alloc_count: usize,
}

impl AllocContext {
    pub const fn new() -> Self {
        Self {
            alloc_ptr: 0,
            alloc_limit: 0,
            alloc_bytes: 0,
            alloc_bytes_uoh: 0,
            alloc_count: 0,
        }
    }

    /// Resets the context to the empty window. Done once on attach.
    pub fn init(&mut self) {
        *self = Self::new();
    }

    #[inline(always)]
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let obj = self.alloc_ptr;

        if obj != 0 && self.alloc_limit - obj >= size {
            self.alloc_ptr = obj + size;
            self.alloc_count += 1;
            return NonNull::new(obj as *mut u8);
        }

        None
    }

    /// Installs a fresh window `[start, start + size)` obtained from the heap.
    pub fn refill(&mut self, start: usize, size: usize) {
        self.alloc_ptr = start;
        self.alloc_limit = start + size;
        self.alloc_bytes += size;
    }

    pub fn record_large(&mut self, size: usize) {
        self.alloc_bytes_uoh += size;
        self.alloc_count += 1;
    }

    /// Abandons the rest of the window and returns the unused byte count.
    /// Invoked before a collection and on thread detach.
    pub fn retire(&mut self) -> usize {
        let unused = self.remaining();
        if unused != 0 {
            log::trace!(target: "gc-tlab", "retiring window {:#x}..{:#x} ({} bytes unused)", self.alloc_ptr, self.alloc_limit, unused);
        }
        self.alloc_ptr = 0;
        self.alloc_limit = 0;
        unused
    }

    pub fn is_empty(&self) -> bool {
        self.alloc_ptr == 0 && self.alloc_limit == 0
    }

    pub fn remaining(&self) -> usize {
        self.alloc_limit - self.alloc_ptr
    }

    pub fn alloc_ptr(&self) -> usize {
        self.alloc_ptr
    }

    pub fn alloc_limit(&self) -> usize {
        self.alloc_limit
    }

    pub fn alloc_bytes(&self) -> usize {
        self.alloc_bytes
    }

    pub fn alloc_bytes_uoh(&self) -> usize {
        self.alloc_bytes_uoh
    }

    pub fn alloc_count(&self) -> usize {
        self.alloc_count
    }
}

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

pub type SharedValue = AtomicU8;

/// Process-visible boolean with acquire/release semantics.
pub struct SharedFlag(SharedValue);

impl SharedFlag {
    pub const fn new() -> Self {
        Self(SharedValue::new(0))
    }

    pub fn set(&self) {
        self.0.store(1, Ordering::Release);
    }

    pub fn unset(&self) {
        self.0.store(0, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire) == 1
    }

    pub fn is_unset(&self) -> bool {
        self.0.load(Ordering::Acquire) == 0
    }

    pub fn try_set(&self) -> bool {
        if self.is_set() {
            return false;
        }

        self.0
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn try_unset(&self) -> bool {
        if self.is_unset() {
            return false;
        }

        self.0
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

impl Default for SharedFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter read by mutators on their mode transitions. Loads and stores are
/// sequentially consistent: it pairs with the per-thread mode word in a
/// store-then-load handshake on both sides.
pub struct SharedCounter(AtomicU32);

impl SharedCounter {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn increment(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn decrement(&self) -> u32 {
        let prev = self.0.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev != 0, "shared counter underflow");
        prev.wrapping_sub(1)
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_set(&self) -> bool {
        self.get() != 0
    }
}

impl Default for SharedCounter {
    fn default() -> Self {
        Self::new()
    }
}

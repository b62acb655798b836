use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::collector::PromoteFlags;

use super::RuntimeThread;

pub(crate) struct RootEntry {
    pub(crate) slot: Arc<AtomicUsize>,
    pub(crate) flags: PromoteFlags,
}

/// A stack-scoped root slot. The collector sees the slot through
/// [`crate::GcEnv::gc_scan_roots`] and may rewrite it while the owner is
/// stopped.
pub struct GcRoot<'a> {
    thread: &'a RuntimeThread,
    slot: Arc<AtomicUsize>,
}

impl<'a> GcRoot<'a> {
    pub(crate) fn new(thread: &'a RuntimeThread, slot: Arc<AtomicUsize>) -> Self {
        Self { thread, slot }
    }

    pub fn get(&self) -> usize {
        self.slot.load(Ordering::Acquire)
    }

    pub fn set(&self, value: usize) {
        self.slot.store(value, Ordering::Release);
    }

    pub fn is_null(&self) -> bool {
        self.get() == 0
    }
}

impl<'a> Drop for GcRoot<'a> {
    fn drop(&mut self) {
        self.thread.remove_root(&self.slot);
    }
}

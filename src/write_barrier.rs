//! Write barrier parameters published by the collector.
//!
//! The mutator's barrier reads these bounds on every reference store. The
//! collector rewrites them ("stomps" the barrier) when the heap grows, when
//! the ephemeral generation moves or when write watch is toggled.
//!
//! A store of `value` into `dst` needs a card mark when `dst` is inside the
//! heap and `value` points into the ephemeral range.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Each card covers `1 << CARD_BYTE_SHIFT` bytes.
pub const CARD_BYTE_SHIFT: u32 = 11;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WriteBarrierOp {
    Initialize,
    StompResize,
    StompEphemeral,
    SwitchToWriteWatch,
    SwitchToNonWriteWatch,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct WriteBarrierParameters {
    pub operation: WriteBarrierOp,
    pub is_runtime_suspended: bool,
    pub requires_upper_bounds_check: bool,
    pub card_table: usize,
    pub lowest_address: usize,
    pub highest_address: usize,
    pub ephemeral_low: usize,
    pub ephemeral_high: usize,
}

impl WriteBarrierParameters {
    pub const fn new(operation: WriteBarrierOp) -> Self {
        Self {
            operation,
            is_runtime_suspended: false,
            requires_upper_bounds_check: false,
            card_table: 0,
            lowest_address: 0,
            highest_address: 0,
            ephemeral_low: 0,
            ephemeral_high: 0,
        }
    }
}

pub struct WriteBarrierState {
    card_table: AtomicUsize,
    lowest_address: AtomicUsize,
    highest_address: AtomicUsize,
    ephemeral_low: AtomicUsize,
    ephemeral_high: AtomicUsize,
    upper_bounds_check: AtomicBool,
    write_watch: AtomicBool,
    version: AtomicU64,
}

impl WriteBarrierState {
    pub const fn new() -> Self {
        Self {
            card_table: AtomicUsize::new(0),
            lowest_address: AtomicUsize::new(0),
            highest_address: AtomicUsize::new(0),
            ephemeral_low: AtomicUsize::new(0),
            ephemeral_high: AtomicUsize::new(0),
            upper_bounds_check: AtomicBool::new(false),
            write_watch: AtomicBool::new(false),
            version: AtomicU64::new(0),
        }
    }

    pub fn stomp(&self, args: &WriteBarrierParameters) {
        match args.operation {
            WriteBarrierOp::Initialize => {
                self.store_bounds(args);
                self.store_ephemeral(args);
            }
            WriteBarrierOp::StompResize => self.store_bounds(args),
            WriteBarrierOp::StompEphemeral => self.store_ephemeral(args),
            WriteBarrierOp::SwitchToWriteWatch => self.write_watch.store(true, Ordering::Release),
            WriteBarrierOp::SwitchToNonWriteWatch => self.write_watch.store(false, Ordering::Release),
        }

        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        log::debug!(
            target: "gc-barrier",
            "{:?} v{}: heap {:#x}..{:#x} ephemeral {:#x}..{:#x}",
            args.operation,
            version,
            self.lowest_address.load(Ordering::Relaxed),
            self.highest_address.load(Ordering::Relaxed),
            self.ephemeral_low.load(Ordering::Relaxed),
            self.ephemeral_high.load(Ordering::Relaxed)
        );
    }

    fn store_bounds(&self, args: &WriteBarrierParameters) {
        self.card_table.store(args.card_table, Ordering::Release);
        self.lowest_address.store(args.lowest_address, Ordering::Release);
        self.highest_address.store(args.highest_address, Ordering::Release);
        self.upper_bounds_check
            .store(args.requires_upper_bounds_check, Ordering::Release);
    }

    fn store_ephemeral(&self, args: &WriteBarrierParameters) {
        self.ephemeral_low.store(args.ephemeral_low, Ordering::Release);
        self.ephemeral_high.store(args.ephemeral_high, Ordering::Release);
    }

    /// Lower bound is always checked; the upper one only when requested.
    pub fn in_heap(&self, addr: usize) -> bool {
        if addr < self.lowest_address.load(Ordering::Acquire) {
            return false;
        }
        !self.upper_bounds_check.load(Ordering::Acquire)
            || addr < self.highest_address.load(Ordering::Acquire)
    }

    pub fn in_ephemeral(&self, addr: usize) -> bool {
        addr >= self.ephemeral_low.load(Ordering::Acquire)
            && addr < self.ephemeral_high.load(Ordering::Acquire)
    }

    pub fn needs_card_mark(&self, dst: usize, value: usize) -> bool {
        self.in_heap(dst) && self.in_ephemeral(value)
    }

    pub fn card_index(&self, dst: usize) -> usize {
        dst >> CARD_BYTE_SHIFT
    }

    pub fn card_table(&self) -> usize {
        self.card_table.load(Ordering::Acquire)
    }

    pub fn is_write_watch_enabled(&self) -> bool {
        self.write_watch.load(Ordering::Acquire)
    }

    /// Number of stomps so far.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

impl Default for WriteBarrierState {
    fn default() -> Self {
        Self::new()
    }
}

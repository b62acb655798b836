//! Execution-environment side of a garbage collector.
//!
//! Runtime threads attach to a [`GcEnv`], run cooperatively while they touch
//! managed memory and switch to preemptive mode around blocking calls. The
//! collector stops the world through the [`safepoint::SuspensionCoordinator`]
//! and talks to the environment only through the calls in [`collector`].

pub mod collector;
pub mod env;
pub mod error;
pub mod gcenv;
pub mod safepoint;
pub mod sample;
pub mod sync;
pub mod thread;
pub mod write_barrier;

pub use collector::{handle_fatal_error, AllocFlags, CollectionMode, GcHeap, PromoteFlags, ScanContext};
pub use error::EnvError;
pub use gcenv::{spawn, GcEnv};
pub use safepoint::SuspendReason;
pub use sync::event::{BlockingEvent, WaitResult, INFINITE};
pub use thread::{CooperativeScope, GcMode, PreemptiveScope, RuntimeThread};

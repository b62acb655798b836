use thiserror::Error;

/// Recoverable failures of the execution-environment boundary.
///
/// Anything that would leave GC-mode or suspension state inconsistent is not
/// represented here; those paths end in [`crate::collector::handle_fatal_error`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvError {
    #[error("current thread is already attached to a GC environment")]
    AlreadyAttached,
    #[error("current thread is not attached")]
    NotAttached,
    #[error("current thread is attached to a different GC environment")]
    ForeignThread,
    #[error("operation not permitted on the thread running a suspension")]
    PauseInProgress,
    #[error("out of memory while allocating {size} bytes")]
    OutOfMemory { size: usize },
    #[error("failed to reserve {size} bytes of address space (errno {errno})")]
    Reserve { size: usize, errno: i32 },
    #[error("failed to create {0} event")]
    EventCreation(&'static str),
    #[error("a GC environment is already installed")]
    AlreadyInstalled,
    #[error("{0} thread(s) still attached")]
    ThreadsStillAttached(usize),
}

//! Kernel error types
//!
//! These report misuse of the core's interfaces (stale handles, exhausted
//! tables, bad configuration). Outcomes of waiting on a resource are not
//! errors here: they are recorded as a [`WaitStatus`](crate::objects::WaitStatus)
//! in the thread control block.

use thiserror::Error;

use crate::objects::ThreadId;

/// Error types for core operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("invalid or stale thread handle {0}")]
    InvalidThread(ThreadId),

    #[error("thread table exhausted")]
    TooManyThreads,

    #[error("watchdog table exhausted")]
    TooManyWatchdogs,

    #[error("thread {0} is already blocked on a thread queue")]
    AlreadyWaiting(ThreadId),

    #[error("thread {0} is not dormant")]
    NotDormant(ThreadId),

    #[error("invalid processor index {0}")]
    InvalidCpu(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = core::result::Result<T, KernelError>;

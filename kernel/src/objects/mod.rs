//! Kernel Object Model
//!
//! The objects every synchronization primitive is built from.
//!
//! ## Object Types
//!
//! - **Thread State**: bitmask saying why a thread is not running
//! - **Thread Control**: the schedulable unit, kept in a fixed thread table
//! - **Thread Queue**: generic blocking/waking substrate with FIFO or
//!   priority discipline and per-wait timeouts
//! - **Counting Semaphore**: seize/surrender over a thread queue
//!
//! ## Wait results
//!
//! A blocked thread leaves its thread queue through exactly one of four
//! paths: satisfaction, timeout, flush or deletion of the object. The path
//! taken is recorded as a [`WaitStatus`] in the thread control block and read
//! back with [`Kernel::wait_status`](crate::Kernel::wait_status) once the
//! thread runs again.

pub mod semaphore;
pub mod states;
pub mod tcb;
pub mod thread_queue;

use core::fmt;

pub use semaphore::{CountingSemaphore, SeizeOutcome, SemaphoreError, SurrenderOutcome};
pub use states::ThreadState;
pub use tcb::ThreadId;
pub use thread_queue::{Discipline, ThreadQueue, ThreadQueueGuard};

/// Opaque identity of a kernel object
///
/// Only used to label wait information; the core never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ObjectId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Thread priority (lower value = more urgent)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Priority(pub u8);

impl Priority {
    /// Most urgent priority; a thread at this level preempts even
    /// non-preemptible threads
    pub const MOST_URGENT: Priority = Priority(0);

    /// Least urgent priority
    pub const LEAST_URGENT: Priority = Priority(u8::MAX);

    /// Whether `self` must run before `other`
    #[inline]
    pub fn is_more_urgent_than(self, other: Priority) -> bool {
        self.0 < other.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a wait on a thread queue ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WaitStatus {
    /// The resource was handed over
    #[default]
    Successful,
    /// The resource is still unavailable (no-wait request or flush)
    Unsatisfied,
    /// The watchdog armed at enqueue time expired first
    Timeout,
    /// The object was destroyed while the thread was waiting on it
    ObjectWasDeleted,
}

/// How long a thread may stay blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Timeout {
    /// No watchdog is armed
    #[default]
    Forever,
    /// Time out on the given clock tick; `Ticks(0)` and `Ticks(1)` both
    /// fire on the next tick
    Ticks(u32),
}

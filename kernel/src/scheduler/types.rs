//! Scheduler Types
//!
//! Core data structures for the SMP scheduler.

use core::fmt;

use crate::objects::{Priority, ThreadId};

/// Uptime in clock ticks, used to stamp context switches
pub type Timestamp = u64;

/// Scheduler-side view of a thread
///
/// One node per thread table slot. `order` is stamped from a monotonic
/// counter each time the node enters the ready set, so `(priority, order)`
/// is exactly the position of the node in the ready chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerNode {
    pub thread: ThreadId,
    pub priority: Priority,
    pub preemptible: bool,
    /// Whether the node is in the ready set
    pub ready: bool,
    pub(crate) order: u64,
    /// Set by a yield until the thread leaves its processor or keeps it
    pub(crate) yielded: bool,
}

impl SchedulerNode {
    pub(crate) fn new(thread: ThreadId, priority: Priority, preemptible: bool) -> Self {
        Self {
            thread,
            priority,
            preemptible,
            ready: false,
            order: 0,
            yielded: false,
        }
    }
}

/// Per-processor scheduling record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PerCpu {
    /// Thread currently running on the processor (`None` = idle)
    pub executing: Option<ThreadId>,

    /// Thread the processor should run next (`None` = idle)
    pub heir: Option<ThreadId>,

    /// The dispatcher must switch `executing` to `heir` at the next safe point
    pub dispatch_necessary: bool,

    pub time_of_last_context_switch: Timestamp,
}

/// A switch performed by [`SmpScheduler::dispatch`](super::SmpScheduler::dispatch)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSwitch {
    pub cpu: usize,
    pub from: Option<ThreadId>,
    pub to: Option<ThreadId>,
}

impl fmt::Display for ContextSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        struct Slot(Option<ThreadId>);
        impl fmt::Display for Slot {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    Some(thread) => write!(f, "{}", thread),
                    None => f.write_str("idle"),
                }
            }
        }
        write!(f, "cpu{}: {} -> {}", self.cpu, Slot(self.from), Slot(self.to))
    }
}

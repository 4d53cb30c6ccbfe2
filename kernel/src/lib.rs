//! SuperCore - the concurrency core of the kernel
//!
//! Everything the public directives build on lives here: the intrusive
//! chain, the thread state algebra, the generic blocking thread queue, the
//! counting semaphore layered on it, and the SMP scheduler that assigns
//! ready threads to processors.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//! - `chain`: index-linked doubly-linked lists with a shared sentinel
//! - `objects`: thread state, thread control, thread queue, semaphore
//! - `scheduler`: the simple SMP heir assignment
//! - `watchdog`: one-shot tick-driven timers used for timeouts
//! - `kernel`: the process-wide kernel state tying the pieces together
//! - `sync` / `arch`: the ISR lock and the interrupt masking under it
//!
//! Dependency order mirrors the data flow: chains underpin every list,
//! thread queues sit on chains plus thread state, semaphores sit on thread
//! queues, and the scheduler consumes chains plus thread state on its own.
//!
//! # Lock order
//!
//! thread queue -> thread table -> watchdogs -> scheduler. No path acquires
//! a lock to the left of one it already holds, and none is held across the
//! blocking transition inside `ThreadQueueGuard::enqueue`.

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

#[macro_use]
mod debug;

pub mod arch;
pub mod chain;
pub mod config;
pub mod error;
pub mod kernel;
pub mod objects;
pub mod scheduler;
pub mod sync;
pub mod watchdog;

pub use chain::{Chain, Links, NodeArray, NodeId, Nodes, Position, ProtectedChain};
pub use config::KernelConfig;
pub use error::{KernelError, Result};
pub use kernel::{Kernel, ThreadAttributes};
pub use objects::{
    CountingSemaphore, Discipline, ObjectId, Priority, SeizeOutcome, SemaphoreError,
    SurrenderOutcome, ThreadId, ThreadQueue, ThreadQueueGuard, ThreadState, Timeout, WaitStatus,
};
pub use scheduler::{ContextSwitch, SmpScheduler, Timestamp};
pub use sync::{IsrLock, IsrLockGuard};
pub use watchdog::{WatchdogId, Watchdogs};

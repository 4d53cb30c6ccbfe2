//! Counting Semaphore
//!
//! A count plus a maximum guarded by a thread queue lock. Seizing takes a
//! unit or blocks; surrendering hands the unit straight to the next waiter
//! when there is one, so the count never goes up while threads are waiting.
//!
//! ## Operations
//!
//! - `seize`: decrement, fail with [`SemaphoreError::Unsatisfied`], or block
//! - `surrender`: transfer to a waiter, increment, or fail at the maximum
//! - `flush`: release every waiter with [`WaitStatus::Unsatisfied`]
//! - `destroy`: release every waiter with [`WaitStatus::ObjectWasDeleted`]
//!
//! Waiters are released FIFO or by priority as chosen at creation.

use alloc::sync::Arc;
use alloc::vec::Vec;

use thiserror::Error;

use crate::error::KernelError;
use crate::kernel::Kernel;

use super::{Discipline, ObjectId, ThreadId, ThreadQueue, ThreadState, Timeout, WaitStatus};

/// Semaphore errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SemaphoreError {
    #[error("semaphore unavailable")]
    Unsatisfied,

    #[error("surrender would exceed the maximum count")]
    MaximumCountExceeded,

    #[error("invalid count {initial} for maximum {maximum}")]
    InvalidCount { initial: u32, maximum: u32 },

    #[error(transparent)]
    Kernel(#[from] KernelError),
}

/// Result of a successful [`CountingSemaphore::seize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeizeOutcome {
    /// A unit was taken without blocking
    Acquired,
    /// The thread is blocked; the outcome is its wait status once released
    Blocked,
}

/// Result of a successful [`CountingSemaphore::surrender`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurrenderOutcome {
    /// The unit went directly to this waiter
    Transferred(ThreadId),
    /// Nobody was waiting; the count went up by one
    Incremented,
}

/// Data guarded by the semaphore's thread queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreCount {
    pub count: u32,
    pub maximum: u32,
}

/// Counting semaphore
///
/// Cloning yields another handle to the same semaphore.
#[derive(Debug, Clone)]
pub struct CountingSemaphore {
    queue: Arc<ThreadQueue<SemaphoreCount>>,
}

impl CountingSemaphore {
    /// Create a semaphore holding `initial` units out of `maximum`
    pub fn initialize(
        object_id: ObjectId,
        discipline: Discipline,
        initial: u32,
        maximum: u32,
    ) -> Result<Self, SemaphoreError> {
        if maximum == 0 || initial > maximum {
            return Err(SemaphoreError::InvalidCount { initial, maximum });
        }

        let queue = ThreadQueue::initialize(
            object_id,
            discipline,
            WaitStatus::Timeout,
            SemaphoreCount {
                count: initial,
                maximum,
            },
        );
        Ok(Self { queue })
    }

    pub fn object_id(&self) -> ObjectId {
        self.queue.object_id()
    }

    pub fn discipline(&self) -> Discipline {
        self.queue.discipline()
    }

    /// Take one unit on behalf of `thread`
    ///
    /// With no unit available, `wait == false` fails with
    /// [`SemaphoreError::Unsatisfied`]; otherwise the thread blocks on the
    /// semaphore for at most `timeout`.
    pub fn seize(
        &self,
        kernel: &Kernel,
        thread: ThreadId,
        wait: bool,
        timeout: Timeout,
    ) -> Result<SeizeOutcome, SemaphoreError> {
        let mut queue = self.queue.acquire();
        if queue.count > 0 {
            queue.count -= 1;
            return Ok(SeizeOutcome::Acquired);
        }

        if !wait {
            return Err(SemaphoreError::Unsatisfied);
        }

        queue.enqueue(kernel, thread, ThreadState::WAITING_FOR_SEMAPHORE, timeout)?;
        Ok(SeizeOutcome::Blocked)
    }

    /// Give one unit back
    pub fn surrender(&self, kernel: &Kernel) -> Result<SurrenderOutcome, SemaphoreError> {
        let mut queue = self.queue.acquire();
        if let Some(thread) = queue.extract_first(kernel, WaitStatus::Successful)? {
            return Ok(SurrenderOutcome::Transferred(thread));
        }

        if queue.count < queue.maximum {
            queue.count += 1;
            Ok(SurrenderOutcome::Incremented)
        } else {
            log::warn!(
                "semaphore {}: surrender past maximum count {}",
                self.queue.object_id(),
                queue.maximum
            );
            Err(SemaphoreError::MaximumCountExceeded)
        }
    }

    /// Release every waiter with [`WaitStatus::Unsatisfied`]
    ///
    /// The count is left as is. Returns the number of released threads.
    pub fn flush(&self, kernel: &Kernel) -> Result<usize, SemaphoreError> {
        let released = self
            .queue
            .acquire()
            .flush(kernel, WaitStatus::Unsatisfied, |_| {})?;
        Ok(released)
    }

    /// Delete the semaphore, releasing every waiter with
    /// [`WaitStatus::ObjectWasDeleted`]
    pub fn destroy(self, kernel: &Kernel) -> Result<usize, SemaphoreError> {
        let object_id = self.queue.object_id();
        let released = self
            .queue
            .acquire()
            .flush(kernel, WaitStatus::ObjectWasDeleted, |thread| {
                log::debug!("semaphore {}: {} woken by deletion", object_id, thread);
            })?;
        log::debug!("semaphore {} destroyed", object_id);
        Ok(released)
    }

    /// Units currently available
    pub fn get_count(&self) -> u32 {
        self.queue.acquire().count
    }

    pub fn maximum_count(&self) -> u32 {
        self.queue.acquire().maximum
    }

    /// Blocked threads in release order
    pub fn waiting_threads(&self) -> Vec<ThreadId> {
        self.queue.acquire().waiting_threads()
    }
}

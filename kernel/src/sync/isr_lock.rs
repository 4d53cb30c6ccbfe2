//! ISR lock - interrupt-masking ticket lock
//!
//! ## Design
//!
//! Acquisition first masks interrupts on the current processor, then spins
//! on a ticket lock. Release happens in the opposite order when the guard is
//! dropped, so an interrupt handler on this processor can never observe the
//! protected data half-updated and another processor can never enter the
//! section concurrently. Tickets are served in arrival order.
//!
//! The guard is the only way to reach the data. Early returns, `?` and the
//! blocking transition inside a thread queue enqueue all release the lock by
//! dropping the guard.

use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use spin::mutex::{TicketMutex, TicketMutexGuard};

use crate::arch::{self, IsrLevel};

/// Interrupt-masking spin lock around `T`
pub struct IsrLock<T> {
    /// Name reported by `Debug`, handy when tracing lock order problems
    name: &'static str,
    inner: TicketMutex<T>,
}

impl<T> IsrLock<T> {
    /// Create an unlocked ISR lock
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            inner: TicketMutex::new(value),
        }
    }

    /// Mask interrupts and acquire the lock
    pub fn lock(&self) -> IsrLockGuard<'_, T> {
        let level = arch::disable_interrupts();
        let guard = self.inner.lock();
        IsrLockGuard {
            guard: ManuallyDrop::new(guard),
            level,
        }
    }

    /// Acquire the lock only if it is free right now
    ///
    /// Interrupts are left untouched when the lock is busy.
    pub fn try_lock(&self) -> Option<IsrLockGuard<'_, T>> {
        let level = arch::disable_interrupts();
        match self.inner.try_lock() {
            Some(guard) => Some(IsrLockGuard {
                guard: ManuallyDrop::new(guard),
                level,
            }),
            None => {
                arch::restore_interrupts(level);
                None
            }
        }
    }

    /// Whether some processor currently holds the lock
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Name given at construction
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Access the data through an exclusive borrow, no locking needed
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Consume the lock and return the data
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Default> Default for IsrLock<T> {
    fn default() -> Self {
        Self::new("anonymous", T::default())
    }
}

impl<T> fmt::Debug for IsrLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsrLock")
            .field("name", &self.name)
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Scoped ownership of an [`IsrLock`]
///
/// Dropping the guard unlocks first and then restores the interrupt mask.
pub struct IsrLockGuard<'a, T> {
    guard: ManuallyDrop<TicketMutexGuard<'a, T>>,
    level: IsrLevel,
}

impl<T> Deref for IsrLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IsrLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IsrLockGuard<'_, T> {
    fn drop(&mut self) {
        // Safety: the guard is dropped exactly once, here, and never used again.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        arch::restore_interrupts(self.level);
    }
}

impl<T: fmt::Debug> fmt::Debug for IsrLockGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

//! Kernel synchronization
//!
//! Only one primitive is needed by the core: the ISR lock, which masks
//! interrupts on the local processor and then takes a ticket spin lock so
//! that other processors are serialized as well.

mod isr_lock;

pub use isr_lock::{IsrLock, IsrLockGuard};

//! Architecture-specific code
//!
//! The core only needs one thing from the architecture: the ability to mask
//! interrupts on the current processor and restore the previous mask later.
//! Bare-metal ARM64 (AArch64) uses the DAIF register; every other target is
//! a hosted build (unit tests, simulators) where there is nothing to mask and
//! the calls only keep the nesting count.

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub mod aarch64;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
use aarch64::interrupts as imp;

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
mod hosted;

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
use hosted as imp;

/// Interrupt mask saved by [`disable_interrupts`]
///
/// Must be handed back to [`restore_interrupts`] on the same processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "the saved level must be restored"]
pub struct IsrLevel(pub(crate) u64);

/// Mask interrupts on the current processor, returning the previous mask
#[inline]
pub fn disable_interrupts() -> IsrLevel {
    IsrLevel(imp::disable())
}

/// Restore the interrupt mask saved by [`disable_interrupts`]
#[inline]
pub fn restore_interrupts(level: IsrLevel) {
    imp::restore(level.0)
}

/// Number of interrupt-disabled sections currently open
///
/// Only meaningful on hosted builds, where it is a process-wide counter used
/// by diagnostics; on bare metal it reports whether IRQs are masked (0 or 1).
#[inline]
pub fn interrupt_disable_depth() -> u64 {
    imp::depth()
}

//! Hosted interrupt "masking"
//!
//! There are no interrupts to mask when the core runs as an ordinary process.
//! The nesting depth is still tracked so that tests can observe that every
//! ISR lock section was closed again.

use core::sync::atomic::{AtomicU64, Ordering};

static DEPTH: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn disable() -> u64 {
    DEPTH.fetch_add(1, Ordering::AcqRel)
}

#[inline]
pub fn restore(_previous: u64) {
    DEPTH.fetch_sub(1, Ordering::AcqRel);
}

#[inline]
pub fn depth() -> u64 {
    DEPTH.load(Ordering::Acquire)
}

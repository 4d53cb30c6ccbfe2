//! ARM64 interrupt masking through DAIF
//!
//! `DAIF.I` (bit 7) masks IRQs and `DAIF.F` (bit 6) masks FIQs. Disabling
//! saves the whole register and sets both bits; restoring writes the saved
//! value back, so nested sections unwind correctly.

use core::arch::asm;

/// IRQ + FIQ mask bits as seen by `mrs daif`
const DAIF_IF: u64 = (1 << 7) | (1 << 6);

/// Save DAIF and mask IRQ/FIQ
#[inline(always)]
pub fn disable() -> u64 {
    let daif: u64;
    unsafe {
        asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack, preserves_flags));
        // daifset immediate: bit 1 = I, bit 0 = F
        asm!("msr daifset, #3", options(nostack, preserves_flags));
    }
    daif
}

/// Write a previously saved DAIF value back
#[inline(always)]
pub fn restore(daif: u64) {
    unsafe {
        asm!("msr daif, {}", in(reg) daif, options(nostack, preserves_flags));
    }
}

/// 1 if IRQs are currently masked, 0 otherwise
#[inline(always)]
pub fn depth() -> u64 {
    let daif: u64;
    unsafe {
        asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack, preserves_flags));
    }
    u64::from(daif & DAIF_IF != 0)
}

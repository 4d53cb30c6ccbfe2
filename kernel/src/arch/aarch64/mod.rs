//! ARM64 (AArch64) architecture-specific code

pub mod interrupts;

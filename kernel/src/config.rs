//! Kernel configuration
//!
//! Sizes are fixed when the kernel state is created: the thread table, the
//! watchdog table and the per-processor scheduler records are all allocated
//! once up front and never grow. Tracing is selected at compile time through
//! cargo features (`debug-scheduler`, `debug-thread-queue`).

use static_assertions::const_assert;

use crate::error::{KernelError, Result};

/// Most processors a single scheduler instance can drive
///
/// Heir assignment keeps the set of processors claimed during one pass in a
/// `u64` bitmask.
pub const MAX_CPUS: usize = 64;

const_assert!(MAX_CPUS <= u64::BITS as usize);

/// Thread table size used when none is configured
pub const DEFAULT_MAXIMUM_THREADS: usize = 64;

/// Most threads a kernel instance can manage; thread handles use a `u32` index
pub const MAX_THREADS: usize = 1 << 20;

/// Sizing of one kernel instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of processors owned by the scheduler
    pub cpu_count: usize,

    /// Capacity of the thread table
    pub maximum_threads: usize,

    /// Capacity of the watchdog table
    ///
    /// Each thread arms at most one watchdog at a time, so this defaults to
    /// `maximum_threads`.
    pub maximum_watchdogs: usize,
}

impl KernelConfig {
    /// Configuration for `cpu_count` processors with default table sizes
    pub const fn new(cpu_count: usize) -> Self {
        Self {
            cpu_count,
            maximum_threads: DEFAULT_MAXIMUM_THREADS,
            maximum_watchdogs: DEFAULT_MAXIMUM_THREADS,
        }
    }

    /// Set the thread table capacity (and the watchdog table with it)
    pub const fn with_maximum_threads(mut self, maximum_threads: usize) -> Self {
        self.maximum_threads = maximum_threads;
        self.maximum_watchdogs = maximum_threads;
        self
    }

    /// Set the watchdog table capacity
    pub const fn with_maximum_watchdogs(mut self, maximum_watchdogs: usize) -> Self {
        self.maximum_watchdogs = maximum_watchdogs;
        self
    }

    /// Check the configuration against the compile-time limits
    pub fn validate(&self) -> Result<()> {
        if self.cpu_count == 0 || self.cpu_count > MAX_CPUS {
            return Err(KernelError::InvalidConfig("cpu_count must be in 1..=MAX_CPUS"));
        }
        if self.maximum_threads == 0 || self.maximum_threads > MAX_THREADS {
            return Err(KernelError::InvalidConfig(
                "maximum_threads must be in 1..=MAX_THREADS",
            ));
        }
        if self.maximum_watchdogs == 0 {
            return Err(KernelError::InvalidConfig("maximum_watchdogs must be non-zero"));
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

//! Debug output and logging
//!
//! All diagnostics go through the `log` facade; the embedding kernel installs
//! whatever logger its console supports. The hot paths (heir assignment,
//! thread queue transitions) are traced only when the matching cargo feature
//! is enabled so that release builds pay nothing for them.

/// Scheduler tracing, compiled in with the `debug-scheduler` feature
macro_rules! ksched_debug {
    ($($arg:tt)*) => {{
        #[cfg(feature = "debug-scheduler")]
        log::trace!(target: "supercore::scheduler", $($arg)*);
        #[cfg(not(feature = "debug-scheduler"))]
        let _ = format_args!($($arg)*);
    }};
}

/// Thread queue tracing, compiled in with the `debug-thread-queue` feature
macro_rules! ktq_debug {
    ($($arg:tt)*) => {{
        #[cfg(feature = "debug-thread-queue")]
        log::trace!(target: "supercore::thread_queue", $($arg)*);
        #[cfg(not(feature = "debug-thread-queue"))]
        let _ = format_args!($($arg)*);
    }};
}

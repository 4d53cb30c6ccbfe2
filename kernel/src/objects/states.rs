//! Thread state algebra
//!
//! A thread's state is a bitmask saying why it is not running. The empty
//! mask is "ready". Bits fall into three groups:
//!
//! - lifecycle: `DORMANT`, `SUSPENDED`, `TRANSIENT`
//! - locally blocked: one bit per local resource class a thread queue can
//!   wait on (`WAITING_FOR_SEMAPHORE`, `WAITING_FOR_MUTEX`, ...)
//! - globally blocked: waiting for time, a period, an event or a remote reply
//!
//! The scheduler and the timeout logic only ever test the aggregate masks
//! ([`ThreadState::LOCALLY_BLOCKED`], [`ThreadState::WAITING_ON_THREAD_QUEUE`],
//! [`ThreadState::BLOCKED`]), so every bit used to block on a thread queue
//! must be part of `WAITING_ON_THREAD_QUEUE`.

use bitflags::bitflags;

bitflags! {
    /// Why a thread is not eligible to run (empty = ready)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ThreadState: u32 {
        /// Created but never started, or stopped for good
        const DORMANT = 0x0000_0001;
        /// Suspended explicitly
        const SUSPENDED = 0x0000_0002;
        /// In the middle of a state change
        const TRANSIENT = 0x0000_0004;
        /// Delaying for a relative number of ticks
        const DELAYING = 0x0000_0008;
        /// Waiting for an absolute or relative time
        const WAITING_FOR_TIME = 0x0000_0010;
        const WAITING_FOR_BUFFER = 0x0000_0020;
        const WAITING_FOR_SEGMENT = 0x0000_0040;
        const WAITING_FOR_MESSAGE = 0x0000_0080;
        const WAITING_FOR_EVENT = 0x0000_0100;
        const WAITING_FOR_SEMAPHORE = 0x0000_0200;
        const WAITING_FOR_MUTEX = 0x0000_0400;
        const WAITING_FOR_CONDITION_VARIABLE = 0x0000_0800;
        const WAITING_FOR_JOIN_AT_EXIT = 0x0000_1000;
        /// Waiting for the reply to a remote operation
        const WAITING_FOR_RPC_REPLY = 0x0000_2000;
        const WAITING_FOR_PERIOD = 0x0000_4000;
        const WAITING_FOR_SIGNAL = 0x0000_8000;
        /// The wait may be broken by a signal
        const INTERRUPTIBLE_BY_SIGNAL = 0x0001_0000;

        /// Blocked on a local resource
        const LOCALLY_BLOCKED = Self::WAITING_FOR_BUFFER.bits()
            | Self::WAITING_FOR_SEGMENT.bits()
            | Self::WAITING_FOR_MESSAGE.bits()
            | Self::WAITING_FOR_SEMAPHORE.bits()
            | Self::WAITING_FOR_MUTEX.bits()
            | Self::WAITING_FOR_CONDITION_VARIABLE.bits()
            | Self::WAITING_FOR_JOIN_AT_EXIT.bits()
            | Self::WAITING_FOR_SIGNAL.bits();

        /// Enqueued on some thread queue
        const WAITING_ON_THREAD_QUEUE = Self::LOCALLY_BLOCKED.bits()
            | Self::WAITING_FOR_RPC_REPLY.bits();

        /// Not schedulable for a reason other than the lifecycle bits
        const BLOCKED = Self::DELAYING.bits()
            | Self::WAITING_FOR_TIME.bits()
            | Self::WAITING_FOR_PERIOD.bits()
            | Self::WAITING_FOR_EVENT.bits()
            | Self::WAITING_ON_THREAD_QUEUE.bits()
            | Self::INTERRUPTIBLE_BY_SIGNAL.bits();
    }
}

impl ThreadState {
    /// The ready state (no bit set)
    pub const READY: ThreadState = ThreadState::empty();

    /// `self | bits`
    #[inline]
    #[must_use]
    pub const fn with_bits(self, bits: ThreadState) -> ThreadState {
        self.union(bits)
    }

    /// `self & !bits`
    #[inline]
    #[must_use]
    pub const fn without_bits(self, bits: ThreadState) -> ThreadState {
        self.difference(bits)
    }

    #[inline]
    pub const fn is_ready(self) -> bool {
        self.is_empty()
    }

    /// Exactly `DORMANT` and nothing else
    #[inline]
    pub const fn is_only_dormant(self) -> bool {
        self.bits() == Self::DORMANT.bits()
    }

    #[inline]
    pub const fn is_dormant(self) -> bool {
        self.intersects(Self::DORMANT)
    }

    #[inline]
    pub const fn is_suspended(self) -> bool {
        self.intersects(Self::SUSPENDED)
    }

    #[inline]
    pub const fn is_transient(self) -> bool {
        self.intersects(Self::TRANSIENT)
    }

    #[inline]
    pub const fn is_delaying(self) -> bool {
        self.intersects(Self::DELAYING)
    }

    #[inline]
    pub const fn is_waiting_for_time(self) -> bool {
        self.intersects(Self::WAITING_FOR_TIME)
    }

    #[inline]
    pub const fn is_waiting_for_semaphore(self) -> bool {
        self.intersects(Self::WAITING_FOR_SEMAPHORE)
    }

    #[inline]
    pub const fn is_waiting_for_mutex(self) -> bool {
        self.intersects(Self::WAITING_FOR_MUTEX)
    }

    #[inline]
    pub const fn is_waiting_for_event(self) -> bool {
        self.intersects(Self::WAITING_FOR_EVENT)
    }

    #[inline]
    pub const fn is_waiting_for_period(self) -> bool {
        self.intersects(Self::WAITING_FOR_PERIOD)
    }

    #[inline]
    pub const fn is_waiting_for_rpc_reply(self) -> bool {
        self.intersects(Self::WAITING_FOR_RPC_REPLY)
    }

    #[inline]
    pub const fn is_interruptible_by_signal(self) -> bool {
        self.intersects(Self::INTERRUPTIBLE_BY_SIGNAL)
    }

    #[inline]
    pub const fn is_locally_blocked(self) -> bool {
        self.intersects(Self::LOCALLY_BLOCKED)
    }

    #[inline]
    pub const fn is_waiting_on_thread_queue(self) -> bool {
        self.intersects(Self::WAITING_ON_THREAD_QUEUE)
    }

    #[inline]
    pub const fn is_blocked(self) -> bool {
        self.intersects(Self::BLOCKED)
    }
}

impl Default for ThreadState {
    fn default() -> Self {
        Self::READY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_is_all_zero() {
        assert!(ThreadState::READY.is_ready());
        assert!(!ThreadState::DORMANT.is_ready());
        assert_eq!(ThreadState::default().bits(), 0);
    }

    #[test]
    fn set_and_clear() {
        let state = ThreadState::READY
            .with_bits(ThreadState::SUSPENDED)
            .with_bits(ThreadState::WAITING_FOR_SEMAPHORE);
        assert!(state.is_suspended());
        assert!(state.is_waiting_for_semaphore());
        assert!(state.is_blocked());

        let state = state.without_bits(ThreadState::WAITING_FOR_SEMAPHORE);
        assert!(!state.is_blocked());
        assert!(!state.is_ready());
        assert!(state.without_bits(ThreadState::SUSPENDED).is_ready());
    }

    #[test]
    fn only_dormant_requires_exact_match() {
        assert!(ThreadState::DORMANT.is_only_dormant());
        assert!(!(ThreadState::DORMANT | ThreadState::SUSPENDED).is_only_dormant());
        assert!(!ThreadState::READY.is_only_dormant());
    }

    #[test]
    fn aggregate_masks_nest() {
        assert!(ThreadState::WAITING_ON_THREAD_QUEUE.contains(ThreadState::LOCALLY_BLOCKED));
        assert!(ThreadState::BLOCKED.contains(ThreadState::WAITING_ON_THREAD_QUEUE));
        assert!(!ThreadState::BLOCKED.intersects(ThreadState::DORMANT | ThreadState::SUSPENDED));
        assert!(ThreadState::WAITING_FOR_RPC_REPLY.is_waiting_on_thread_queue());
        assert!(!ThreadState::WAITING_FOR_RPC_REPLY.is_locally_blocked());
    }

    #[test]
    fn blocked_iff_blocked_bit_set() {
        // Every single-bit state plus a few combinations
        for shift in 0..17 {
            let state = ThreadState::from_bits_truncate(1 << shift);
            assert_eq!(state.is_blocked(), (state & ThreadState::BLOCKED).bits() != 0);
            assert_eq!(state.is_ready(), state.bits() == 0);

            let combined = state | ThreadState::SUSPENDED;
            assert_eq!(combined.is_blocked(), state.is_blocked());
            assert!(!combined.is_ready());
        }
    }

    #[test]
    fn undefined_bits_are_dropped() {
        let state = ThreadState::from_bits_truncate(0xffff_ffff);
        assert_eq!(state, ThreadState::all());
        assert!(ThreadState::from_bits(0x8000_0000).is_none());
    }
}

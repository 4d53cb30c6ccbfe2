//! Kernel state
//!
//! One [`Kernel`] value holds everything the core shares between processors
//! and interrupt handlers: the thread table, the watchdog table and the SMP
//! scheduler, each under its own ISR lock, plus the tick counter. It is
//! created once with a [`KernelConfig`] and passed by reference to every
//! operation.
//!
//! ## Lock order
//!
//! thread queue -> thread table -> watchdogs -> scheduler
//!
//! Paths that start from a thread handle (extract, timeout, priority change)
//! read the thread's queue membership under the thread table lock, drop it,
//! and then enter the queue, which takes the thread table lock again.
//!
//! ## Thread states driven from here
//!
//! - `DORMANT`: from creation until [`Kernel::start_thread`]
//! - `SUSPENDED`: [`Kernel::suspend`] / [`Kernel::resume`]
//! - `WAITING_FOR_TIME`: [`Kernel::delay`] until its watchdog fires
//! - thread queue bits: set by `enqueue`, cleared when the wait ends
//!
//! Whenever a thread's state turns ready or stops being ready, the scheduler
//! is told and recomputes the heirs.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use static_assertions::assert_impl_all;

use crate::config::KernelConfig;
use crate::error::{KernelError, Result};
use crate::objects::tcb::{ThreadControl, ThreadTable};
use crate::objects::thread_queue::WaitQueue;
use crate::objects::{ObjectId, Priority, ThreadId, ThreadState, WaitStatus};
use crate::scheduler::{ContextSwitch, SmpScheduler, Timestamp};
use crate::sync::{IsrLock, IsrLockGuard};
use crate::watchdog::{WatchdogId, WatchdogRoutine, Watchdogs};

pub use crate::objects::tcb::ThreadAttributes;

/// Process-wide kernel state
pub struct Kernel {
    config: KernelConfig,
    threads: IsrLock<ThreadTable>,
    watchdogs: IsrLock<Watchdogs>,
    scheduler: IsrLock<SmpScheduler>,
    /// Clock ticks since creation
    uptime: AtomicU64,
}

assert_impl_all!(Kernel: Send, Sync);

impl Kernel {
    /// Create the kernel state described by `config`
    pub fn new(config: KernelConfig) -> Result<Self> {
        config.validate()?;
        let scheduler = SmpScheduler::new(config.cpu_count, config.maximum_threads)?;

        log::debug!(
            "kernel: {} cpu(s), {} thread(s), {} watchdog(s)",
            config.cpu_count,
            config.maximum_threads,
            config.maximum_watchdogs
        );

        Ok(Self {
            config,
            threads: IsrLock::new("threads", ThreadTable::new(config.maximum_threads)),
            watchdogs: IsrLock::new("watchdogs", Watchdogs::new(config.maximum_watchdogs)),
            scheduler: IsrLock::new("scheduler", scheduler),
            uptime: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Clock ticks since creation
    pub fn uptime(&self) -> Timestamp {
        self.uptime.load(Ordering::Acquire)
    }

    pub(crate) fn threads(&self) -> IsrLockGuard<'_, ThreadTable> {
        self.threads.lock()
    }

    pub(crate) fn arm_watchdog(&self, ticks: u32, routine: WatchdogRoutine) -> Result<WatchdogId> {
        self.watchdogs.lock().insert_ticks(ticks, routine)
    }

    fn cancel_watchdog(&self, tcb: &mut ThreadControl) {
        if let Some(id) = tcb.timer.take() {
            self.watchdogs.lock().remove(id);
        }
    }

    /// Set the state of `tcb`, moving it in or out of the ready set
    ///
    /// Caller holds the thread table lock.
    pub(crate) fn change_state(&self, tcb: &mut ThreadControl, state: ThreadState) -> Result<()> {
        let was_ready = tcb.state.is_ready();
        tcb.state = state;

        match (was_ready, state.is_ready()) {
            (true, false) => self.scheduler.lock().block(tcb.id),
            (false, true) => self.scheduler.lock().unblock(tcb.id),
            _ => Ok(()),
        }
    }

    /// End the thread queue wait of `tcb` with `status`
    ///
    /// Caller holds the thread table lock and has already removed the
    /// waiter record (or the queue is gone).
    pub(crate) fn finish_wait(&self, tcb: &mut ThreadControl, status: WaitStatus) -> Result<()> {
        let blocking = tcb.wait.blocking_state;
        tcb.wait.clear_membership();
        tcb.wait.return_code = status;
        self.cancel_watchdog(tcb);

        let state = tcb.state.without_bits(blocking);
        self.change_state(tcb, state)
    }

    /// Create a dormant thread
    pub fn create_thread(&self, attributes: ThreadAttributes) -> Result<ThreadId> {
        let mut threads = self.threads();
        let thread = threads.allocate(&attributes)?;

        if let Err(error) =
            self.scheduler
                .lock()
                .add_thread(thread, attributes.priority, attributes.preemptible)
        {
            threads.release(thread)?;
            return Err(error);
        }

        log::debug!(
            "thread {} created (object {}, priority {})",
            thread,
            attributes.object_id,
            attributes.priority
        );
        Ok(thread)
    }

    /// Make a dormant thread eligible to run
    pub fn start_thread(&self, thread: ThreadId) -> Result<()> {
        let mut threads = self.threads();
        let tcb = threads.get_mut(thread)?;
        if !tcb.state.is_dormant() {
            return Err(KernelError::NotDormant(thread));
        }

        let state = tcb.state.without_bits(ThreadState::DORMANT);
        self.change_state(tcb, state)
    }

    /// Delete a thread in any state
    ///
    /// A waiting thread is taken off its queue first and its watchdog is
    /// cancelled; processors running it are sent to their next heir.
    pub fn delete_thread(&self, thread: ThreadId) -> Result<()> {
        self.extract_with_return_code(thread, WaitStatus::ObjectWasDeleted)?;

        let mut threads = self.threads();
        let tcb = threads.get_mut(thread)?;
        self.cancel_watchdog(tcb);
        self.scheduler.lock().remove_thread(thread)?;
        threads.release(thread)?;

        log::debug!("thread {} deleted", thread);
        Ok(())
    }

    /// Set `bits` in the state of `thread`
    pub fn set_state(&self, thread: ThreadId, bits: ThreadState) -> Result<ThreadState> {
        let mut threads = self.threads();
        let tcb = threads.get_mut(thread)?;
        let state = tcb.state.with_bits(bits);
        self.change_state(tcb, state)?;
        Ok(state)
    }

    /// Clear `bits` in the state of `thread`
    ///
    /// Bits held by an ongoing thread queue wait stay set; the wait has to
    /// end through the queue. Clearing `WAITING_FOR_TIME` ends a delay early.
    pub fn clear_state(&self, thread: ThreadId, bits: ThreadState) -> Result<ThreadState> {
        let mut threads = self.threads();
        let tcb = threads.get_mut(thread)?;
        let bits = bits.without_bits(tcb.wait.blocking_state);

        if bits.is_waiting_for_time() && tcb.state.is_waiting_for_time() && !tcb.is_waiting() {
            self.cancel_watchdog(tcb);
        }

        let state = tcb.state.without_bits(bits);
        self.change_state(tcb, state)?;
        Ok(state)
    }

    pub fn suspend(&self, thread: ThreadId) -> Result<()> {
        self.set_state(thread, ThreadState::SUSPENDED).map(drop)
    }

    pub fn resume(&self, thread: ThreadId) -> Result<()> {
        self.clear_state(thread, ThreadState::SUSPENDED).map(drop)
    }

    /// Block `thread` for `ticks` clock ticks
    ///
    /// A zero delay yields the processor instead.
    pub fn delay(&self, thread: ThreadId, ticks: u32) -> Result<()> {
        if ticks == 0 {
            return self.yield_thread(thread);
        }

        let mut threads = self.threads();
        let tcb = threads.get_mut(thread)?;
        if tcb.is_waiting() || tcb.timer.is_some() {
            return Err(KernelError::AlreadyWaiting(thread));
        }

        let ticket = tcb.next_ticket();
        tcb.timer = Some(self.arm_watchdog(ticks, WatchdogRoutine::DelayEnded { thread, ticket })?);
        let state = tcb.state.with_bits(ThreadState::WAITING_FOR_TIME);
        self.change_state(tcb, state)
    }

    /// Change the priority of `thread`
    ///
    /// A ready thread moves behind its new equal-priority peers; a thread
    /// waiting on a priority-discipline queue is re-sorted there.
    pub fn set_priority(&self, thread: ThreadId, priority: Priority) -> Result<Priority> {
        let (previous, membership) = {
            let mut threads = self.threads();
            let tcb = threads.get_mut(thread)?;
            let previous = core::mem::replace(&mut tcb.priority, priority);
            self.scheduler.lock().update_priority(thread, priority)?;

            let membership = match (&tcb.wait.queue, tcb.wait.node) {
                (Some(queue), Some(node)) => Some((queue.clone(), tcb.ticket, node)),
                _ => None,
            };
            (previous, membership)
        };

        if let Some((queue, ticket, node)) = membership {
            if let Some(queue) = queue.upgrade() {
                queue.requeue(thread, ticket, node, priority);
            }
        }
        Ok(previous)
    }

    pub fn priority(&self, thread: ThreadId) -> Result<Priority> {
        Ok(self.threads().get(thread)?.priority)
    }

    pub fn set_preemptible(&self, thread: ThreadId, preemptible: bool) -> Result<()> {
        let mut threads = self.threads();
        let tcb = threads.get_mut(thread)?;
        tcb.preemptible = preemptible;
        self.scheduler.lock().set_preemptible(thread, preemptible)
    }

    /// Let equal-priority peers of `thread` run first
    pub fn yield_thread(&self, thread: ThreadId) -> Result<()> {
        let threads = self.threads();
        threads.get(thread)?;
        self.scheduler.lock().yield_thread(thread)
    }

    pub fn state(&self, thread: ThreadId) -> Result<ThreadState> {
        Ok(self.threads().get(thread)?.state)
    }

    /// How the last thread queue wait of `thread` ended
    pub fn wait_status(&self, thread: ThreadId) -> Result<WaitStatus> {
        Ok(self.threads().get(thread)?.wait.return_code)
    }

    /// Object whose queue `thread` is blocked on, if any
    pub fn waiting_on(&self, thread: ThreadId) -> Result<Option<ObjectId>> {
        let threads = self.threads();
        let tcb = threads.get(thread)?;
        Ok(tcb.is_waiting().then_some(tcb.wait.object_id))
    }

    /// Release `thread` from its queue with [`WaitStatus::Successful`]
    ///
    /// Returns false if it was not waiting.
    pub fn extract(&self, thread: ThreadId) -> Result<bool> {
        self.extract_with_return_code(thread, WaitStatus::Successful)
    }

    /// Release `thread` from its queue with `code`
    pub fn extract_with_return_code(&self, thread: ThreadId, code: WaitStatus) -> Result<bool> {
        self.release(thread, Some(code), None)
    }

    /// Time out the wait of `thread` now, with its queue's timeout status
    ///
    /// Returns false if the thread was no longer waiting.
    pub fn timeout(&self, thread: ThreadId) -> Result<bool> {
        self.release(thread, None, None)
    }

    /// Release `thread` from its queue
    ///
    /// With `expected_ticket`, only the blocking episode with that ticket is
    /// ended. A thread whose queue was dropped while it waited is released
    /// with [`WaitStatus::ObjectWasDeleted`].
    fn release(
        &self,
        thread: ThreadId,
        status: Option<WaitStatus>,
        expected_ticket: Option<u32>,
    ) -> Result<bool> {
        let (queue, ticket, node) = {
            let threads = self.threads();
            let tcb = threads.get(thread)?;
            if expected_ticket.is_some_and(|expected| expected != tcb.ticket) {
                return Ok(false);
            }
            match (&tcb.wait.queue, tcb.wait.node) {
                (Some(queue), Some(node)) => (queue.clone(), tcb.ticket, node),
                _ => return Ok(false),
            }
        };

        if let Some(queue) = queue.upgrade() {
            return queue.extract(self, thread, ticket, node, status);
        }

        let mut threads = self.threads();
        let tcb = threads.get_mut(thread)?;
        let orphaned = tcb.ticket == ticket
            && tcb
                .wait
                .queue
                .as_ref()
                .is_some_and(|queue| queue.strong_count() == 0);
        if !orphaned {
            return Ok(false);
        }
        self.finish_wait(tcb, WaitStatus::ObjectWasDeleted)?;
        Ok(true)
    }

    fn fire(&self, routine: WatchdogRoutine) -> Result<bool> {
        match routine {
            WatchdogRoutine::ThreadQueueTimeout { thread, ticket } => {
                self.release(thread, None, Some(ticket))
            }
            WatchdogRoutine::DelayEnded { thread, ticket } => {
                let mut threads = self.threads();
                let tcb = threads.get_mut(thread)?;
                if tcb.ticket != ticket || !tcb.state.is_waiting_for_time() {
                    return Ok(false);
                }
                tcb.timer = None;
                let state = tcb.state.without_bits(ThreadState::WAITING_FOR_TIME);
                self.change_state(tcb, state)?;
                Ok(true)
            }
        }
    }

    /// Clock tick: advance uptime and run every watchdog that expires
    ///
    /// Each routine runs with no kernel lock held. Returns the number of
    /// watchdogs that fired.
    pub fn tick(&self) -> usize {
        self.uptime.fetch_add(1, Ordering::AcqRel);
        self.watchdogs.lock().advance();

        let mut fired = 0;
        loop {
            let expired = self.watchdogs.lock().pop_expired();
            let Some((id, routine)) = expired else {
                break;
            };

            fired += 1;
            match self.fire(routine) {
                Ok(_) => {}
                // Thread deleted after its watchdog expired
                Err(KernelError::InvalidThread(_)) => {}
                Err(error) => log::warn!("watchdog {}: {}", id, error),
            }
        }
        fired
    }

    /// Number of armed watchdogs
    pub fn armed_watchdogs(&self) -> usize {
        self.watchdogs.lock().active_count()
    }

    /// Number of live threads
    pub fn thread_count(&self) -> usize {
        self.threads().len()
    }

    /// Recompute the heir of every processor
    pub fn schedule(&self) {
        self.scheduler.lock().schedule();
    }

    /// Switch `cpu` to its heir if a dispatch is pending
    pub fn dispatch(&self, cpu: usize) -> Result<Option<ContextSwitch>> {
        let now = self.uptime();
        self.scheduler.lock().dispatch(cpu, now)
    }

    pub fn executing(&self, cpu: usize) -> Result<Option<ThreadId>> {
        self.scheduler.lock().executing(cpu)
    }

    pub fn heir(&self, cpu: usize) -> Result<Option<ThreadId>> {
        self.scheduler.lock().heir(cpu)
    }

    pub fn dispatch_necessary(&self, cpu: usize) -> Result<bool> {
        self.scheduler.lock().is_dispatch_necessary(cpu)
    }

    /// Ready threads, most urgent first
    pub fn ready_threads(&self) -> Vec<ThreadId> {
        self.scheduler.lock().ready_threads()
    }

    /// Ticket and waiter record of the current wait of `thread`
    #[cfg(test)]
    pub(crate) fn wait_ticket(&self, thread: ThreadId) -> Option<(u32, crate::chain::NodeId)> {
        let threads = self.threads();
        let tcb = threads.get(thread).ok()?;
        Some((tcb.ticket, tcb.wait.node?))
    }
}

impl core::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.config)
            .field("uptime", &self.uptime())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{Discipline, ThreadQueue, Timeout};

    fn kernel(cpus: usize) -> Kernel {
        Kernel::new(KernelConfig::new(cpus).with_maximum_threads(8)).unwrap()
    }

    #[test]
    fn kernel_rejects_bad_config() {
        assert_eq!(
            Kernel::new(KernelConfig::new(0)).unwrap_err(),
            KernelError::InvalidConfig("cpu_count must be in 1..=MAX_CPUS")
        );
    }

    #[test]
    fn kernel_thread_lifecycle() {
        let kernel = kernel(1);
        let thread = kernel.create_thread(ThreadAttributes::new(Priority(3))).unwrap();
        assert!(kernel.state(thread).unwrap().is_only_dormant());
        assert!(kernel.ready_threads().is_empty());

        kernel.start_thread(thread).unwrap();
        assert_eq!(kernel.start_thread(thread), Err(KernelError::NotDormant(thread)));
        assert_eq!(kernel.heir(0).unwrap(), Some(thread));
        assert_eq!(kernel.dispatch(0).unwrap().unwrap().to, Some(thread));
        assert_eq!(kernel.executing(0).unwrap(), Some(thread));

        kernel.delete_thread(thread).unwrap();
        assert_eq!(kernel.thread_count(), 0);
        assert_eq!(kernel.state(thread), Err(KernelError::InvalidThread(thread)));
        assert!(kernel.dispatch_necessary(0).unwrap());
        assert_eq!(kernel.dispatch(0).unwrap().unwrap().to, None);
    }

    #[test]
    fn kernel_suspend_resume() {
        let kernel = kernel(1);
        let thread = kernel.create_thread(ThreadAttributes::new(Priority(3))).unwrap();
        kernel.start_thread(thread).unwrap();

        kernel.suspend(thread).unwrap();
        assert!(kernel.state(thread).unwrap().is_suspended());
        assert!(kernel.ready_threads().is_empty());

        kernel.resume(thread).unwrap();
        assert!(kernel.state(thread).unwrap().is_ready());
        assert_eq!(kernel.ready_threads(), [thread]);
    }

    #[test]
    fn kernel_delay_ends_on_tick() {
        let kernel = kernel(1);
        let thread = kernel.create_thread(ThreadAttributes::new(Priority(3))).unwrap();
        kernel.start_thread(thread).unwrap();

        kernel.delay(thread, 2).unwrap();
        assert!(kernel.state(thread).unwrap().is_waiting_for_time());
        assert_eq!(kernel.delay(thread, 1), Err(KernelError::AlreadyWaiting(thread)));

        assert_eq!(kernel.tick(), 0);
        assert_eq!(kernel.tick(), 1);
        assert!(kernel.state(thread).unwrap().is_ready());
        assert_eq!(kernel.uptime(), 2);
    }

    #[test]
    fn kernel_clear_state_ends_delay_early() {
        let kernel = kernel(1);
        let thread = kernel.create_thread(ThreadAttributes::new(Priority(3))).unwrap();
        kernel.start_thread(thread).unwrap();
        kernel.delay(thread, 5).unwrap();

        kernel.clear_state(thread, ThreadState::WAITING_FOR_TIME).unwrap();
        assert_eq!(kernel.armed_watchdogs(), 0);
        assert!(kernel.state(thread).unwrap().is_ready());
    }

    #[test]
    fn kernel_clear_state_keeps_queue_bits() {
        let kernel = kernel(1);
        let queue = ThreadQueue::initialize(ObjectId(1), Discipline::Fifo, WaitStatus::Timeout, ());
        let thread = kernel.create_thread(ThreadAttributes::new(Priority(3))).unwrap();
        kernel.start_thread(thread).unwrap();
        queue
            .acquire()
            .enqueue(&kernel, thread, ThreadState::WAITING_FOR_SEMAPHORE, Timeout::Forever)
            .unwrap();

        let state = kernel.clear_state(thread, ThreadState::all()).unwrap();
        assert!(state.is_waiting_for_semaphore());
        assert_eq!(kernel.waiting_on(thread).unwrap(), Some(ObjectId(1)));
    }

    #[test]
    fn kernel_delete_waiting_thread() {
        let kernel = kernel(1);
        let queue = ThreadQueue::initialize(ObjectId(2), Discipline::Fifo, WaitStatus::Timeout, ());
        let thread = kernel.create_thread(ThreadAttributes::new(Priority(3))).unwrap();
        kernel.start_thread(thread).unwrap();
        queue
            .acquire()
            .enqueue(&kernel, thread, ThreadState::WAITING_FOR_SEMAPHORE, Timeout::Ticks(3))
            .unwrap();

        kernel.delete_thread(thread).unwrap();
        assert!(queue.is_empty());
        assert_eq!(kernel.armed_watchdogs(), 0);
        for _ in 0..4 {
            kernel.tick();
        }
    }

    #[test]
    fn kernel_dropped_queue_releases_waiter() {
        let kernel = kernel(1);
        let queue = ThreadQueue::initialize(ObjectId(3), Discipline::Fifo, WaitStatus::Timeout, ());
        let thread = kernel.create_thread(ThreadAttributes::new(Priority(3))).unwrap();
        kernel.start_thread(thread).unwrap();
        queue
            .acquire()
            .enqueue(&kernel, thread, ThreadState::WAITING_FOR_SEMAPHORE, Timeout::Ticks(1))
            .unwrap();
        drop(queue);

        assert_eq!(kernel.tick(), 1);
        assert_eq!(kernel.wait_status(thread).unwrap(), WaitStatus::ObjectWasDeleted);
        assert!(kernel.state(thread).unwrap().is_ready());
    }

    #[test]
    fn kernel_priority_change_reorders_ready_set() {
        let kernel = kernel(1);
        let a = kernel.create_thread(ThreadAttributes::new(Priority(3))).unwrap();
        let b = kernel.create_thread(ThreadAttributes::new(Priority(5))).unwrap();
        kernel.start_thread(a).unwrap();
        kernel.start_thread(b).unwrap();
        assert_eq!(kernel.ready_threads(), [a, b]);

        assert_eq!(kernel.set_priority(b, Priority(1)).unwrap(), Priority(5));
        assert_eq!(kernel.priority(b).unwrap(), Priority(1));
        assert_eq!(kernel.ready_threads(), [b, a]);
        assert_eq!(kernel.heir(0).unwrap(), Some(b));
    }

    #[test]
    fn kernel_yield_and_preemptibility() {
        let kernel = kernel(1);
        let a = kernel.create_thread(ThreadAttributes::new(Priority(4))).unwrap();
        let b = kernel.create_thread(ThreadAttributes::new(Priority(4))).unwrap();
        kernel.start_thread(a).unwrap();
        kernel.start_thread(b).unwrap();
        kernel.dispatch(0).unwrap();

        kernel.delay(a, 0).unwrap();
        assert_eq!(kernel.heir(0).unwrap(), Some(b));
        kernel.dispatch(0).unwrap();

        let urgent = kernel.create_thread(ThreadAttributes::new(Priority(1))).unwrap();
        kernel.set_preemptible(b, false).unwrap();
        kernel.start_thread(urgent).unwrap();
        assert_eq!(kernel.heir(0).unwrap(), Some(urgent));
        assert!(!kernel.dispatch_necessary(0).unwrap());
        assert_eq!(kernel.executing(0).unwrap(), Some(b));
    }
}

//! Thread Queue - generic blocking and waking
//!
//! Every "wait for a resource" object (semaphores here, and mutexes or
//! message queues built the same way) owns a [`ThreadQueue`]. The queue keeps
//! the waiters in FIFO order or by priority (FIFO among equal priorities),
//! together with the object's own data `T` under one ISR lock. Holding the
//! lock therefore means holding the object.
//!
//! ## Per-thread state machine
//!
//! ```text
//! not queued --enqueue--> blocked --+-- extract ---------> not queued (Successful / any code)
//!                                   +-- timeout ---------> not queued (queue's timeout status)
//!                                   +-- flush -----------> not queued (flush status)
//!                                   +-- object deleted --> not queued (ObjectWasDeleted)
//! ```
//!
//! ## Operations
//!
//! - [`ThreadQueue::acquire`]: lock the queue, yielding a [`ThreadQueueGuard`]
//! - [`ThreadQueueGuard::enqueue`]: block a thread and release the lock
//! - [`ThreadQueueGuard::extract_first`]: release the next waiter
//! - [`ThreadQueueGuard::flush`]: release every waiter
//! - [`Kernel::extract`](crate::Kernel::extract) /
//!   [`Kernel::timeout`](crate::Kernel::timeout): release one specific thread
//!
//! ## Timeout race
//!
//! Each waiter record carries the thread and the ticket of its blocking
//! episode. The timeout path (and any targeted extract) re-checks both under
//! the queue lock before touching the record, so whichever path gets the lock
//! first releases the thread and the other finds nothing to do.

use alloc::sync::{Arc, Weak};
use core::ops::{Deref, DerefMut};

use crate::chain::{Chain, NodeArray, NodeId};
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::sync::{IsrLock, IsrLockGuard};
use crate::watchdog::WatchdogRoutine;

use super::tcb::WaitInfo;
use super::{ObjectId, Priority, ThreadId, ThreadState, Timeout, WaitStatus};

/// Waiter ordering of a thread queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Discipline {
    /// Arrival order
    #[default]
    Fifo,
    /// Most urgent priority first, arrival order among equals
    Priority,
}

/// Queue-side record of one blocked thread
#[derive(Debug, Clone, Copy)]
struct Waiter {
    thread: Option<ThreadId>,
    priority: Priority,
    ticket: u32,
}

impl Waiter {
    const VACANT: Waiter = Waiter {
        thread: None,
        priority: Priority::LEAST_URGENT,
        ticket: 0,
    };
}

/// Waiter records plus the chain ordering them
///
/// Records are recycled through a free chain and the storage only grows when
/// more threads wait at once than ever before.
#[derive(Debug, Default)]
struct Waiters {
    nodes: NodeArray<Waiter>,
    queue: Chain,
    free: Chain,
}

impl Waiters {
    fn insert(&mut self, discipline: Discipline, waiter: Waiter) -> NodeId {
        let node = match self.free.get_unprotected(&mut self.nodes) {
            Some(node) => node,
            None => self.nodes.push(Waiter::VACANT),
        };
        self.nodes[node] = waiter;
        self.link(discipline, node);
        node
    }

    fn link(&mut self, discipline: Discipline, node: NodeId) {
        match discipline {
            Discipline::Fifo => self.queue.append_unprotected(&mut self.nodes, node),
            Discipline::Priority => {
                self.queue
                    .insert_ordered_unprotected(&mut self.nodes, node, |nodes, new, other| {
                        nodes[new].priority.is_more_urgent_than(nodes[other].priority)
                    })
            }
        }
    }

    fn remove(&mut self, node: NodeId) {
        self.queue.extract_unprotected(&mut self.nodes, node);
        self.nodes[node] = Waiter::VACANT;
        self.free.append_unprotected(&mut self.nodes, node);
    }

    /// Whether `node` still records this blocking episode of `thread`
    fn matches(&self, node: NodeId, thread: ThreadId, ticket: u32) -> bool {
        self.nodes
            .get(node)
            .is_some_and(|waiter| waiter.thread == Some(thread) && waiter.ticket == ticket)
    }

    fn first(&self) -> Option<(NodeId, ThreadId)> {
        let node = self.queue.first_node()?;
        let thread = self.nodes[node].thread?;
        Some((node, thread))
    }

    fn len(&self) -> usize {
        self.queue.node_count_unprotected(&self.nodes)
    }

    fn threads(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.queue
            .iter(&self.nodes)
            .filter_map(|node| self.nodes[node].thread)
    }
}

#[derive(Debug, Default)]
struct QueueInner<T> {
    waiters: Waiters,
    data: T,
}

/// Blocking queue of threads guarding an object's data `T`
#[derive(Debug)]
pub struct ThreadQueue<T = ()> {
    object_id: ObjectId,
    discipline: Discipline,
    timeout_status: WaitStatus,
    inner: IsrLock<QueueInner<T>>,
}

impl<T: Send + 'static> ThreadQueue<T> {
    /// Create an empty queue guarding `data`
    ///
    /// # Arguments
    ///
    /// * `object_id` - label of the owning object, recorded in each waiter
    /// * `discipline` - waiter ordering
    /// * `timeout_status` - result reported to a thread whose wait times out
    pub const fn new(
        object_id: ObjectId,
        discipline: Discipline,
        timeout_status: WaitStatus,
        data: T,
    ) -> Self {
        Self {
            object_id,
            discipline,
            timeout_status,
            inner: IsrLock::new(
                "thread_queue",
                QueueInner {
                    waiters: Waiters {
                        nodes: NodeArray::new(),
                        queue: Chain::new(),
                        free: Chain::new(),
                    },
                    data,
                },
            ),
        }
    }

    /// Shared queue ready to be waited on
    pub fn initialize(
        object_id: ObjectId,
        discipline: Discipline,
        timeout_status: WaitStatus,
        data: T,
    ) -> Arc<Self> {
        Arc::new(Self::new(object_id, discipline, timeout_status, data))
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn discipline(&self) -> Discipline {
        self.discipline
    }

    pub fn timeout_status(&self) -> WaitStatus {
        self.timeout_status
    }

    /// Lock the queue (and the object data with it)
    pub fn acquire(self: &Arc<Self>) -> ThreadQueueGuard<'_, T> {
        ThreadQueueGuard {
            queue: self,
            inner: self.inner.lock(),
        }
    }

    /// Next thread to be released, without removing it
    pub fn first(&self) -> Option<ThreadId> {
        self.inner.lock().waiters.first().map(|(_, thread)| thread)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().waiters.queue.is_empty()
    }

    /// Number of blocked threads
    pub fn len(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

/// Locked thread queue
///
/// Dereferences to the object data. Dropping the guard (or handing it to
/// [`enqueue`](Self::enqueue)) releases the lock.
pub struct ThreadQueueGuard<'a, T: Send + 'static> {
    queue: &'a Arc<ThreadQueue<T>>,
    inner: IsrLockGuard<'a, QueueInner<T>>,
}

impl<T: Send + 'static> ThreadQueueGuard<'_, T> {
    /// Block `thread` on this queue and release the lock
    ///
    /// Sets `state` (a thread queue blocking bit) on the thread, which takes
    /// it out of the ready set, and arms a watchdog unless `timeout` is
    /// [`Timeout::Forever`]. The function returns once the thread is blocked;
    /// how the wait ended is read with [`Kernel::wait_status`] after the
    /// thread has been released.
    ///
    /// A thread already blocked on a queue or delaying is rejected with
    /// [`KernelError::AlreadyWaiting`]. On error the thread is left untouched.
    pub fn enqueue(
        mut self,
        kernel: &Kernel,
        thread: ThreadId,
        state: ThreadState,
        timeout: Timeout,
    ) -> Result<()> {
        debug_assert!(
            ThreadState::WAITING_ON_THREAD_QUEUE.contains(state) && !state.is_empty(),
            "enqueue with a state that is not a thread queue blocking state"
        );

        let queue = self.queue;
        let mut threads = kernel.threads();
        let tcb = threads.get_mut(thread)?;
        if tcb.is_waiting() || tcb.timer.is_some() {
            return Err(KernelError::AlreadyWaiting(thread));
        }

        let ticket = tcb.next_ticket();
        let node = self.inner.waiters.insert(
            queue.discipline,
            Waiter {
                thread: Some(thread),
                priority: tcb.priority,
                ticket,
            },
        );

        if let Timeout::Ticks(ticks) = timeout {
            let routine = WatchdogRoutine::ThreadQueueTimeout { thread, ticket };
            match kernel.arm_watchdog(ticks, routine) {
                Ok(id) => tcb.timer = Some(id),
                Err(error) => {
                    self.inner.waiters.remove(node);
                    return Err(error);
                }
            }
        }

        let weak: Weak<ThreadQueue<T>> = Arc::downgrade(queue);
        let membership: Weak<dyn WaitQueue> = weak;
        tcb.wait = WaitInfo {
            queue: Some(membership),
            object_id: queue.object_id,
            node: Some(node),
            blocking_state: state,
            return_code: WaitStatus::Successful,
        };

        let blocked = tcb.state.with_bits(state);
        kernel.change_state(tcb, blocked)?;
        ktq_debug!(
            "[tq] {} blocks on {} ({:?}, {:?})",
            thread,
            queue.object_id,
            state,
            timeout
        );
        Ok(())
    }

    /// Next thread to be released, without removing it
    pub fn first(&self) -> Option<ThreadId> {
        self.inner.waiters.first().map(|(_, thread)| thread)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.waiters.queue.is_empty()
    }

    /// Number of blocked threads
    pub fn len(&self) -> usize {
        self.inner.waiters.len()
    }

    /// Blocked threads in release order
    pub fn waiting_threads(&self) -> alloc::vec::Vec<ThreadId> {
        self.inner.waiters.threads().collect()
    }

    /// Release the next waiter with `status`
    ///
    /// Returns the thread made ready, or `None` if nobody was waiting.
    pub fn extract_first(
        &mut self,
        kernel: &Kernel,
        status: WaitStatus,
    ) -> Result<Option<ThreadId>> {
        while let Some((node, thread)) = self.inner.waiters.first() {
            if release_waiter(&mut *self.inner, kernel, node, thread, status)? {
                return Ok(Some(thread));
            }
        }
        Ok(None)
    }

    /// Release every waiter with `status`, in release order
    ///
    /// `callout` runs for each released thread while the queue is still
    /// locked. Returns the number of threads released.
    pub fn flush(
        &mut self,
        kernel: &Kernel,
        status: WaitStatus,
        mut callout: impl FnMut(ThreadId),
    ) -> Result<usize> {
        let mut released = 0;
        while let Some(thread) = self.extract_first(kernel, status)? {
            callout(thread);
            released += 1;
        }
        if released > 0 {
            ktq_debug!("[tq] flushed {} waiter(s) of {}", released, self.queue.object_id);
        }
        Ok(released)
    }
}

impl<T: Send + 'static> Deref for ThreadQueueGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner.data
    }
}

impl<T: Send + 'static> DerefMut for ThreadQueueGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner.data
    }
}

/// Remove `node` and finish the wait of `thread`
///
/// Returns false if the thread no longer exists (its record is dropped).
fn release_waiter<T>(
    inner: &mut QueueInner<T>,
    kernel: &Kernel,
    node: NodeId,
    thread: ThreadId,
    status: WaitStatus,
) -> Result<bool> {
    inner.waiters.remove(node);

    let mut threads = kernel.threads();
    let Ok(tcb) = threads.get_mut(thread) else {
        return Ok(false);
    };
    kernel.finish_wait(tcb, status)?;
    ktq_debug!("[tq] {} released ({:?})", thread, status);
    Ok(true)
}

/// Type-erased access to the queue a thread is blocked on
///
/// Lets the kernel reach a thread's queue from the thread control block
/// without knowing the object data type.
pub(crate) trait WaitQueue: Send + Sync {
    /// Release `thread` if `node` still records its blocking episode `ticket`
    ///
    /// `None` reports the queue's timeout status. Returns whether the thread
    /// was released by this call.
    fn extract(
        &self,
        kernel: &Kernel,
        thread: ThreadId,
        ticket: u32,
        node: NodeId,
        status: Option<WaitStatus>,
    ) -> Result<bool>;

    /// Re-sort `thread` after a priority change
    fn requeue(&self, thread: ThreadId, ticket: u32, node: NodeId, priority: Priority);
}

impl<T: Send + 'static> WaitQueue for ThreadQueue<T> {
    fn extract(
        &self,
        kernel: &Kernel,
        thread: ThreadId,
        ticket: u32,
        node: NodeId,
        status: Option<WaitStatus>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.waiters.matches(node, thread, ticket) {
            ktq_debug!("[tq] {} already left {}", thread, self.object_id);
            return Ok(false);
        }
        release_waiter(&mut *inner, kernel, node, thread, status.unwrap_or(self.timeout_status))
    }

    fn requeue(&self, thread: ThreadId, ticket: u32, node: NodeId, priority: Priority) {
        let mut inner = self.inner.lock();
        let waiters = &mut inner.waiters;
        if !waiters.matches(node, thread, ticket) {
            return;
        }

        waiters.nodes[node].priority = priority;
        if self.discipline == Discipline::Priority {
            waiters.queue.extract_unprotected(&mut waiters.nodes, node);
            waiters.link(self.discipline, node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::objects::tcb::ThreadAttributes;
    use alloc::vec::Vec;

    fn kernel() -> Kernel {
        Kernel::new(KernelConfig::new(1).with_maximum_threads(8)).unwrap()
    }

    fn ready_thread(kernel: &Kernel, priority: u8) -> ThreadId {
        let thread = kernel
            .create_thread(ThreadAttributes::new(Priority(priority)))
            .unwrap();
        kernel.start_thread(thread).unwrap();
        thread
    }

    fn block(queue: &Arc<ThreadQueue>, kernel: &Kernel, thread: ThreadId, timeout: Timeout) {
        queue
            .acquire()
            .enqueue(kernel, thread, ThreadState::WAITING_FOR_SEMAPHORE, timeout)
            .unwrap();
    }

    fn drain(queue: &Arc<ThreadQueue>, kernel: &Kernel) -> Vec<ThreadId> {
        let mut order = Vec::new();
        while let Some(thread) = queue
            .acquire()
            .extract_first(kernel, WaitStatus::Successful)
            .unwrap()
        {
            order.push(thread);
        }
        order
    }

    #[test]
    fn thread_queue_fifo_order() {
        let kernel = kernel();
        let queue = ThreadQueue::initialize(ObjectId(1), Discipline::Fifo, WaitStatus::Timeout, ());
        let threads: Vec<_> = [5, 1, 9].iter().map(|&p| ready_thread(&kernel, p)).collect();
        for &thread in &threads {
            block(&queue, &kernel, thread, Timeout::Forever);
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.first(), Some(threads[0]));
        assert_eq!(drain(&queue, &kernel), threads);
        assert!(queue.is_empty());
    }

    #[test]
    fn thread_queue_priority_order_fifo_among_equals() {
        let kernel = kernel();
        let queue =
            ThreadQueue::initialize(ObjectId(2), Discipline::Priority, WaitStatus::Timeout, ());
        let threads: Vec<_> = [5, 3, 3, 7].iter().map(|&p| ready_thread(&kernel, p)).collect();
        for &thread in &threads {
            block(&queue, &kernel, thread, Timeout::Forever);
        }

        assert_eq!(
            queue.acquire().waiting_threads(),
            [threads[1], threads[2], threads[0], threads[3]]
        );
        assert_eq!(drain(&queue, &kernel), [threads[1], threads[2], threads[0], threads[3]]);
    }

    #[test]
    fn thread_queue_enqueue_blocks_and_extract_readies() {
        let kernel = kernel();
        let queue = ThreadQueue::initialize(ObjectId(3), Discipline::Fifo, WaitStatus::Timeout, ());
        let thread = ready_thread(&kernel, 4);

        block(&queue, &kernel, thread, Timeout::Forever);
        let state = kernel.state(thread).unwrap();
        assert!(state.is_waiting_for_semaphore());
        assert!(state.is_waiting_on_thread_queue());
        assert!(!kernel.ready_threads().contains(&thread));

        assert!(kernel.extract_with_return_code(thread, WaitStatus::Unsatisfied).unwrap());
        assert!(kernel.state(thread).unwrap().is_ready());
        assert_eq!(kernel.wait_status(thread).unwrap(), WaitStatus::Unsatisfied);
        assert!(kernel.ready_threads().contains(&thread));

        // Second extract finds nothing
        assert!(!kernel.extract(thread).unwrap());
    }

    #[test]
    fn thread_queue_rejects_double_enqueue() {
        let kernel = kernel();
        let first = ThreadQueue::initialize(ObjectId(4), Discipline::Fifo, WaitStatus::Timeout, ());
        let second =
            ThreadQueue::initialize(ObjectId(5), Discipline::Fifo, WaitStatus::Timeout, ());
        let thread = ready_thread(&kernel, 4);

        block(&first, &kernel, thread, Timeout::Forever);
        let error = second
            .acquire()
            .enqueue(&kernel, thread, ThreadState::WAITING_FOR_SEMAPHORE, Timeout::Forever)
            .unwrap_err();
        assert_eq!(error, KernelError::AlreadyWaiting(thread));
        assert!(second.is_empty());
    }

    #[test]
    fn thread_queue_rejects_delaying_thread() {
        let kernel = kernel();
        let queue =
            ThreadQueue::initialize(ObjectId(12), Discipline::Fifo, WaitStatus::Timeout, ());
        let thread = ready_thread(&kernel, 4);
        kernel.delay(thread, 3).unwrap();

        let error = queue
            .acquire()
            .enqueue(&kernel, thread, ThreadState::WAITING_FOR_SEMAPHORE, Timeout::Ticks(5))
            .unwrap_err();
        assert_eq!(error, KernelError::AlreadyWaiting(thread));
        assert!(queue.is_empty());
        assert_eq!(kernel.armed_watchdogs(), 1);
        assert!(!kernel.state(thread).unwrap().is_waiting_for_semaphore());

        // The delay still ends on time
        for _ in 0..3 {
            kernel.tick();
        }
        assert!(kernel.state(thread).unwrap().is_ready());
        assert_eq!(kernel.armed_watchdogs(), 0);
    }

    #[test]
    fn thread_queue_timeout_releases_with_timeout_status() {
        let kernel = kernel();
        let queue = ThreadQueue::initialize(ObjectId(6), Discipline::Fifo, WaitStatus::Timeout, ());
        let thread = ready_thread(&kernel, 4);

        block(&queue, &kernel, thread, Timeout::Ticks(2));
        kernel.tick();
        assert_eq!(queue.len(), 1);
        kernel.tick();

        assert!(queue.is_empty());
        assert_eq!(kernel.wait_status(thread).unwrap(), WaitStatus::Timeout);
        assert!(kernel.state(thread).unwrap().is_ready());
    }

    #[test]
    fn thread_queue_satisfied_wait_cancels_timeout() {
        let kernel = kernel();
        let queue = ThreadQueue::initialize(ObjectId(7), Discipline::Fifo, WaitStatus::Timeout, ());
        let thread = ready_thread(&kernel, 4);

        block(&queue, &kernel, thread, Timeout::Ticks(1));
        assert_eq!(kernel.armed_watchdogs(), 1);
        assert_eq!(
            queue.acquire().extract_first(&kernel, WaitStatus::Successful).unwrap(),
            Some(thread)
        );
        assert_eq!(kernel.armed_watchdogs(), 0);

        kernel.tick();
        assert_eq!(kernel.wait_status(thread).unwrap(), WaitStatus::Successful);
    }

    #[test]
    fn thread_queue_stale_timeout_is_ignored() {
        let kernel = kernel();
        let queue = ThreadQueue::initialize(ObjectId(8), Discipline::Fifo, WaitStatus::Timeout, ());
        let thread = ready_thread(&kernel, 4);

        block(&queue, &kernel, thread, Timeout::Forever);
        let (ticket, node) = kernel.wait_ticket(thread).unwrap();
        assert!(kernel.extract(thread).unwrap());

        // Blocks again; a late timeout carrying the old ticket must not release it
        block(&queue, &kernel, thread, Timeout::Forever);
        assert!(!queue.extract(&kernel, thread, ticket, node, None).unwrap());
        assert_eq!(queue.len(), 1);
        assert!(kernel.timeout(thread).unwrap());
        assert_eq!(kernel.wait_status(thread).unwrap(), WaitStatus::Timeout);
    }

    #[test]
    fn thread_queue_flush_in_order_with_callout() {
        let kernel = kernel();
        let queue =
            ThreadQueue::initialize(ObjectId(9), Discipline::Priority, WaitStatus::Timeout, ());
        let low = ready_thread(&kernel, 9);
        let high = ready_thread(&kernel, 1);
        block(&queue, &kernel, low, Timeout::Ticks(10));
        block(&queue, &kernel, high, Timeout::Forever);

        let mut seen = Vec::new();
        let released = queue
            .acquire()
            .flush(&kernel, WaitStatus::ObjectWasDeleted, |thread| seen.push(thread))
            .unwrap();
        assert_eq!(released, 2);
        assert_eq!(seen, [high, low]);
        assert_eq!(kernel.wait_status(low).unwrap(), WaitStatus::ObjectWasDeleted);
        assert_eq!(kernel.armed_watchdogs(), 0);
    }

    #[test]
    fn thread_queue_requeue_on_priority_change() {
        let kernel = kernel();
        let queue =
            ThreadQueue::initialize(ObjectId(10), Discipline::Priority, WaitStatus::Timeout, ());
        let a = ready_thread(&kernel, 5);
        let b = ready_thread(&kernel, 6);
        block(&queue, &kernel, a, Timeout::Forever);
        block(&queue, &kernel, b, Timeout::Forever);
        assert_eq!(queue.first(), Some(a));

        kernel.set_priority(b, Priority(2)).unwrap();
        assert_eq!(queue.first(), Some(b));
    }

    #[test]
    fn thread_queue_guard_exposes_object_data() {
        let queue =
            ThreadQueue::initialize(ObjectId(11), Discipline::Fifo, WaitStatus::Timeout, 3u32);
        {
            let mut guard = queue.acquire();
            *guard += 1;
            assert!(guard.is_empty());
        }
        assert_eq!(*queue.acquire(), 4);
        assert_eq!(queue.discipline(), Discipline::Fifo);
        assert_eq!(queue.timeout_status(), WaitStatus::Timeout);
        assert_eq!(queue.object_id(), ObjectId(11));
    }
}

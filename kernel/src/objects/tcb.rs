//! Thread Control Block (TCB) Implementation
//!
//! A TCB is the schedulable unit as far as the core is concerned: identity,
//! state bitmask, priority, preemptibility and, while the thread waits, the
//! membership record of the thread queue it is blocked on.
//!
//! ## Thread Lifecycle
//!
//! ```text
//! create -> DORMANT --start--> ready <--> blocked / suspended
//!                                |
//!                                +--delete--> slot freed
//! ```
//!
//! TCBs live in a fixed [`ThreadTable`] whose free slots form a chain. A
//! [`ThreadId`] pairs a slot index with the slot's generation, so a handle
//! kept past `delete_thread` is rejected instead of reaching the next
//! occupant of the slot.

use alloc::sync::Weak;
use core::fmt;

use crate::chain::{Chain, NodeArray, NodeId};
use crate::error::{KernelError, Result};
use crate::watchdog::WatchdogId;

use super::thread_queue::WaitQueue;
use super::{ObjectId, Priority, ThreadState, WaitStatus};

/// Generation-checked handle of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId {
    index: u32,
    generation: u32,
}

impl ThreadId {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Thread table slot of this thread
    #[inline]
    pub const fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}.{}", self.index, self.generation)
    }
}

/// Parameters of a new thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAttributes {
    /// Label of the thread object (reported in debug output)
    pub object_id: ObjectId,
    pub priority: Priority,
    /// Whether a more urgent thread may take the processor away
    pub preemptible: bool,
}

impl ThreadAttributes {
    pub const fn new(priority: Priority) -> Self {
        Self {
            object_id: ObjectId(0),
            priority,
            preemptible: true,
        }
    }

    pub const fn with_object_id(mut self, object_id: ObjectId) -> Self {
        self.object_id = object_id;
        self
    }

    pub const fn non_preemptible(mut self) -> Self {
        self.preemptible = false;
        self
    }
}

/// Thread queue membership of a blocked thread
#[derive(Default)]
pub(crate) struct WaitInfo {
    /// Queue the thread is enqueued on
    pub queue: Option<Weak<dyn WaitQueue>>,
    /// Object owning that queue
    pub object_id: ObjectId,
    /// Waiter record inside the queue
    pub node: Option<NodeId>,
    /// State bits set by the enqueue, cleared on release
    pub blocking_state: ThreadState,
    /// How the last wait ended
    pub return_code: WaitStatus,
}

impl WaitInfo {
    /// Forget the queue membership, keeping the return code
    pub fn clear_membership(&mut self) {
        self.queue = None;
        self.node = None;
        self.object_id = ObjectId::default();
        self.blocking_state = ThreadState::READY;
    }
}

/// Thread Control Block
pub(crate) struct ThreadControl {
    pub id: ThreadId,
    pub object_id: ObjectId,
    pub state: ThreadState,
    pub priority: Priority,
    pub preemptible: bool,
    /// Identifies the current blocking episode
    ///
    /// Bumped every time the thread blocks on a queue or delays, and carried
    /// by the watchdog armed for that episode, so a timeout that fires late
    /// can tell it belongs to an episode that already ended.
    pub ticket: u32,
    pub wait: WaitInfo,
    /// Watchdog armed for the current blocking episode
    pub timer: Option<WatchdogId>,
}

impl ThreadControl {
    fn new(id: ThreadId, attributes: &ThreadAttributes) -> Self {
        Self {
            id,
            object_id: attributes.object_id,
            state: ThreadState::DORMANT,
            priority: attributes.priority,
            preemptible: attributes.preemptible,
            ticket: 0,
            wait: WaitInfo::default(),
            timer: None,
        }
    }

    /// Start a new blocking episode and return its ticket
    pub fn next_ticket(&mut self) -> u32 {
        self.ticket = self.ticket.wrapping_add(1);
        self.ticket
    }

    /// Whether the thread is currently enqueued on a thread queue
    #[inline]
    pub fn is_waiting(&self) -> bool {
        self.wait.queue.is_some()
    }
}

impl fmt::Debug for ThreadControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadControl")
            .field("id", &self.id)
            .field("object_id", &self.object_id)
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("preemptible", &self.preemptible)
            .field("waiting", &self.is_waiting())
            .field("return_code", &self.wait.return_code)
            .finish()
    }
}

struct Slot {
    generation: u32,
    control: Option<ThreadControl>,
}

/// Fixed table of thread control blocks
pub(crate) struct ThreadTable {
    slots: NodeArray<Slot>,
    free: Chain,
    live: usize,
}

impl ThreadTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = NodeArray::from_fn(capacity, |_| Slot {
            generation: 0,
            control: None,
        });
        let mut free = Chain::new();
        free.initialize(&mut slots, capacity);

        Self {
            slots,
            free,
            live: 0,
        }
    }

    /// Take a free slot and create a dormant thread in it
    pub fn allocate(&mut self, attributes: &ThreadAttributes) -> Result<ThreadId> {
        let node = self
            .free
            .get_unprotected(&mut self.slots)
            .ok_or(KernelError::TooManyThreads)?;

        let slot = &mut self.slots[node];
        let id = ThreadId::new(node.index() as u32, slot.generation);
        slot.control = Some(ThreadControl::new(id, attributes));
        self.live += 1;
        Ok(id)
    }

    /// Remove the thread and give its slot back
    pub fn release(&mut self, id: ThreadId) -> Result<ThreadControl> {
        self.get(id)?;

        let node = NodeId::new(id.index());
        let slot = &mut self.slots[node];
        let control = slot.control.take().ok_or(KernelError::InvalidThread(id))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.append_unprotected(&mut self.slots, node);
        self.live -= 1;
        Ok(control)
    }

    pub fn get(&self, id: ThreadId) -> Result<&ThreadControl> {
        self.slots
            .get(NodeId::new(id.index()))
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.control.as_ref())
            .ok_or(KernelError::InvalidThread(id))
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Result<&mut ThreadControl> {
        self.slots
            .get_mut(NodeId::new(id.index()))
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.control.as_mut())
            .ok_or(KernelError::InvalidThread(id))
    }

    /// Number of live threads
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

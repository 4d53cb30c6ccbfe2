//! Watchdog - one-shot tick timers
//!
//! ## Design
//!
//! Armed watchdogs sit on a delta chain: each entry stores the number of
//! ticks between its predecessor's deadline and its own, so a clock tick only
//! touches the first entry and expiry pops from the front. Entries with equal
//! deadlines fire in the order they were armed.
//!
//! ```text
//!   armed at +3, +5, +5, +9  ->  [3] -> [2] -> [0] -> [4]
//! ```
//!
//! Entries come from a fixed table with a free chain. A [`WatchdogId`] carries
//! the generation of its entry, so cancelling a watchdog that already fired
//! (or whose entry was reused) is a harmless no-op. That is what lets a
//! satisfied thread cancel its timeout without caring whether the timeout is
//! firing at the same moment.
//!
//! The routine is a closed enum run by [`Kernel::tick`](crate::Kernel::tick)
//! after the watchdog lock has been released.

use core::fmt;

use crate::chain::{Chain, NodeArray, NodeId, Position};
use crate::error::{KernelError, Result};
use crate::objects::ThreadId;

/// What to do when a watchdog fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogRoutine {
    /// A thread queue wait timed out
    ThreadQueueTimeout { thread: ThreadId, ticket: u32 },
    /// A delay ended
    DelayEnded { thread: ThreadId, ticket: u32 },
}

/// Handle of an armed watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchdogId {
    index: u32,
    generation: u32,
}

impl fmt::Display for WatchdogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wd{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    /// Ticks after the previous entry's deadline
    delta: u32,
    generation: u32,
    routine: Option<WatchdogRoutine>,
}

/// Table of one-shot watchdogs ordered by deadline
#[derive(Debug)]
pub struct Watchdogs {
    entries: NodeArray<Entry>,
    active: Chain,
    free: Chain,
}

impl Watchdogs {
    /// Create a table able to hold `capacity` armed watchdogs
    pub fn new(capacity: usize) -> Self {
        let mut entries = NodeArray::from_fn(capacity, |_| Entry {
            delta: 0,
            generation: 0,
            routine: None,
        });
        let mut free = Chain::new();
        free.initialize(&mut entries, capacity);

        Self {
            entries,
            active: Chain::new(),
            free,
        }
    }

    /// Arm a watchdog that fires on the `ticks`-th subsequent tick
    ///
    /// Zero ticks is treated as one: nothing fires before the next tick.
    pub fn insert_ticks(&mut self, ticks: u32, routine: WatchdogRoutine) -> Result<WatchdogId> {
        let node = self
            .free
            .get_unprotected(&mut self.entries)
            .ok_or(KernelError::TooManyWatchdogs)?;

        let mut remaining = ticks.max(1);
        let mut after = Position::Head;
        let mut cursor = self.active.first();
        while let Position::Node(other) = cursor {
            let delta = self.entries[other].delta;
            if remaining < delta {
                self.entries[other].delta = delta - remaining;
                break;
            }
            remaining -= delta;
            after = cursor;
            cursor = self.active.next(&self.entries, cursor);
        }

        let entry = &mut self.entries[node];
        entry.delta = remaining;
        entry.routine = Some(routine);
        let id = WatchdogId {
            index: node.index() as u32,
            generation: entry.generation,
        };
        self.active.insert_unprotected(&mut self.entries, after, node);
        Ok(id)
    }

    fn armed_node(&self, id: WatchdogId) -> Option<NodeId> {
        let node = NodeId::new(id.index as usize);
        let entry = self.entries.get(node)?;
        (entry.generation == id.generation && entry.routine.is_some()).then_some(node)
    }

    /// Cancel an armed watchdog
    ///
    /// Returns the routine it would have run, or `None` if it already fired
    /// or was cancelled.
    pub fn remove(&mut self, id: WatchdogId) -> Option<WatchdogRoutine> {
        let node = self.armed_node(id)?;

        let delta = self.entries[node].delta;
        if let Position::Node(next) = self.active.next(&self.entries, Position::Node(node)) {
            self.entries[next].delta += delta;
        }
        self.active.extract_unprotected(&mut self.entries, node);
        Some(self.release(node))
    }

    fn release(&mut self, node: NodeId) -> WatchdogRoutine {
        let entry = &mut self.entries[node];
        entry.generation = entry.generation.wrapping_add(1);
        entry.delta = 0;
        let routine = entry.routine.take();
        self.free.append_unprotected(&mut self.entries, node);
        match routine {
            Some(routine) => routine,
            None => unreachable!("released watchdog was not armed"),
        }
    }

    /// Account for one clock tick
    pub fn advance(&mut self) {
        if let Some(first) = self.active.first_node() {
            let entry = &mut self.entries[first];
            entry.delta = entry.delta.saturating_sub(1);
        }
    }

    /// Disarm and return the next expired watchdog, if any
    pub fn pop_expired(&mut self) -> Option<(WatchdogId, WatchdogRoutine)> {
        let first = self.active.first_node()?;
        if self.entries[first].delta != 0 {
            return None;
        }

        let id = WatchdogId {
            index: first.index() as u32,
            generation: self.entries[first].generation,
        };
        self.active.extract_unprotected(&mut self.entries, first);
        Some((id, self.release(first)))
    }

    /// Ticks left before `id` fires, or `None` if it is not armed
    pub fn remaining_ticks(&self, id: WatchdogId) -> Option<u32> {
        let target = self.armed_node(id)?;
        let mut total = 0u32;
        for node in self.active.iter(&self.entries) {
            total = total.saturating_add(self.entries[node].delta);
            if node == target {
                return Some(total);
            }
        }
        None
    }

    /// Number of armed watchdogs
    pub fn active_count(&self) -> usize {
        self.active.node_count_unprotected(&self.entries)
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn delay(index: u32) -> WatchdogRoutine {
        WatchdogRoutine::DelayEnded {
            thread: ThreadId::new(index, 0),
            ticket: 0,
        }
    }

    fn tick(watchdogs: &mut Watchdogs) -> Vec<WatchdogRoutine> {
        watchdogs.advance();
        let mut fired = Vec::new();
        while let Some((_, routine)) = watchdogs.pop_expired() {
            fired.push(routine);
        }
        fired
    }

    #[test]
    fn watchdog_fires_in_deadline_order() {
        let mut watchdogs = Watchdogs::new(4);
        watchdogs.insert_ticks(5, delay(0)).unwrap();
        watchdogs.insert_ticks(3, delay(1)).unwrap();
        watchdogs.insert_ticks(5, delay(2)).unwrap();
        watchdogs.insert_ticks(9, delay(3)).unwrap();

        let mut order = Vec::new();
        for now in 1..=9 {
            for routine in tick(&mut watchdogs) {
                order.push((now, routine));
            }
        }
        assert_eq!(
            order,
            [(3, delay(1)), (5, delay(0)), (5, delay(2)), (9, delay(3))]
        );
        assert_eq!(watchdogs.active_count(), 0);
    }

    #[test]
    fn watchdog_zero_ticks_fires_next_tick() {
        let mut watchdogs = Watchdogs::new(1);
        watchdogs.insert_ticks(0, delay(7)).unwrap();
        assert!(watchdogs.pop_expired().is_none());
        assert_eq!(tick(&mut watchdogs), [delay(7)]);
    }

    #[test]
    fn watchdog_remove_keeps_later_deadlines() {
        let mut watchdogs = Watchdogs::new(3);
        let first = watchdogs.insert_ticks(2, delay(0)).unwrap();
        let second = watchdogs.insert_ticks(4, delay(1)).unwrap();
        assert_eq!(watchdogs.remaining_ticks(second), Some(4));

        assert_eq!(watchdogs.remove(first), Some(delay(0)));
        assert_eq!(watchdogs.remaining_ticks(second), Some(4));
        assert_eq!(watchdogs.remaining_ticks(first), None);

        for _ in 0..3 {
            assert!(tick(&mut watchdogs).is_empty());
        }
        assert_eq!(tick(&mut watchdogs), [delay(1)]);
    }

    #[test]
    fn watchdog_stale_handle_is_ignored() {
        let mut watchdogs = Watchdogs::new(1);
        let id = watchdogs.insert_ticks(1, delay(0)).unwrap();
        assert_eq!(tick(&mut watchdogs), [delay(0)]);

        // Entry reused by a new watchdog: the old handle must not cancel it
        let reused = watchdogs.insert_ticks(1, delay(1)).unwrap();
        assert_ne!(id, reused);
        assert_eq!(watchdogs.remove(id), None);
        assert_eq!(watchdogs.active_count(), 1);
        assert_eq!(watchdogs.remove(reused), Some(delay(1)));
        assert_eq!(watchdogs.remove(reused), None);
    }

    #[test]
    fn watchdog_table_exhaustion() {
        let mut watchdogs = Watchdogs::new(1);
        watchdogs.insert_ticks(1, delay(0)).unwrap();
        assert_eq!(
            watchdogs.insert_ticks(1, delay(1)),
            Err(KernelError::TooManyWatchdogs)
        );
    }
}

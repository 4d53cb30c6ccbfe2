//! Scheduler - SMP heir assignment
//!
//! This module implements the simple SMP scheduler which manages:
//! - the ready set, one chain ordered by priority (FIFO among equals)
//! - per-processor `executing` / `heir` / `dispatch_necessary` records
//! - the dispatch step that makes the heir the executing thread
//!
//! ## Heir assignment
//!
//! [`SmpScheduler::schedule`] runs after every event that can change
//! readiness. It walks the ready set from the most urgent thread down and
//! gives each one a processor:
//!
//! 1. A thread already executing (or already heir) on a processor not yet
//!    claimed in this pass keeps that processor.
//! 2. Otherwise it takes the most attractive unclaimed processor, ranked by:
//!    executing thread not ready, then least urgent current heir, then the
//!    oldest context switch, then a preemptible heir. Remaining ties go to
//!    the lowest processor index.
//! 3. The processor needs a dispatch if its executing thread is not ready,
//!    has just yielded, or is preemptible and strictly less urgent than the
//!    new heir. The most urgent priority preempts even non-preemptible
//!    threads. An equal-priority heir waits for the executing thread.
//!
//! The walk stops at the first thread that finds no processor: every thread
//! after it is less urgent and cannot find one either. Processors left
//! unclaimed go idle. Each pass rebuilds every heir from scratch, so no
//! thread can be heir of two processors.
//!
//! A thread that yields (or whose priority changes) goes behind its
//! equal-priority peers. A yield also marks the thread so that a peer
//! assigned to its processor switches it out.
//!
//! ## Locking
//!
//! The scheduler itself is plain data. [`Kernel`](crate::Kernel) keeps it
//! under an ISR lock that is always taken last.

mod types;

pub use types::{ContextSwitch, PerCpu, SchedulerNode, Timestamp};

use alloc::vec::Vec;
use core::cmp::Reverse;

use crate::chain::{Chain, NodeArray, NodeId, Position};
use crate::config::MAX_CPUS;
use crate::error::{KernelError, Result};
use crate::objects::{Priority, ThreadId};

/// Simple SMP scheduler
#[derive(Debug)]
pub struct SmpScheduler {
    /// Indexed by thread table slot
    nodes: NodeArray<Option<SchedulerNode>>,
    ready: Chain,
    cpus: Vec<PerCpu>,
    /// Stamp source for `SchedulerNode::order`
    next_order: u64,
}

impl SmpScheduler {
    /// Create a scheduler for `cpu_count` processors and `capacity` threads
    pub fn new(cpu_count: usize, capacity: usize) -> Result<Self> {
        if cpu_count == 0 || cpu_count > MAX_CPUS {
            return Err(KernelError::InvalidConfig("cpu_count must be in 1..=MAX_CPUS"));
        }

        Ok(Self {
            nodes: NodeArray::from_fn(capacity, |_| None),
            ready: Chain::new(),
            cpus: alloc::vec![PerCpu::default(); cpu_count],
            next_order: 0,
        })
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    fn node_id(&self, thread: ThreadId) -> Result<NodeId> {
        let node = NodeId::new(thread.index());
        match self.nodes.get(node) {
            Some(Some(entry)) if entry.thread == thread => Ok(node),
            _ => Err(KernelError::InvalidThread(thread)),
        }
    }

    fn entry(&self, node: NodeId) -> &SchedulerNode {
        match &self.nodes[node] {
            Some(entry) => entry,
            None => unreachable!("scheduler node {} is vacant", node),
        }
    }

    fn entry_mut(&mut self, node: NodeId) -> &mut SchedulerNode {
        match &mut self.nodes[node] {
            Some(entry) => entry,
            None => unreachable!("scheduler node {} is vacant", node),
        }
    }

    /// The node of `thread`, if it has one
    pub fn node(&self, thread: ThreadId) -> Option<&SchedulerNode> {
        let node = self.node_id(thread).ok()?;
        Some(self.entry(node))
    }

    fn cpu(&self, cpu: usize) -> Result<&PerCpu> {
        self.cpus.get(cpu).ok_or(KernelError::InvalidCpu(cpu))
    }

    /// Thread running on `cpu`
    pub fn executing(&self, cpu: usize) -> Result<Option<ThreadId>> {
        Ok(self.cpu(cpu)?.executing)
    }

    /// Thread `cpu` runs next
    pub fn heir(&self, cpu: usize) -> Result<Option<ThreadId>> {
        Ok(self.cpu(cpu)?.heir)
    }

    pub fn is_dispatch_necessary(&self, cpu: usize) -> Result<bool> {
        Ok(self.cpu(cpu)?.dispatch_necessary)
    }

    pub fn per_cpu(&self, cpu: usize) -> Result<&PerCpu> {
        self.cpu(cpu)
    }

    /// Ready threads, most urgent first
    pub fn ready_threads(&self) -> Vec<ThreadId> {
        self.ready
            .iter(&self.nodes)
            .map(|node| self.entry(node).thread)
            .collect()
    }

    /// Whether `thread` is in the ready set
    pub fn is_ready(&self, thread: ThreadId) -> bool {
        self.node(thread).is_some_and(|node| node.ready)
    }

    /// Give `thread` a scheduler node; it starts out not ready
    pub fn add_thread(
        &mut self,
        thread: ThreadId,
        priority: Priority,
        preemptible: bool,
    ) -> Result<()> {
        let slot = self
            .nodes
            .get_mut(NodeId::new(thread.index()))
            .ok_or(KernelError::InvalidThread(thread))?;
        if slot.is_some() {
            return Err(KernelError::InvalidThread(thread));
        }
        *slot = Some(SchedulerNode::new(thread, priority, preemptible));
        Ok(())
    }

    /// Drop the scheduler node of a deleted thread
    ///
    /// Processors running the thread are sent to their new heir.
    pub fn remove_thread(&mut self, thread: ThreadId) -> Result<()> {
        let node = self.node_id(thread)?;
        if self.entry(node).ready {
            self.ready.extract_unprotected(&mut self.nodes, node);
        }
        self.nodes[node] = None;

        self.schedule();
        Ok(())
    }

    fn enqueue_ready(&mut self, node: NodeId) {
        let order = self.next_order;
        self.next_order += 1;
        {
            let entry = self.entry_mut(node);
            entry.ready = true;
            entry.order = order;
            entry.yielded = false;
        }
        self.ready
            .insert_ordered_unprotected(&mut self.nodes, node, |nodes, new, other| {
                match (&nodes[new], &nodes[other]) {
                    (Some(new), Some(other)) => {
                        (new.priority, new.order) < (other.priority, other.order)
                    }
                    _ => false,
                }
            });
    }

    /// Take `thread` out of the ready set
    pub fn block(&mut self, thread: ThreadId) -> Result<()> {
        let node = self.node_id(thread)?;
        if !self.entry(node).ready {
            return Ok(());
        }

        self.ready.extract_unprotected(&mut self.nodes, node);
        let entry = self.entry_mut(node);
        entry.ready = false;
        entry.yielded = false;
        ksched_debug!("[sched] block {}", thread);
        self.schedule();
        Ok(())
    }

    /// Put `thread` into the ready set behind its equal-priority peers
    pub fn unblock(&mut self, thread: ThreadId) -> Result<()> {
        let node = self.node_id(thread)?;
        if self.entry(node).ready {
            return Ok(());
        }

        self.enqueue_ready(node);
        ksched_debug!("[sched] unblock {}", thread);
        self.schedule();
        Ok(())
    }

    /// Change the priority of `thread`
    ///
    /// A ready thread moves behind the threads already at its new priority.
    pub fn update_priority(&mut self, thread: ThreadId, priority: Priority) -> Result<()> {
        let node = self.node_id(thread)?;
        self.entry_mut(node).priority = priority;

        if self.entry(node).ready {
            self.ready.extract_unprotected(&mut self.nodes, node);
            self.enqueue_ready(node);
        }
        self.schedule();
        Ok(())
    }

    pub fn set_preemptible(&mut self, thread: ThreadId, preemptible: bool) -> Result<()> {
        let node = self.node_id(thread)?;
        self.entry_mut(node).preemptible = preemptible;
        self.schedule();
        Ok(())
    }

    /// Move `thread` behind its equal-priority peers
    ///
    /// A peer that takes the processor of `thread` switches it out right
    /// away; with no peer ready the thread keeps running.
    pub fn yield_thread(&mut self, thread: ThreadId) -> Result<()> {
        let node = self.node_id(thread)?;
        if !self.entry(node).ready {
            return Ok(());
        }

        self.ready.extract_unprotected(&mut self.nodes, node);
        self.enqueue_ready(node);
        self.entry_mut(node).yielded = true;
        ksched_debug!("[sched] yield {}", thread);
        self.schedule();
        Ok(())
    }

    /// Whether `thread` is a ready thread
    fn ready_node(&self, thread: ThreadId) -> Option<&SchedulerNode> {
        self.node(thread).filter(|node| node.ready)
    }

    /// Recompute the heir of every processor
    pub fn schedule(&mut self) {
        let mut claimed: u64 = 0;
        let mut cursor = self.ready.first();

        while let Position::Node(node) = cursor {
            cursor = self.ready.next(&self.nodes, cursor);
            let candidate = *self.entry(node);
            if !self.assign(&candidate, &mut claimed) {
                ksched_debug!("[sched] {} finds no processor, stopping", candidate.thread);
                break;
            }
        }

        for (index, cpu) in self.cpus.iter_mut().enumerate() {
            if claimed & (1 << index) == 0 {
                cpu.heir = None;
                cpu.dispatch_necessary = cpu.executing.is_some();
            }
        }
    }

    /// Find a processor for `candidate`; false if every processor is taken
    fn assign(&mut self, candidate: &SchedulerNode, claimed: &mut u64) -> bool {
        let thread = candidate.thread;

        if let Some(cpu) = self.cpus.iter().position(|cpu| cpu.executing == Some(thread)) {
            if *claimed & (1 << cpu) == 0 {
                *claimed |= 1 << cpu;
                let record = &mut self.cpus[cpu];
                record.heir = Some(thread);
                record.dispatch_necessary = false;
                // No peer wanted the processor, the yield is over
                self.entry_mut(NodeId::new(thread.index())).yielded = false;
                return true;
            }
            if !self.cpus[cpu].dispatch_necessary {
                // Keeps running until the heir of that processor may preempt it
                return true;
            }
        }

        let stale_heir = self
            .cpus
            .iter()
            .enumerate()
            .position(|(index, cpu)| *claimed & (1 << index) == 0 && cpu.heir == Some(thread));

        let target = match stale_heir {
            Some(cpu) => cpu,
            None => match self.pick_victim(*claimed) {
                Some(cpu) => cpu,
                None => return false,
            },
        };

        *claimed |= 1 << target;
        let dispatch = self.needs_dispatch(target, candidate);
        let record = &mut self.cpus[target];
        record.heir = Some(thread);
        record.dispatch_necessary = dispatch;
        ksched_debug!(
            "[sched] cpu{} heir {} (dispatch: {})",
            target,
            thread,
            dispatch
        );
        true
    }

    /// Most attractive unclaimed processor
    fn pick_victim(&self, claimed: u64) -> Option<usize> {
        let mut best: Option<(usize, (bool, u16, Reverse<Timestamp>, bool))> = None;

        for (index, cpu) in self.cpus.iter().enumerate() {
            if claimed & (1 << index) != 0 {
                continue;
            }

            let executing_not_ready = cpu
                .executing
                .and_then(|thread| self.ready_node(thread))
                .is_none();
            let heir = cpu.heir.and_then(|thread| self.ready_node(thread));
            let key = (
                executing_not_ready,
                heir.map_or(u16::from(u8::MAX) + 1, |node| u16::from(node.priority.0)),
                Reverse(cpu.time_of_last_context_switch),
                heir.map_or(true, |node| node.preemptible),
            );

            if best.as_ref().map_or(true, |(_, best_key)| key > *best_key) {
                best = Some((index, key));
            }
        }

        best.map(|(index, _)| index)
    }

    fn needs_dispatch(&self, cpu: usize, candidate: &SchedulerNode) -> bool {
        let Some(executing) = self.cpus[cpu].executing else {
            return true;
        };
        if executing == candidate.thread {
            return false;
        }

        match self.ready_node(executing) {
            None => true,
            Some(running) if running.yielded => true,
            Some(running) => {
                candidate.priority.is_more_urgent_than(running.priority)
                    && (running.preemptible || candidate.priority == Priority::MOST_URGENT)
            }
        }
    }

    /// Make the heir of `cpu` its executing thread
    ///
    /// Returns the switch performed, or `None` when no dispatch is pending or
    /// the heir is still executing on another processor (the dispatch stays
    /// pending until that processor switches away from it).
    pub fn dispatch(&mut self, cpu: usize, now: Timestamp) -> Result<Option<ContextSwitch>> {
        let record = *self.cpu(cpu)?;
        if !record.dispatch_necessary {
            return Ok(None);
        }

        if let Some(heir) = record.heir {
            let busy_elsewhere = self
                .cpus
                .iter()
                .enumerate()
                .any(|(index, other)| index != cpu && other.executing == Some(heir));
            if busy_elsewhere {
                ksched_debug!("[sched] cpu{} defers dispatch of {}", cpu, heir);
                return Ok(None);
            }
        }

        let record = &mut self.cpus[cpu];
        record.dispatch_necessary = false;
        if record.executing == record.heir {
            return Ok(None);
        }

        let switch = ContextSwitch {
            cpu,
            from: record.executing,
            to: record.heir,
        };
        record.executing = record.heir;
        record.time_of_last_context_switch = now;

        for thread in [switch.from, switch.to].into_iter().flatten() {
            if let Ok(node) = self.node_id(thread) {
                self.entry_mut(node).yielded = false;
            }
        }
        ksched_debug!("[sched] dispatch {}", switch);
        Ok(Some(switch))
    }
}

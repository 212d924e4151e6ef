//! Task queue shared by the manager and the workers
//!
//! One mutex guards every lane and the sequence table; one condition
//! variable wakes idle workers. Callers take the lock with
//! [`TaskQueue::lock`] and work on the returned [`QueueState`].
//!
//! # Lanes
//!
//! - **immediate**: picked up first (test tasks, sequence wrappers,
//!   dependent item tasks)
//! - **pending**: new parallel tasks in arrival order
//! - **finished**: executed tasks waiting for the manager
//!
//! # Sequences
//!
//! Serial tasks of one item are chained in the sequence table. The first task
//! of a chain travels through the lanes inside a [`SequenceTask`] wrapper,
//! the rest wait in the table until the manager moves them into the wrapper
//! one by one.

use crate::preprocessor::task::{SequenceTask, Task};
use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub immediate: usize,
    pub finished: usize,
    /// Serial items with an active chain
    pub sequences: usize,
    /// Tasks waiting in chains behind their head
    pub sequence_tasks: usize,
    pub workers: usize,
}

/// Lanes and sequence table, accessed under the queue lock
#[derive(Debug, Default)]
pub struct QueueState {
    pending: VecDeque<Task>,
    immediate: VecDeque<Task>,
    finished: VecDeque<Task>,
    sequences: HashMap<u64, VecDeque<Task>>,
    workers: usize,
}

impl QueueState {
    /// Queue a newly created task
    pub fn push_new(&mut self, task: Task) {
        match task {
            Task::Test(_) => self.immediate.push_back(task),
            task if task.is_serial() => self.push_sequence(task),
            task => self.pending.push_back(task),
        }
    }

    /// Append to the item's chain, starting the chain if there is none
    fn push_sequence(&mut self, task: Task) {
        let itemid = task.itemid();

        if let Some(chain) = self.sequences.get_mut(&itemid) {
            tracing::trace!("item {} queued behind {} tasks", itemid, chain.len());
            chain.push_back(task);
            return;
        }

        tracing::trace!("item {} starts a sequence", itemid);
        self.sequences.insert(itemid, VecDeque::new());
        self.immediate
            .push_back(Task::Sequence(SequenceTask::new(itemid, task)));
    }

    /// Next task ready for execution
    pub fn pop_new(&mut self) -> Option<Task> {
        if let Some(task) = self.immediate.pop_front() {
            return Some(task);
        }

        while let Some(task) = self.pending.pop_front() {
            if !task.is_serial() {
                return Some(task);
            }
            self.push_sequence(task);
            if let Some(task) = self.immediate.pop_front() {
                return Some(task);
            }
        }

        None
    }

    pub fn push_immediate(&mut self, task: Task) {
        self.immediate.push_back(task);
    }

    pub fn push_done(&mut self, task: Task) {
        self.finished.push_back(task);
    }

    pub fn pop_done(&mut self) -> Option<Task> {
        self.finished.pop_front()
    }

    pub fn has_finished(&self) -> bool {
        !self.finished.is_empty()
    }

    /// Take the next waiting task of an item's chain
    pub fn next_in_sequence(&mut self, itemid: u64) -> Option<Task> {
        self.sequences.get_mut(&itemid)?.pop_front()
    }

    /// Drop an item's chain once nothing waits in it
    pub fn remove_sequence(&mut self, itemid: u64) {
        if let Some(chain) = self.sequences.remove(&itemid) {
            if !chain.is_empty() {
                tracing::warn!(
                    "removed sequence of item {} with {} waiting tasks",
                    itemid,
                    chain.len()
                );
            }
        }
    }

    pub fn register_worker(&mut self) {
        self.workers += 1;
    }

    pub fn deregister_worker(&mut self) {
        self.workers = self.workers.saturating_sub(1);
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.pending.len(),
            immediate: self.immediate.len(),
            finished: self.finished.len(),
            sequences: self.sequences.len(),
            sequence_tasks: self.sequences.values().map(VecDeque::len).sum(),
            workers: self.workers,
        }
    }

    /// Items with the longest chains, longest first
    pub fn top_sequences(&self, limit: usize) -> Vec<(u64, usize)> {
        let mut top: Vec<(u64, usize)> = self
            .sequences
            .iter()
            .map(|(itemid, chain)| (*itemid, chain.len()))
            .collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        top.truncate(limit);
        top
    }
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the queue.
    ///
    /// Task execution never happens under the lock, so a poisoned lock only
    /// means a thread died between two consistent queue operations.
    pub fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Release the lock and block until notified
    pub fn wait<'a>(&self, guard: MutexGuard<'a, QueueState>) -> MutexGuard<'a, QueueState> {
        self.cond
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake one idle worker
    pub fn notify(&self) {
        self.cond.notify_one();
    }

    pub fn notify_all(&self) {
        self.cond.notify_all();
    }
}

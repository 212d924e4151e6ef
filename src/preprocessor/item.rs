//! Items and their preprocessing rule sets
//!
//! A [`RuleSet`] is shared behind an `Arc`: the item table holds one
//! reference and every queued task holds another, so a configuration update
//! swaps the item's rule set without disturbing tasks already in flight.

use crate::preprocessor::history::History;
use crate::preprocessor::step::Step;
use crate::types::ValueType;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// How values of one item may be scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessMode {
    /// Values may run concurrently on any worker
    #[default]
    Parallel,
    /// Values run one at a time in arrival order
    Serial,
}

/// Ordered preprocessing steps of an item, with their step history
#[derive(Debug, Default)]
pub struct RuleSet {
    steps: Vec<Step>,
    value_type: ValueType,
    discovery: bool,
    mode: ProcessMode,
    dep_itemids: Vec<u64>,
    history_num: usize,
    history: Mutex<History>,
}

impl RuleSet {
    pub fn new(value_type: ValueType) -> Self {
        Self {
            value_type,
            ..Self::default()
        }
    }

    /// Builder method to set the steps
    pub fn with_steps(mut self, steps: Vec<Step>) -> Self {
        self.history_num = steps.iter().filter(|s| s.step_type.has_history()).count();
        self.steps = steps;
        self
    }

    /// Builder method to set dependent item ids
    pub fn with_dependents(mut self, dep_itemids: Vec<u64>) -> Self {
        self.dep_itemids = dep_itemids;
        self
    }

    /// Builder method to request a processing mode
    pub fn with_mode(mut self, mode: ProcessMode) -> Self {
        self.mode = mode;
        self
    }

    /// Builder method to mark the item as a discovery rule
    pub fn with_discovery(mut self, discovery: bool) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn is_discovery(&self) -> bool {
        self.discovery
    }

    pub fn dep_itemids(&self) -> &[u64] {
        &self.dep_itemids
    }

    pub fn history_num(&self) -> usize {
        self.history_num
    }

    /// Effective mode: history-bearing chains always run serially
    pub fn mode(&self) -> ProcessMode {
        if self.history_num > 0 {
            ProcessMode::Serial
        } else {
            self.mode
        }
    }

    pub fn is_serial(&self) -> bool {
        self.mode() == ProcessMode::Serial
    }

    /// Lock the step history.
    ///
    /// Serial scheduling guarantees a single user, so the lock is never
    /// contended. A poisoned lock is recovered since history is replaced
    /// wholesale on every run.
    pub fn lock_history(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A monitored item known to the manager
#[derive(Debug, Clone)]
pub struct Item {
    pub itemid: u64,
    pub hostid: u64,
    pub revision: u64,
    pub preproc: Arc<RuleSet>,
}

impl Item {
    pub fn new(itemid: u64, hostid: u64, preproc: RuleSet) -> Self {
        Self {
            itemid,
            hostid,
            revision: 0,
            preproc: Arc::new(preproc),
        }
    }
}

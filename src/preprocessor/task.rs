//! Preprocessing tasks
//!
//! A task owns everything a worker needs to process one value: the item's
//! rule set reference, the input value and, once executed, the result. Tasks
//! move from the manager into the queue, from the queue to exactly one worker
//! and back through the finished lane to the manager.

use crate::preprocessor::cache::PreprocCache;
use crate::preprocessor::execute::StepResult;
use crate::preprocessor::history::History;
use crate::preprocessor::item::{Item, RuleSet};
use crate::types::{Timestamp, Value, ValueOpt};
use crossbeam_channel::Sender;
use std::sync::Arc;

/// Outcome of a test request
#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    pub itemid: u64,
    pub value: Value,
    pub results: Vec<StepResult>,
    /// History produced by the run, to be passed to the next test
    pub history: History,
}

/// Ad hoc evaluation of a rule set, answered on a reply channel
#[derive(Debug)]
pub struct TestTask {
    pub itemid: u64,
    pub preproc: Arc<RuleSet>,
    pub value: Value,
    pub ts: Timestamp,
    pub history: History,
    pub result: Value,
    pub results: Vec<StepResult>,
    reply: Sender<TestResult>,
}

impl TestTask {
    pub fn new(
        itemid: u64,
        preproc: Arc<RuleSet>,
        value: Value,
        ts: Timestamp,
        history: History,
        reply: Sender<TestResult>,
    ) -> Self {
        Self {
            itemid,
            preproc,
            value,
            ts,
            history,
            result: Value::None,
            results: Vec::new(),
            reply,
        }
    }

    /// Send the result back to the requester
    pub fn reply(self) {
        let result = TestResult {
            itemid: self.itemid,
            value: self.result,
            results: self.results,
            history: self.history,
        };
        if self.reply.send(result).is_err() {
            tracing::trace!("test requester for item {} went away", self.itemid);
        }
    }
}

/// A value to run through an item's rule set
#[derive(Debug)]
pub struct ValueTask {
    pub itemid: u64,
    pub hostid: u64,
    pub preproc: Arc<RuleSet>,
    pub value: Value,
    pub ts: Timestamp,
    pub opt: ValueOpt,
    pub result: Value,
    /// Shared decoded input, set for dependent item values
    pub cache: Option<Arc<PreprocCache>>,
}

impl ValueTask {
    pub fn new(item: &Item, value: Value, ts: Timestamp, opt: ValueOpt) -> Self {
        Self {
            itemid: item.itemid,
            hostid: item.hostid,
            preproc: Arc::clone(&item.preproc),
            value,
            ts,
            opt,
            result: Value::None,
            cache: None,
        }
    }

    /// Task for a dependent item reading its input from `cache`
    pub fn with_cache(item: &Item, cache: Arc<PreprocCache>, ts: Timestamp, opt: ValueOpt) -> Self {
        Self {
            cache: Some(cache),
            ..Self::new(item, Value::None, ts, opt)
        }
    }

    pub fn is_serial(&self) -> bool {
        self.preproc.is_serial()
    }
}

/// Value of an item with dependents.
///
/// After the primary chain runs, its result is wrapped in a cache that the
/// dependent items' tasks share.
#[derive(Debug)]
pub struct DependentTask {
    pub primary: ValueTask,
    /// Rule set the cache is prepared for
    pub cache_rules: Option<Arc<RuleSet>>,
    pub cache: Option<Arc<PreprocCache>>,
}

impl DependentTask {
    pub fn new(primary: ValueTask, cache_rules: Option<Arc<RuleSet>>) -> Self {
        Self {
            primary,
            cache_rules,
            cache: None,
        }
    }
}

/// Head of a serial item's task chain.
///
/// Only the wrapper of a chain is ever visible in the queue lanes, so at
/// most one task of the item is in flight.
#[derive(Debug)]
pub struct SequenceTask {
    pub itemid: u64,
    pub task: Option<Box<Task>>,
}

impl SequenceTask {
    pub fn new(itemid: u64, task: Task) -> Self {
        Self {
            itemid,
            task: Some(Box::new(task)),
        }
    }
}

#[derive(Debug)]
pub enum Task {
    Test(TestTask),
    Value(ValueTask),
    ValueSeq(ValueTask),
    Dependent(DependentTask),
    Sequence(SequenceTask),
}

impl Task {
    /// Value or serial value task, according to the item's rule set
    pub fn value(task: ValueTask) -> Self {
        if task.is_serial() {
            Task::ValueSeq(task)
        } else {
            Task::Value(task)
        }
    }

    pub fn itemid(&self) -> u64 {
        match self {
            Task::Test(t) => t.itemid,
            Task::Value(t) | Task::ValueSeq(t) => t.itemid,
            Task::Dependent(t) => t.primary.itemid,
            Task::Sequence(t) => t.itemid,
        }
    }

    /// Whether the task must run in its item's sequence
    pub fn is_serial(&self) -> bool {
        match self {
            Task::ValueSeq(_) => true,
            Task::Dependent(t) => t.primary.is_serial(),
            Task::Test(_) | Task::Value(_) | Task::Sequence(_) => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Task::Test(_) => "test",
            Task::Value(_) => "value",
            Task::ValueSeq(_) => "value_seq",
            Task::Dependent(_) => "dependent",
            Task::Sequence(_) => "sequence",
        }
    }
}

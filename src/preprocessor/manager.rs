//! Preprocessing manager
//!
//! The manager owns the item table, the task queue and the worker pool. The
//! host feeds it values with [`Manager::enqueue_value`] and periodically calls
//! [`Manager::drain_finished`], which flushes results to the sink, fans
//! values out to dependent items and advances serial item chains.
//!
//! # Example
//!
//! ```ignore
//! use preproc_rs::config::ManagerConfig;
//! use preproc_rs::preprocessor::{ChannelSink, Item, Manager, RuleSet, SinkMode, Step, StepType};
//!
//! let (sink, rx) = ChannelSink::new(SinkMode::Server);
//! let mut manager = Manager::new(&ManagerConfig::default(), Box::new(sink))?;
//!
//! let rules = RuleSet::new(ValueType::Uint64).with_steps(vec![Step::new(StepType::Multiplier, "8")]);
//! manager.add_item(Item::new(1, 1, rules));
//! manager.enqueue_value(1, "10".into(), Utc::now(), ValueOpt::default());
//!
//! manager.wait_finished(Duration::from_secs(1));
//! manager.drain_finished(256);
//! ```

use crate::config::ManagerConfig;
use crate::error::{PreprocError, Result};
use crate::preprocessor::cache::PreprocCache;
use crate::preprocessor::history::History;
use crate::preprocessor::item::{Item, RuleSet};
use crate::preprocessor::queue::{QueueStats, TaskQueue};
use crate::preprocessor::sink::{FlushSink, FlushedValue};
use crate::preprocessor::step::Step;
use crate::preprocessor::task::{
    DependentTask, SequenceTask, Task, TestResult, TestTask, ValueTask,
};
use crate::preprocessor::worker::Worker;
use crate::types::{Timestamp, Value, ValueOpt, ValueType};
use chrono::Utc;
use crossbeam_channel::{bounded, Receiver};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Interval between worker registration checks at startup
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Manager counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub items: usize,
    /// Values accepted by `enqueue_value`
    pub queued: u64,
    /// Tasks created and not yet drained
    pub in_flight: usize,
    /// Values handed to the sink
    pub flushed: u64,
    pub queue: QueueStats,
}

pub struct Manager {
    items: HashMap<u64, Item>,
    queue: Arc<TaskQueue>,
    workers: Vec<Worker>,
    sink: Box<dyn FlushSink>,
    finished: Receiver<()>,
    batch_size: usize,
    queued: u64,
    flushed: u64,
    in_flight: usize,
}

impl Manager {
    /// Start the worker pool.
    ///
    /// Fails if a worker thread cannot be spawned or if the workers do not
    /// all register within the startup timeout. Workers already started are
    /// stopped before returning the error.
    pub fn new(config: &ManagerConfig, sink: Box<dyn FlushSink>) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(TaskQueue::new());
        let (finished_tx, finished_rx) = bounded(1);

        let mut manager = Self {
            items: HashMap::new(),
            queue,
            workers: Vec::with_capacity(config.workers_num),
            sink,
            finished: finished_rx,
            batch_size: config.batch_size,
            queued: 0,
            flushed: 0,
            in_flight: 0,
        };

        for id in 0..config.workers_num {
            match Worker::spawn(id, Arc::clone(&manager.queue), finished_tx.clone()) {
                Ok(worker) => manager.workers.push(worker),
                Err(e) => {
                    tracing::warn!("cannot start preprocessing workers: {}", e);
                    manager.shutdown();
                    return Err(e);
                }
            }
        }

        if let Err(e) = manager.wait_for_workers(config.startup_timeout()) {
            tracing::warn!("{}", e);
            manager.shutdown();
            return Err(e);
        }

        tracing::info!(
            "preprocessing manager started with {} workers",
            manager.workers.len()
        );
        Ok(manager)
    }

    fn wait_for_workers(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            let registered = self.queue.lock().workers();
            if registered == self.workers.len() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(PreprocError::Startup(format!(
                    "timeout while waiting for preprocessing workers to start: {} of {} registered",
                    registered,
                    self.workers.len()
                )));
            }
            thread::sleep(STARTUP_POLL_INTERVAL);
        }
    }

    /// Stop and join all workers.
    ///
    /// Workers finish the task they are executing; queued tasks are dropped.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        {
            let _state = self.queue.lock();
            for worker in &self.workers {
                worker.request_stop();
            }
            self.queue.notify_all();
        }

        for worker in &mut self.workers {
            worker.join();
        }
        self.workers.clear();

        tracing::info!("preprocessing manager stopped");
    }

    // ==================== Items ====================

    /// Register an item, returning the item it replaces
    pub fn add_item(&mut self, item: Item) -> Option<Item> {
        tracing::debug!(
            "adding item {} with {} steps",
            item.itemid,
            item.preproc.steps().len()
        );
        self.items.insert(item.itemid, item)
    }

    /// Swap an item's rule set.
    ///
    /// Tasks already queued keep the rule set they were created with.
    pub fn update_item(&mut self, itemid: u64, rules: RuleSet) -> bool {
        let Some(item) = self.items.get_mut(&itemid) else {
            return false;
        };
        item.preproc = Arc::new(rules);
        item.revision += 1;
        tracing::debug!("item {} updated to revision {}", itemid, item.revision);
        true
    }

    pub fn remove_item(&mut self, itemid: u64) -> Option<Item> {
        self.items.remove(&itemid)
    }

    pub fn item(&self, itemid: u64) -> Option<&Item> {
        self.items.get(&itemid)
    }

    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    // ==================== Input ====================

    /// Queue a value for preprocessing.
    ///
    /// Values of unknown items are dropped and `false` is returned.
    pub fn enqueue_value(&mut self, itemid: u64, value: Value, ts: Timestamp, opt: ValueOpt) -> bool {
        let Some(item) = self.items.get(&itemid) else {
            tracing::trace!("dropping value of unknown item {}", itemid);
            return false;
        };

        let task = ValueTask::new(item, value, ts, opt);
        let task = if item.preproc.dep_itemids().is_empty() {
            Task::value(task)
        } else {
            Task::Dependent(DependentTask::new(task, self.cache_rules(item)))
        };

        self.queue.lock().push_new(task);
        self.queue.notify();
        self.queued += 1;
        self.in_flight += 1;
        true
    }

    /// Run an item's steps on `value` without touching its history.
    ///
    /// The result arrives on the returned channel once the task has been
    /// drained. Returns `None` for unknown items.
    pub fn enqueue_test(&mut self, itemid: u64, value: Value) -> Option<Receiver<TestResult>> {
        let item = self.items.get(&itemid)?;
        let preproc = Arc::clone(&item.preproc);
        Some(self.push_test(itemid, preproc, value, History::new()))
    }

    /// Run an arbitrary step list on `value`, starting from `history`
    pub fn test_steps(
        &mut self,
        steps: Vec<Step>,
        value_type: ValueType,
        value: Value,
        history: History,
    ) -> Receiver<TestResult> {
        let rules = Arc::new(RuleSet::new(value_type).with_steps(steps));
        self.push_test(0, rules, value, history)
    }

    fn push_test(
        &mut self,
        itemid: u64,
        preproc: Arc<RuleSet>,
        value: Value,
        history: History,
    ) -> Receiver<TestResult> {
        let (tx, rx) = bounded(1);
        let task = TestTask::new(itemid, preproc, value, Utc::now(), history, tx);

        self.queue.lock().push_new(Task::Test(task));
        self.queue.notify();
        self.in_flight += 1;
        rx
    }

    // ==================== Output ====================

    /// Block until a task finishes or `timeout` elapses.
    ///
    /// Returns whether finished tasks may be waiting.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        if self.queue.lock().has_finished() {
            return true;
        }
        self.finished.recv_timeout(timeout).is_ok()
    }

    /// Handle up to `batch_limit` finished tasks, returning how many were
    /// handled
    pub fn drain_finished(&mut self, batch_limit: usize) -> usize {
        let mut processed = 0;

        while processed < batch_limit {
            let Some(task) = self.queue.lock().pop_done() else {
                break;
            };
            processed += 1;
            self.process_finished(task);
        }

        if processed > 0 {
            tracing::trace!("drained {} finished tasks", processed);
        }
        processed
    }

    /// Drain with the configured batch size
    pub fn drain(&mut self) -> usize {
        self.drain_finished(self.batch_size)
    }

    fn process_finished(&mut self, task: Task) {
        if !matches!(task, Task::Sequence(_)) {
            self.in_flight = self.in_flight.saturating_sub(1);
        }

        match task {
            Task::Test(t) => t.reply(),
            Task::Value(t) | Task::ValueSeq(t) => self.flush(t),
            Task::Dependent(t) => self.process_dependent(t),
            Task::Sequence(t) => self.process_sequence(t),
        }
    }

    fn flush(&mut self, task: ValueTask) {
        self.flushed += 1;
        self.sink.flush(FlushedValue {
            itemid: task.itemid,
            hostid: task.hostid,
            value_type: task.preproc.value_type(),
            discovery: task.preproc.is_discovery(),
            value: task.result,
            ts: task.ts,
            opt: task.opt,
        });
    }

    fn process_dependent(&mut self, task: DependentTask) {
        let DependentTask { primary, cache, .. } = task;

        let tasks = match cache {
            Some(cache) => self.dependent_tasks(&primary, &cache),
            None => Vec::new(),
        };
        self.flush(primary);

        if tasks.is_empty() {
            return;
        }
        self.in_flight += tasks.len();

        {
            let mut state = self.queue.lock();
            for task in tasks {
                if task.is_serial() {
                    state.push_new(task);
                } else {
                    state.push_immediate(task);
                }
            }
        }
        self.queue.notify_all();
    }

    /// One task per known dependent item, all reading from `cache`
    fn dependent_tasks(&self, primary: &ValueTask, cache: &Arc<PreprocCache>) -> Vec<Task> {
        primary
            .preproc
            .dep_itemids()
            .iter()
            .filter_map(|itemid| self.items.get(itemid))
            .map(|dep| {
                let task = ValueTask::with_cache(dep, Arc::clone(cache), primary.ts, ValueOpt::default());
                if dep.preproc.dep_itemids().is_empty() {
                    Task::value(task)
                } else {
                    Task::Dependent(DependentTask::new(task, self.cache_rules(dep)))
                }
            })
            .collect()
    }

    /// Rule set the dependents' shared cache is prepared for
    fn cache_rules(&self, item: &Item) -> Option<Arc<RuleSet>> {
        item.preproc
            .dep_itemids()
            .iter()
            .find_map(|itemid| self.items.get(itemid))
            .map(|dep| Arc::clone(&dep.preproc))
    }

    fn process_sequence(&mut self, mut seq: SequenceTask) {
        let itemid = seq.itemid;

        if let Some(task) = seq.task.take() {
            self.process_finished(*task);
        }

        let mut state = self.queue.lock();
        match state.next_in_sequence(itemid) {
            Some(next) => {
                seq.task = Some(Box::new(next));
                state.push_immediate(Task::Sequence(seq));
                drop(state);
                self.queue.notify();
            }
            None => state.remove_sequence(itemid),
        }
    }

    // ==================== Diagnostics ====================

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            items: self.items.len(),
            queued: self.queued,
            flushed: self.flushed,
            in_flight: self.in_flight,
            queue: self.queue.lock().stats(),
        }
    }

    /// Serial items with the most values waiting, longest first
    pub fn top_sequences(&self, limit: usize) -> Vec<(u64, usize)> {
        self.queue.lock().top_sequences(limit)
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("items", &self.items.len())
            .field("workers", &self.workers.len())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocessor::sink::MockFlushSink;
    use crate::preprocessor::step::StepType;

    fn config() -> ManagerConfig {
        ManagerConfig::default().with_workers(2)
    }

    fn quiet_sink() -> Box<MockFlushSink> {
        let mut sink = MockFlushSink::new();
        sink.expect_flush().return_const(());
        Box::new(sink)
    }

    /// Drain until `expected` tasks were handled
    fn drain_n(manager: &mut Manager, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut handled = 0;
        while handled < expected {
            assert!(Instant::now() < deadline, "only {} of {} tasks finished", handled, expected);
            manager.wait_finished(Duration::from_millis(50));
            handled += manager.drain_finished(16);
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ManagerConfig::default().with_workers(0);
        assert!(matches!(
            Manager::new(&config, quiet_sink()),
            Err(PreprocError::Config(_))
        ));
    }

    #[test]
    fn test_workers_register() {
        let manager = Manager::new(&config(), quiet_sink()).unwrap();
        assert_eq!(manager.stats().queue.workers, 2);
    }

    #[test]
    fn test_multiplier_flushed() {
        let mut sink = MockFlushSink::new();
        sink.expect_flush()
            .withf(|v| v.itemid == 1 && v.hostid == 5 && v.value == Value::Uint64(20))
            .times(1)
            .return_const(());

        let mut manager = Manager::new(&config(), Box::new(sink)).unwrap();
        let rules =
            RuleSet::new(ValueType::Uint64).with_steps(vec![Step::new(StepType::Multiplier, "2")]);
        manager.add_item(Item::new(1, 5, rules));

        assert!(manager.enqueue_value(1, "10".into(), Utc::now(), ValueOpt::default()));
        drain_n(&mut manager, 1);
        assert_eq!(manager.stats().flushed, 1);
    }

    #[test]
    fn test_unknown_item_ignored() {
        let mut sink = MockFlushSink::new();
        sink.expect_flush().times(0);

        let mut manager = Manager::new(&config(), Box::new(sink)).unwrap();
        assert!(!manager.enqueue_value(9, "x".into(), Utc::now(), ValueOpt::default()));
        assert!(manager.enqueue_test(9, "x".into()).is_none());
        assert!(!manager.wait_finished(Duration::from_millis(20)));
        assert_eq!(manager.stats().queued, 0);
    }

    #[test]
    fn test_update_item_swaps_rules() {
        let mut manager = Manager::new(&config(), quiet_sink()).unwrap();
        manager.add_item(Item::new(1, 1, RuleSet::new(ValueType::Str)));
        let old = Arc::clone(&manager.item(1).unwrap().preproc);

        assert!(manager.update_item(1, RuleSet::new(ValueType::Uint64)));
        let item = manager.item(1).unwrap();
        assert_eq!(item.revision, 1);
        assert_eq!(item.preproc.value_type(), ValueType::Uint64);
        assert!(!Arc::ptr_eq(&old, &item.preproc));
        assert_eq!(old.value_type(), ValueType::Str);

        assert!(!manager.update_item(2, RuleSet::new(ValueType::Str)));
        assert!(manager.remove_item(1).is_some());
        assert_eq!(manager.items().count(), 0);
    }

    #[test]
    fn test_dependent_tasks_share_cache() {
        let mut manager = Manager::new(&config(), quiet_sink()).unwrap();
        manager.add_item(Item::new(
            1,
            1,
            RuleSet::new(ValueType::Text).with_dependents(vec![2, 3, 4]),
        ));
        for itemid in 2..=4 {
            let rules = RuleSet::new(ValueType::Str)
                .with_steps(vec![Step::new(StepType::Jsonpath, "$.a")]);
            manager.add_item(Item::new(itemid, 1, rules));
        }

        let primary = ValueTask::new(
            manager.item(1).unwrap(),
            Value::None,
            Utc::now(),
            ValueOpt::default(),
        );
        let cache_rules = manager.cache_rules(manager.item(1).unwrap()).unwrap();
        let mut payload = Value::from(r#"{"a":1}"#);
        let cache = PreprocCache::create(&cache_rules, &mut payload);

        let tasks = manager.dependent_tasks(&primary, &cache);
        assert_eq!(tasks.len(), 3);
        for task in &tasks {
            let Task::Value(t) = task else {
                panic!("expected value task");
            };
            assert!(Arc::ptr_eq(t.cache.as_ref().unwrap(), &cache));
        }
        assert_eq!(Arc::strong_count(&cache), 4);

        drop(tasks);
        assert_eq!(Arc::strong_count(&cache), 1);
    }

    #[test]
    fn test_dependent_fan_out_flushes_all() {
        let mut sink = MockFlushSink::new();
        sink.expect_flush()
            .withf(|v| v.itemid == 1)
            .times(1)
            .return_const(());
        sink.expect_flush()
            .withf(|v| v.itemid == 2 && v.value == Value::from("7"))
            .times(1)
            .return_const(());
        sink.expect_flush()
            .withf(|v| v.itemid == 3 && v.value == Value::from("x"))
            .times(1)
            .return_const(());

        let mut manager = Manager::new(&config(), Box::new(sink)).unwrap();
        manager.add_item(Item::new(
            1,
            1,
            RuleSet::new(ValueType::Text).with_dependents(vec![2, 3]),
        ));
        manager.add_item(Item::new(
            2,
            1,
            RuleSet::new(ValueType::Str).with_steps(vec![Step::new(StepType::Jsonpath, "$.n")]),
        ));
        manager.add_item(Item::new(
            3,
            1,
            RuleSet::new(ValueType::Str).with_steps(vec![Step::new(StepType::Jsonpath, "$.s")]),
        ));

        manager.enqueue_value(1, r#"{"n":7,"s":"x"}"#.into(), Utc::now(), ValueOpt::default());
        drain_n(&mut manager, 3);
        assert_eq!(manager.stats().in_flight, 0);
    }

    #[test]
    fn test_failed_primary_skips_dependents() {
        let mut sink = MockFlushSink::new();
        sink.expect_flush()
            .withf(|v| v.itemid == 1 && v.value.is_error())
            .times(1)
            .return_const(());

        let mut manager = Manager::new(&config(), Box::new(sink)).unwrap();
        manager.add_item(Item::new(
            1,
            1,
            RuleSet::new(ValueType::Uint64)
                .with_steps(vec![Step::new(StepType::Multiplier, "2")])
                .with_dependents(vec![2]),
        ));
        manager.add_item(Item::new(2, 1, RuleSet::new(ValueType::Str)));

        manager.enqueue_value(1, "abc".into(), Utc::now(), ValueOpt::default());
        drain_n(&mut manager, 1);
        assert!(!manager.wait_finished(Duration::from_millis(50)));
    }

    #[test]
    fn test_enqueue_test_returns_result() {
        let mut manager = Manager::new(&config(), quiet_sink()).unwrap();
        let rules = RuleSet::new(ValueType::Str).with_steps(vec![Step::new(StepType::Ltrim, "")]);
        manager.add_item(Item::new(1, 1, rules));

        let rx = manager.enqueue_test(1, "  padded  ".into()).unwrap();
        drain_n(&mut manager, 1);

        let result = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(result.value, Value::from("padded  "));
        assert_eq!(result.results.len(), 1);
        assert_eq!(manager.stats().flushed, 0);
    }

    #[test]
    fn test_steps_with_history() {
        let mut manager = Manager::new(&config(), quiet_sink()).unwrap();
        let steps = vec![Step::new(StepType::DeltaValue, "")];

        let rx = manager.test_steps(steps.clone(), ValueType::Uint64, "10".into(), History::new());
        drain_n(&mut manager, 1);
        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(first.value.is_none());
        assert_eq!(first.history.len(), 1);

        let rx = manager.test_steps(steps, ValueType::Uint64, "25".into(), first.history);
        drain_n(&mut manager, 1);
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(second.value, Value::Uint64(15));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut manager = Manager::new(&config(), quiet_sink()).unwrap();
        manager.shutdown();
        assert_eq!(manager.stats().queue.workers, 0);
        manager.shutdown();
    }
}

//! Preprocessing worker threads
//!
//! A worker registers with the queue, then loops: pop a task under the queue
//! lock, execute it without the lock, push it to the finished lane. With
//! nothing to do it waits on the queue's condition variable. Each worker owns
//! its execution context, so script engines are never shared.

use crate::error::{PreprocError, Result};
use crate::preprocessor::cache::PreprocCache;
use crate::preprocessor::execute::{execute, ExecutionContext};
use crate::preprocessor::history::History;
use crate::preprocessor::queue::TaskQueue;
use crate::preprocessor::task::{DependentTask, Task, TestTask, ValueTask};
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Handle of a running worker thread
#[derive(Debug)]
pub struct Worker {
    id: usize,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start a worker thread.
    ///
    /// `finished` is signalled after every executed task.
    pub fn spawn(id: usize, queue: Arc<TaskQueue>, finished: Sender<()>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("preproc-worker-{}", id))
                .spawn(move || run(id, &queue, &stop, &finished))
                .map_err(|e| PreprocError::Startup(format!("cannot start worker #{}: {}", id, e)))?
        };

        Ok(Self {
            id,
            stop,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Ask the worker to exit after its current task.
    ///
    /// Must be called with the queue lock held, followed by a broadcast, so a
    /// worker cannot miss the flag between checking it and going to sleep.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wait for the thread to exit
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("preprocessing worker #{} panicked", self.id);
            }
        }
    }
}

fn run(id: usize, queue: &TaskQueue, stop: &AtomicBool, finished: &Sender<()>) {
    let mut ctx = ExecutionContext::new();

    let mut state = queue.lock();
    state.register_worker();
    tracing::info!("preprocessing worker #{} started", id);

    while !stop.load(Ordering::SeqCst) {
        let Some(task) = state.pop_new() else {
            state = queue.wait(state);
            continue;
        };
        drop(state);

        tracing::trace!("worker #{} processing {} task of item {}", id, task.kind(), task.itemid());
        let task = process_task(&mut ctx, task);

        state = queue.lock();
        state.push_done(task);
        // a full channel already holds a pending wakeup
        let _ = finished.try_send(());
    }

    state.deregister_worker();
    drop(state);

    tracing::info!("preprocessing worker #{} stopped", id);
}

/// Execute a task, storing its results in the task
pub(crate) fn process_task(ctx: &mut ExecutionContext, task: Task) -> Task {
    match task {
        Task::Test(mut t) => {
            process_test(ctx, &mut t);
            Task::Test(t)
        }
        Task::Value(mut t) => {
            process_value(ctx, &mut t);
            Task::Value(t)
        }
        Task::ValueSeq(mut t) => {
            process_value(ctx, &mut t);
            Task::ValueSeq(t)
        }
        Task::Dependent(mut t) => {
            process_dependent(ctx, &mut t);
            Task::Dependent(t)
        }
        Task::Sequence(mut seq) => {
            if let Some(inner) = seq.task.take() {
                seq.task = Some(Box::new(process_task(ctx, *inner)));
            }
            Task::Sequence(seq)
        }
    }
}

fn process_test(ctx: &mut ExecutionContext, task: &mut TestTask) {
    let out = execute(
        ctx,
        &task.preproc,
        None,
        task.value.take(),
        task.ts,
        &mut task.history,
    );
    task.result = out.value;
    task.results = out.results;
}

fn process_value(ctx: &mut ExecutionContext, task: &mut ValueTask) {
    let rules = Arc::clone(&task.preproc);
    let cache = task.cache.take();
    let value = task.value.take();

    let out = if rules.history_num() > 0 {
        let mut history = rules.lock_history();
        execute(ctx, &rules, cache.as_deref(), value, task.ts, &mut history)
    } else {
        let mut history = History::new();
        execute(ctx, &rules, cache.as_deref(), value, task.ts, &mut history)
    };

    task.result = out.value;
}

fn process_dependent(ctx: &mut ExecutionContext, task: &mut DependentTask) {
    process_value(ctx, &mut task.primary);

    let result = &task.primary.result;
    if result.is_none() || result.is_error() {
        return;
    }

    if let Some(rules) = &task.cache_rules {
        let mut value = result.clone();
        let cache = PreprocCache::create(rules, &mut value);
        cache.prepare();
        task.cache = Some(cache);
    }
}

//! Item value preprocessing
//!
//! Values collected for monitored items pass through the item's rule set
//! before they are stored. The pieces:
//!
//! - [`Manager`] - item table, input and output of the pipeline
//! - [`TaskQueue`] - lanes of tasks waiting for workers or for the manager
//! - [`Worker`] - threads executing tasks
//! - [`execute`] - the step interpreter
//! - [`PreprocCache`] - decoded payload shared with dependent items
//! - [`FlushSink`] - destination of processed values
//!
//! # Scheduling
//!
//! Values of parallel items run on any free worker in any order. Values of
//! serial items, including every item with delta, throttle or script steps,
//! run one at a time in arrival order because those steps read the result of
//! the previous run from the rule set's [`History`].

pub mod cache;
pub mod execute;
pub mod history;
pub mod item;
pub mod manager;
pub mod queue;
pub mod sink;
pub mod step;
pub mod task;
pub mod worker;

pub use cache::{CacheData, PreprocCache};
pub use execute::{execute, Execution, ExecutionContext, StepResult};
pub use history::{History, StepHistory};
pub use item::{Item, ProcessMode, RuleSet};
pub use manager::{Manager, ManagerStats};
pub use queue::{QueueState, QueueStats, TaskQueue};
pub use sink::{ChannelSink, FlushSink, FlushedValue, SinkMode, SinkReceivers};
pub use step::{ErrorHandler, Step, StepAction, StepType};
pub use task::{DependentTask, SequenceTask, Task, TestResult, TestTask, ValueTask};
pub use worker::Worker;

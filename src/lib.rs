//! # preproc-rs: item value preprocessing engine
//!
//! Values collected for monitored items are transformed, validated and
//! filtered by per-item chains of preprocessing steps before they are stored.
//! A pool of worker threads executes the chains while a manager keeps the
//! order of serial items, shares decoded payloads with dependent items and
//! hands results to a sink.
//!
//! ## Architecture
//!
//! - **Preprocessor**: manager, task queue, workers and the step interpreter
//! - **Codecs**: JSONPath, XPath, Prometheus exposition and CSV handling
//! - **Scripting**: Rhai scripts as preprocessing steps
//! - **Communication**: Crossbeam channels for finished-task wakeups, test
//!   replies and the channel sink
//!
//! ## Example
//!
//! ```ignore
//! use preproc_rs::{
//!     config::ManagerConfig,
//!     preprocessor::{ChannelSink, Item, Manager, RuleSet, SinkMode, Step, StepType},
//!     types::{Value, ValueOpt, ValueType},
//! };
//!
//! let (sink, receivers) = ChannelSink::new(SinkMode::Server);
//! let mut manager = Manager::new(&ManagerConfig::default(), Box::new(sink))?;
//!
//! let rules = RuleSet::new(ValueType::Uint64)
//!     .with_steps(vec![Step::new(StepType::Multiplier, "2")]);
//! manager.add_item(Item::new(1, 1, rules));
//!
//! manager.enqueue_value(1, Value::from("10"), chrono::Utc::now(), ValueOpt::default());
//! manager.wait_finished(std::time::Duration::from_secs(1));
//! manager.drain();
//!
//! assert_eq!(receivers.history.recv()?.value, Value::Uint64(20));
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod preprocessor;
pub mod scripting;
pub mod types;

// Re-export commonly used types
pub use config::{ItemConfig, ManagerConfig, PreprocConfig};
pub use error::{PreprocError, Result};
pub use preprocessor::{
    ChannelSink, FlushSink, FlushedValue, Item, Manager, RuleSet, SinkMode, Step, StepType,
};
pub use types::{Timestamp, Value, ValueOpt, ValueType};

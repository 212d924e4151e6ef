//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;

use chrono::{TimeZone, Utc};
use preproc_rs::preprocessor::{ChannelSink, FlushedValue, Manager, SinkMode, SinkReceivers};
use preproc_rs::{ManagerConfig, Timestamp};
use std::time::{Duration, Instant};

/// Create a test timeout duration
pub fn test_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Timestamp `secs` seconds after the epoch
pub fn ts(secs: i64) -> Timestamp {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// Start a manager with `workers` threads and a channel sink
pub fn start_manager(workers: usize, mode: SinkMode) -> (Manager, SinkReceivers) {
    let (sink, receivers) = ChannelSink::new(mode);
    let config = ManagerConfig::default().with_workers(workers);
    let manager = Manager::new(&config, Box::new(sink)).expect("manager starts");
    (manager, receivers)
}

/// Drain until nothing is in flight, returning the history values in flush order
pub fn drain_all(manager: &mut Manager, receivers: &SinkReceivers) -> Vec<FlushedValue> {
    let deadline = Instant::now() + test_timeout();

    while manager.stats().in_flight > 0 {
        assert!(
            Instant::now() < deadline,
            "tasks still in flight: {:?}",
            manager.stats()
        );
        manager.wait_finished(Duration::from_millis(50));
        manager.drain_finished(8);
    }

    receivers.history.try_iter().collect()
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}

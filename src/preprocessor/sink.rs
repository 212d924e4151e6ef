//! Destination of processed values

use crate::types::{Timestamp, Value, ValueOpt, ValueType};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

/// A fully processed value handed to the sink
#[derive(Debug, Clone, PartialEq)]
pub struct FlushedValue {
    pub itemid: u64,
    pub hostid: u64,
    pub value_type: ValueType,
    /// Value of a discovery rule rather than of a regular item
    pub discovery: bool,
    pub value: Value,
    pub ts: Timestamp,
    pub opt: ValueOpt,
}

/// Receives every value leaving the pipeline
#[cfg_attr(test, mockall::automock)]
pub trait FlushSink: Send {
    fn flush(&mut self, value: FlushedValue);
}

/// Routing of discovery rule values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkMode {
    /// Discovery rule values go to the discovery channel
    #[default]
    Server,
    /// Everything goes to history
    Proxy,
}

/// Receiving ends of a [`ChannelSink`]
#[derive(Debug, Clone)]
pub struct SinkReceivers {
    pub history: Receiver<FlushedValue>,
    pub discovery: Receiver<FlushedValue>,
}

/// Sink forwarding values over crossbeam channels
#[derive(Debug)]
pub struct ChannelSink {
    mode: SinkMode,
    history: Sender<FlushedValue>,
    discovery: Sender<FlushedValue>,
}

impl ChannelSink {
    pub fn new(mode: SinkMode) -> (Self, SinkReceivers) {
        let (history_tx, history_rx) = unbounded();
        let (discovery_tx, discovery_rx) = unbounded();

        let sink = Self {
            mode,
            history: history_tx,
            discovery: discovery_tx,
        };
        let receivers = SinkReceivers {
            history: history_rx,
            discovery: discovery_rx,
        };
        (sink, receivers)
    }

    pub fn mode(&self) -> SinkMode {
        self.mode
    }

    fn send_discovery(&self, mut value: FlushedValue) {
        value.value = match value.value {
            Value::Error(e) => Value::Error(e),
            Value::None => Value::None,
            other => other.to_str().map(Value::Str).unwrap_or(Value::None),
        };

        if value.value.is_none() && !value.opt.has_meta() {
            tracing::trace!("dropping empty discovery value of item {}", value.itemid);
            return;
        }

        if self.discovery.send(value).is_err() {
            tracing::warn!("discovery receiver disconnected");
        }
    }
}

impl FlushSink for ChannelSink {
    fn flush(&mut self, value: FlushedValue) {
        if value.discovery && self.mode == SinkMode::Server {
            self.send_discovery(value);
            return;
        }

        if self.history.send(value).is_err() {
            tracing::warn!("history receiver disconnected");
        }
    }
}

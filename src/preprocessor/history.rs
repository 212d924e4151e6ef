//! Per-step history of a rule set
//!
//! Delta, throttle and script steps need the value they saw on the previous
//! run. The history keeps at most one entry per step index. A run pops the
//! entries it needs from the old history and builds a fresh one, which then
//! replaces the old history wholesale.

use crate::types::{Timestamp, Value};

/// Value remembered by one step
#[derive(Debug, Clone, PartialEq)]
pub struct StepHistory {
    pub index: usize,
    pub value: Value,
    pub ts: Timestamp,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    entries: Vec<StepHistory>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Store the entry for `index`, overwriting any existing one
    pub fn add(&mut self, index: usize, value: Value, ts: Timestamp) {
        match self.entries.iter_mut().find(|e| e.index == index) {
            Some(entry) => {
                entry.value = value;
                entry.ts = ts;
            }
            None => self.entries.push(StepHistory { index, value, ts }),
        }
    }

    /// Remove and return the entry for `index`
    pub fn pop(&mut self, index: usize) -> Option<(Value, Timestamp)> {
        let pos = self.entries.iter().position(|e| e.index == index)?;
        let entry = self.entries.swap_remove(pos);
        Some((entry.value, entry.ts))
    }

    pub fn get(&self, index: usize) -> Option<&StepHistory> {
        self.entries.iter().find(|e| e.index == index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepHistory> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn ts(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_add_overwrites() {
        let mut history = History::new();
        history.add(1, Value::Uint64(10), ts(100));
        history.add(1, Value::Uint64(20), ts(200));
        assert_eq!(history.len(), 1);
        assert_eq!(history.get(1).unwrap().value, Value::Uint64(20));
        assert_eq!(history.get(1).unwrap().ts, ts(200));
    }

    #[test]
    fn test_pop_removes() {
        let mut history = History::new();
        history.add(0, Value::from("a"), ts(1));
        history.add(3, Value::from("b"), ts(2));

        assert_eq!(history.pop(3), Some((Value::from("b"), ts(2))));
        assert_eq!(history.pop(3), None);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_pop_missing() {
        let mut history = History::with_capacity(2);
        assert!(history.pop(0).is_none());
        assert!(history.is_empty());
    }
}

//! Shared preprocessing cache
//!
//! When a value fans out to dependent items, every dependent chain would
//! otherwise decode the same payload again. The cache keeps the payload and
//! builds its decoded tree once, on first access, for all of them.
//!
//! The cache is handed around as `Arc<PreprocCache>`: cloning the `Arc`
//! takes a reference and dropping it releases one. The tree is built behind a
//! `OnceLock`, so concurrent first accesses from several workers still decode
//! exactly once.

use crate::codec::{json, PrometheusData};
use crate::preprocessor::item::RuleSet;
use crate::preprocessor::step::StepType;
use crate::types::Value;
use std::sync::{Arc, OnceLock};

/// Decoded representation of the cached payload
#[derive(Debug)]
pub enum CacheData {
    Json(serde_json::Value),
    Prometheus(PrometheusData),
}

#[derive(Debug)]
pub struct PreprocCache {
    step_type: Option<StepType>,
    value: Value,
    data: OnceLock<Result<CacheData, String>>,
}

impl PreprocCache {
    /// Create a cache for values processed by `rules`.
    ///
    /// Takes the value, leaving `Value::None` behind. The cache is tagged with
    /// the type of the chain's first step.
    pub fn create(rules: &RuleSet, value: &mut Value) -> Arc<Self> {
        Arc::new(Self {
            step_type: rules.steps().first().map(|s| s.step_type),
            value: value.take(),
            data: OnceLock::new(),
        })
    }

    pub fn step_type(&self) -> Option<StepType> {
        self.step_type
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Copy of the original value for steps that mutate it
    pub fn get_value(&self) -> Value {
        self.value.clone()
    }

    /// Whether a step of `step_type` can read the decoded tree
    pub fn serves(&self, step_type: StepType) -> bool {
        step_type.uses_cache() && self.step_type == Some(step_type)
    }

    /// Decoded tree, built on first access
    pub fn data(&self) -> Result<&CacheData, String> {
        self.data
            .get_or_init(|| self.decode())
            .as_ref()
            .map_err(Clone::clone)
    }

    pub fn json(&self) -> Result<&serde_json::Value, String> {
        match self.data()? {
            CacheData::Json(doc) => Ok(doc),
            _ => Err("cached value is not a JSON document".to_string()),
        }
    }

    pub fn prometheus(&self) -> Result<&PrometheusData, String> {
        match self.data()? {
            CacheData::Prometheus(data) => Ok(data),
            _ => Err("cached value is not a Prometheus payload".to_string()),
        }
    }

    /// Decode ahead of fan-out so dependents never race on the first access
    pub fn prepare(&self) {
        if self.step_type.is_some_and(|t| t.uses_cache()) {
            let _ = self.data();
        }
    }

    // XPath dependents re-parse: an sxd `Package` is not `Send`, so it cannot
    // sit in a cache shared across workers.
    fn decode(&self) -> Result<CacheData, String> {
        let text = self.value.to_str()?;
        match self.step_type {
            Some(StepType::Jsonpath) => json::parse(&text).map(CacheData::Json),
            Some(StepType::PrometheusPattern) => {
                PrometheusData::parse(&text).map(CacheData::Prometheus)
            }
            _ => Err("value has no cached representation".to_string()),
        }
    }
}

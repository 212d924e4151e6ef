//! Item definitions in the configuration file

use crate::preprocessor::item::{Item, ProcessMode, RuleSet};
use crate::preprocessor::step::Step;
use crate::types::ValueType;
use serde::{Deserialize, Serialize};

/// One item and its preprocessing steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemConfig {
    pub itemid: u64,

    #[serde(default)]
    pub hostid: u64,

    #[serde(default)]
    pub value_type: ValueType,

    /// Requested processing mode; history-bearing steps force serial
    #[serde(default)]
    pub mode: ProcessMode,

    /// Whether the item is a discovery rule
    #[serde(default)]
    pub discovery: bool,

    /// Items fed from this item's result
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependents: Vec<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
}

impl ItemConfig {
    pub fn new(itemid: u64, value_type: ValueType) -> Self {
        Self {
            itemid,
            hostid: 0,
            value_type,
            mode: ProcessMode::default(),
            discovery: false,
            dependents: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn with_steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_dependents(mut self, dependents: Vec<u64>) -> Self {
        self.dependents = dependents;
        self
    }

    /// Build the rule set described by this entry
    pub fn rule_set(&self) -> RuleSet {
        RuleSet::new(self.value_type)
            .with_steps(self.steps.clone())
            .with_mode(self.mode)
            .with_discovery(self.discovery)
            .with_dependents(self.dependents.clone())
    }

    pub fn to_item(&self) -> Item {
        Item::new(self.itemid, self.hostid, self.rule_set())
    }
}

//! Test data builders for creating test objects

use preproc_rs::preprocessor::{ErrorHandler, Item, ProcessMode, RuleSet, Step, StepType};
use preproc_rs::ValueType;

/// Builder for creating test Items
pub struct ItemBuilder {
    itemid: u64,
    hostid: u64,
    value_type: ValueType,
    mode: ProcessMode,
    discovery: bool,
    dependents: Vec<u64>,
    steps: Vec<Step>,
}

impl ItemBuilder {
    pub fn new(itemid: u64) -> Self {
        Self {
            itemid,
            hostid: 1,
            value_type: ValueType::Str,
            mode: ProcessMode::Parallel,
            discovery: false,
            dependents: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    pub fn serial(mut self) -> Self {
        self.mode = ProcessMode::Serial;
        self
    }

    pub fn discovery(mut self) -> Self {
        self.discovery = true;
        self
    }

    pub fn dependents(mut self, dependents: &[u64]) -> Self {
        self.dependents = dependents.to_vec();
        self
    }

    pub fn step(mut self, step_type: StepType, params: &str) -> Self {
        self.steps.push(Step::new(step_type, params));
        self
    }

    /// Add a step with a failure policy
    pub fn step_on_fail(
        mut self,
        step_type: StepType,
        params: &str,
        handler: ErrorHandler,
        handler_params: &str,
    ) -> Self {
        self.steps
            .push(Step::new(step_type, params).on_fail(handler, handler_params));
        self
    }

    pub fn rules(self) -> RuleSet {
        RuleSet::new(self.value_type)
            .with_steps(self.steps)
            .with_mode(self.mode)
            .with_discovery(self.discovery)
            .with_dependents(self.dependents)
    }

    pub fn build(self) -> Item {
        let (itemid, hostid) = (self.itemid, self.hostid);
        Item::new(itemid, hostid, self.rules())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_builder() {
        let item = ItemBuilder::new(5)
            .value_type(ValueType::Float)
            .step(StepType::DeltaSpeed, "")
            .dependents(&[6])
            .build();

        assert_eq!(item.itemid, 5);
        assert_eq!(item.preproc.value_type(), ValueType::Float);
        assert_eq!(item.preproc.dep_itemids(), &[6]);
        assert!(item.preproc.is_serial());
    }
}

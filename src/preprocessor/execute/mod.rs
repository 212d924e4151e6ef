//! Step interpreter
//!
//! Runs a rule set's steps over one value. Each step may fail; failures are
//! resolved by the step's error handler, and a chain that ends in an error
//! gets a composite message listing what every executed step did.
//!
//! # History
//!
//! Steps pop their entry from the rule set's history before running and the
//! entries of successful history-bearing steps are collected into a fresh
//! history, which replaces the old one after the run. A chain ending in an
//! error leaves no history behind, so the next value starts clean.
//!
//! # Cache
//!
//! When a shared cache is supplied, the input comes from the cache and the
//! first step may read the cache's decoded tree instead of parsing the
//! payload again. Later steps work on their own values.

pub mod format;
pub mod ops;

use crate::preprocessor::cache::PreprocCache;
use crate::preprocessor::history::History;
use crate::preprocessor::item::RuleSet;
use crate::preprocessor::step::{ErrorHandler, Step, StepAction, StepType};
use crate::scripting::ScriptEngine;
use crate::types::{Timestamp, Value};

pub use format::format_error;

/// Outcome of one executed step
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    /// Value after the error handler
    pub value: Value,
    /// Failure message before the error handler, if the step failed
    pub error: Option<String>,
    pub action: StepAction,
}

/// Outcome of a whole chain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Execution {
    pub value: Value,
    pub results: Vec<StepResult>,
}

/// Per-worker execution state
#[derive(Debug, Default)]
pub struct ExecutionContext {
    script: Option<ScriptEngine>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The worker's script engine, created on first use
    pub fn script_engine(&mut self) -> &mut ScriptEngine {
        self.script.get_or_insert_with(ScriptEngine::new)
    }

    pub fn has_script_engine(&self) -> bool {
        self.script.is_some()
    }
}

fn on_fail(step: &Step, error: String) -> (Value, StepAction) {
    let value = match step.error_handler {
        ErrorHandler::Default => Value::Error(error),
        ErrorHandler::DiscardValue => Value::None,
        ErrorHandler::SetValue => Value::Str(step.error_handler_params.clone()),
        ErrorHandler::SetError => Value::Error(step.error_handler_params.clone()),
    };
    (value, step.error_handler.into())
}

/// Run `rules` over `value_in`.
///
/// `history` is the rule set's step history; it is replaced with the history
/// produced by this run. With a cache, `value_in` is ignored and the cached
/// value is used instead.
pub fn execute(
    ctx: &mut ExecutionContext,
    rules: &RuleSet,
    cache: Option<&PreprocCache>,
    value_in: Value,
    ts: Timestamp,
    history: &mut History,
) -> Execution {
    let mut value = match cache {
        Some(cache) => cache.get_value(),
        None => value_in,
    };

    tracing::debug!(
        "executing {} steps on value:{} type:{}",
        rules.steps().len(),
        format::preview(&value),
        value.type_desc()
    );

    if rules.steps().is_empty() {
        return Execution {
            value,
            results: Vec::new(),
        };
    }

    let input_preview = format::preview(&value);
    let mut new_history = History::with_capacity(rules.history_num());
    let mut results = Vec::with_capacity(rules.steps().len());
    let mut action = StepAction::Default;
    let mut cache = cache;

    for (i, step) in rules.steps().iter().enumerate() {
        if value.is_none() {
            break;
        }
        if value.is_error() && step.step_type != StepType::ValidateNotSupported {
            break;
        }

        let mut slot = history.pop(i);
        let outcome = ops::execute_step(
            ctx,
            cache,
            rules.value_type(),
            value.take(),
            ts,
            step,
            &mut slot,
        );

        let error = match outcome {
            Ok(out) => {
                action = if out.is_error() {
                    StepAction::ForceError
                } else {
                    StepAction::Default
                };
                value = out;
                None
            }
            Err(err) => {
                tracing::trace!("step {} ({}) failed: {}", i + 1, step.step_type, err);
                (value, action) = on_fail(step, err.clone());
                Some(err)
            }
        };

        results.push(StepResult {
            value: value.clone(),
            error,
            action,
        });

        if step.step_type.has_history() && !value.is_error() {
            if let Some((history_value, history_ts)) = slot {
                new_history.add(i, history_value, history_ts);
            }
        }

        cache = None;
    }

    if value.is_error() {
        new_history.clear();

        if !matches!(action, StepAction::SetError | StepAction::ForceError) {
            value = Value::Error(format_error(&input_preview, &results));
        }
    }

    *history = new_history;

    tracing::debug!(
        "preprocessing result value:{} type:{}",
        format::preview(&value),
        value.type_desc()
    );

    Execution { value, results }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueType;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn ts(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn run(rules: &RuleSet, value: Value, at: Timestamp) -> Execution {
        let mut ctx = ExecutionContext::new();
        let mut history = rules.lock_history();
        execute(&mut ctx, rules, None, value, at, &mut history)
    }

    #[test]
    fn test_no_steps_passes_value_through() {
        let rules = RuleSet::new(ValueType::Str);
        let out = run(&rules, Value::from("x"), ts(0));
        assert_eq!(out.value, Value::from("x"));
        assert!(out.results.is_empty());
    }

    #[test]
    fn test_multiplier_chain() {
        let rules = RuleSet::new(ValueType::Uint64)
            .with_steps(vec![Step::new(StepType::Multiplier, "2")]);
        let out = run(&rules, Value::from("10"), ts(0));
        assert_eq!(out.value.to_str().unwrap(), "20");
        assert_eq!(out.results.len(), 1);
        assert_eq!(out.results[0].action, StepAction::Default);
    }

    #[test]
    fn test_default_failure_is_composite() {
        let rules = RuleSet::new(ValueType::Str).with_steps(vec![
            Step::new(StepType::Trim, ""),
            Step::new(StepType::Multiplier, "2"),
            Step::new(StepType::Trim, ""),
        ]);
        let out = run(&rules, Value::from(" abc "), ts(0));

        let Value::Error(msg) = out.value else {
            panic!("expected error, got {:?}", out.value);
        };
        assert!(msg.starts_with("Preprocessing failed for:  abc \n1. Result: abc\n2. Failed: cannot apply multiplier"));
        // chain stops after the failing step
        assert_eq!(out.results.len(), 2);
    }

    #[test]
    fn test_discard_value_stops_chain() {
        let rules = RuleSet::new(ValueType::Str).with_steps(vec![
            Step::new(StepType::Multiplier, "2").on_fail(ErrorHandler::DiscardValue, ""),
            Step::new(StepType::Trim, ""),
        ]);
        let out = run(&rules, Value::from("abc"), ts(0));
        assert!(out.value.is_none());
        assert_eq!(out.results.len(), 1);
        assert_eq!(out.results[0].action, StepAction::DiscardValue);
        assert!(out.results[0].error.is_some());
    }

    #[test]
    fn test_set_value_continues_chain() {
        let rules = RuleSet::new(ValueType::Str).with_steps(vec![
            Step::new(StepType::Multiplier, "2").on_fail(ErrorHandler::SetValue, "7"),
            Step::new(StepType::Multiplier, "3"),
        ]);
        let out = run(&rules, Value::from("abc"), ts(0));
        assert_eq!(out.value, Value::Uint64(21));
    }

    #[test]
    fn test_set_error_is_verbatim() {
        let rules = RuleSet::new(ValueType::Str).with_steps(vec![
            Step::new(StepType::Multiplier, "2").on_fail(ErrorHandler::SetError, "custom"),
            Step::new(StepType::Trim, ""),
        ]);
        let out = run(&rules, Value::from("abc"), ts(0));
        assert_eq!(out.value, Value::Error("custom".into()));
        assert_eq!(out.results.len(), 1);
    }

    #[test]
    fn test_forced_error_is_verbatim() {
        let rules = RuleSet::new(ValueType::Str).with_steps(vec![
            Step::new(StepType::ErrorFieldJson, "$.error"),
            Step::new(StepType::Jsonpath, "$.data"),
        ]);
        let out = run(&rules, Value::from(r#"{"error":"access denied"}"#), ts(0));
        assert_eq!(out.value, Value::Error("access denied".into()));
        assert_eq!(out.results[0].action, StepAction::ForceError);
    }

    #[test]
    fn test_not_supported_check_handles_error_input() {
        let rules = RuleSet::new(ValueType::Str).with_steps(vec![Step::new(
            StepType::ValidateNotSupported,
            "",
        )
        .on_fail(ErrorHandler::SetValue, "fallback")]);
        let out = run(&rules, Value::Error("agent down".into()), ts(0));
        assert_eq!(out.value, Value::from("fallback"));
    }

    #[test]
    fn test_error_input_skips_other_steps() {
        let rules = RuleSet::new(ValueType::Str)
            .with_steps(vec![Step::new(StepType::Trim, "")]);
        let out = run(&rules, Value::Error("agent down".into()), ts(0));
        assert!(out.results.is_empty());
        assert!(out.value.is_error());
    }

    #[test]
    fn test_history_carried_between_runs() {
        let rules = RuleSet::new(ValueType::Float)
            .with_steps(vec![Step::new(StepType::DeltaSpeed, "")]);

        let first = run(&rules, Value::from("100"), ts(10));
        assert!(first.value.is_none());
        assert_eq!(rules.lock_history().len(), 1);

        let second = run(&rules, Value::from("150"), ts(20));
        assert_eq!(second.value, Value::Double(5.0));
    }

    #[test]
    fn test_error_resets_history() {
        let rules = RuleSet::new(ValueType::Float).with_steps(vec![
            Step::new(StepType::DeltaValue, ""),
            Step::new(StepType::ValidateRange, "0\n10"),
        ]);

        run(&rules, Value::from("1"), ts(0));
        assert_eq!(rules.lock_history().len(), 1);

        let out = run(&rules, Value::from("100"), ts(1));
        assert!(out.value.is_error());
        assert!(rules.lock_history().is_empty());

        // next value is a first observation again
        let out = run(&rules, Value::from("105"), ts(2));
        assert!(out.value.is_none());
    }

    #[test]
    fn test_cache_supplies_input() {
        let rules =
            RuleSet::new(ValueType::Str).with_steps(vec![Step::new(StepType::Jsonpath, "$.a")]);
        let mut payload = Value::from(r#"{"a":"cached"}"#);
        let cache = PreprocCache::create(&rules, &mut payload);

        let mut ctx = ExecutionContext::new();
        let mut history = History::new();
        let out = execute(&mut ctx, &rules, Some(cache.as_ref()), Value::None, ts(0), &mut history);
        assert_eq!(out.value, Value::from("cached"));
    }

    #[test]
    fn test_script_engine_created_lazily() {
        let mut ctx = ExecutionContext::new();
        assert!(!ctx.has_script_engine());

        let rules = RuleSet::new(ValueType::Str).with_steps(vec![Step::new(StepType::Trim, "")]);
        let mut history = History::new();
        execute(&mut ctx, &rules, None, Value::from(" a "), ts(0), &mut history);
        assert!(!ctx.has_script_engine());

        let rules =
            RuleSet::new(ValueType::Str).with_steps(vec![Step::new(StepType::Script, "value")]);
        execute(&mut ctx, &rules, None, Value::from("a"), ts(0), &mut history);
        assert!(ctx.has_script_engine());
    }

    proptest! {
        #[test]
        fn prop_history_free_chains_are_pure(input in "[ a-z0-9]{0,24}") {
            let rules = RuleSet::new(ValueType::Str).with_steps(vec![
                Step::new(StepType::Trim, ""),
                Step::new(StepType::StrReplace, "a\nb"),
            ]);
            let first = run(&rules, Value::from(input.as_str()), ts(0));
            let second = run(&rules, Value::from(input.as_str()), ts(100));
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_delta_value_matches_difference(v1 in 0u64..1_000_000, step in 0u64..1_000_000) {
            let rules = RuleSet::new(ValueType::Uint64)
                .with_steps(vec![Step::new(StepType::DeltaValue, "")]);
            run(&rules, Value::Uint64(v1), ts(0));
            let out = run(&rules, Value::Uint64(v1 + step), ts(1));
            prop_assert_eq!(out.value, Value::Uint64(step));
        }

        #[test]
        fn prop_delta_speed_matches_rate(v1 in 0.0f64..1e6, diff in 0.0f64..1e6, secs in 1i64..10_000) {
            let rules = RuleSet::new(ValueType::Float)
                .with_steps(vec![Step::new(StepType::DeltaSpeed, "")]);
            run(&rules, Value::Double(v1), ts(0));
            let out = run(&rules, Value::Double(v1 + diff), ts(secs));
            let Value::Double(speed) = out.value else {
                return Err(TestCaseError::fail("expected a double"));
            };
            let expected = ((v1 + diff) - v1) / secs as f64;
            prop_assert!((speed - expected).abs() <= 1e-9 * expected.abs().max(1.0));
        }
    }
}

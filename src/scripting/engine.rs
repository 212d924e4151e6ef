//! Rhai Script Engine Implementation
//!
//! This module provides the engine behind script preprocessing steps.
//!
//! ## Dynamic Variables
//!
//! - `value` - The current value being processed
//! - `prev()` - Previous input value of this step (`()` if not available)
//! - `has_prev()` - Whether a previous value is available
//! - `dt()` - Seconds since the previous value
//!
//! ## Helper Functions
//!
//! - `derivative(current)` - Rate of change against `prev()` over `dt()`

use crate::error::{PreprocError, Result, ResultExt};
use crate::scripting::{CompiledScript, ScriptCache};
use crate::types::Value;
use rhai::{Dynamic, Engine, Scope};
use std::sync::{Arc, RwLock};

/// Per-run inputs exposed to scripts alongside `value`
#[derive(Debug, Clone, Default)]
pub struct ScriptInput {
    /// Input value of the previous run, from the step history
    pub prev: Option<Value>,
    /// Seconds since the previous value
    pub dt_secs: f64,
}

impl ScriptInput {
    pub fn new(prev: Option<Value>, dt_secs: f64) -> Self {
        Self { prev, dt_secs }
    }

    /// Input for a first run with no history
    pub fn first_run() -> Self {
        Self::default()
    }
}

/// Shared script context read by the registered functions
#[derive(Debug, Clone, Default)]
pub struct ScriptContext {
    input: ScriptInput,
}

impl ScriptContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, input: ScriptInput) {
        self.input = input;
    }

    fn prev_numeric(&self) -> Option<f64> {
        match &self.input.prev {
            Some(Value::Uint64(v)) => Some(*v as f64),
            Some(Value::Double(v)) => Some(*v),
            Some(Value::Str(s)) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Thread-safe shared script context
pub type SharedScriptContext = Arc<RwLock<ScriptContext>>;

/// The script engine owned by a worker
pub struct ScriptEngine {
    /// The Rhai engine instance
    engine: Engine,
    /// Cache of compiled scripts
    cache: ScriptCache,
    /// Shared context for dynamic variable access
    context: SharedScriptContext,
}

impl ScriptEngine {
    /// Create a new script engine with default configuration
    pub fn new() -> Self {
        let context = Arc::new(RwLock::new(ScriptContext::new()));
        let mut engine = Engine::new();
        Self::configure_engine(&mut engine, context.clone());

        Self {
            engine,
            cache: ScriptCache::new(),
            context,
        }
    }

    /// Configure the Rhai engine with built-in functions and safety limits
    fn configure_engine(engine: &mut Engine, context: SharedScriptContext) {
        // Set safety limits
        engine.set_max_expr_depths(64, 64);
        engine.set_max_call_levels(32);
        engine.set_max_operations(100_000);
        engine.set_max_string_size(1_048_576);
        engine.set_max_array_size(10_000);
        engine.set_max_map_size(10_000);

        {
            let ctx = context.clone();
            engine.register_fn("prev", move || -> Dynamic {
                ctx.read()
                    .ok()
                    .and_then(|c| c.input.prev.as_ref().map(value_to_dynamic))
                    .unwrap_or(Dynamic::UNIT)
            });
        }
        {
            let ctx = context.clone();
            engine.register_fn("has_prev", move || -> bool {
                ctx.read().map(|c| c.input.prev.is_some()).unwrap_or(false)
            });
        }
        {
            let ctx = context.clone();
            engine.register_fn("dt", move || -> f64 {
                ctx.read().map(|c| c.input.dt_secs).unwrap_or(0.0)
            });
        }

        // Rate of change using the step history
        {
            let ctx = context.clone();
            engine.register_fn("derivative", move |current: f64| -> f64 {
                let (prev, dt) = ctx
                    .read()
                    .map(|c| (c.prev_numeric(), c.input.dt_secs))
                    .unwrap_or((None, 0.0));
                match prev {
                    Some(prev) if dt > 0.0 => (current - prev) / dt,
                    _ => 0.0,
                }
            });
        }
    }

    /// Compile a script and cache it
    pub fn compile(&mut self, source: &str) -> Result<CompiledScript> {
        self.cache.get_or_compile(&self.engine, source)
    }

    /// Execute a compiled script against a value
    pub fn execute(
        &mut self,
        script: &CompiledScript,
        value: &Value,
        input: ScriptInput,
    ) -> Result<Value> {
        // Update the shared context before execution
        {
            let mut context = self.context.write().map_err(|e| {
                PreprocError::Script(format!("Failed to acquire context lock: {}", e))
            })?;
            context.update(input);
        }

        let arg = value_to_dynamic(value);
        let mut scope = Scope::new();
        scope.push("value", arg.clone());

        let result = if script.has_convert {
            self.engine
                .call_fn::<Dynamic>(&mut scope, &script.ast, "convert", (arg,))
        } else {
            self.engine
                .eval_ast_with_scope::<Dynamic>(&mut scope, &script.ast)
        };

        dynamic_to_value(result.context("Execution error")?)
    }

    /// Compile and execute a script in one step
    pub fn run(&mut self, source: &str, value: &Value, input: ScriptInput) -> Result<Value> {
        let script = self.compile(source)?;
        self.execute(&script, value, input)
    }

    /// Validate a script without executing it
    pub fn validate(&self, source: &str) -> Result<()> {
        self.engine
            .compile(source)
            .map(|_| ())
            .map_err(|e| PreprocError::Script(format!("Validation error: {}", e)))
    }

    /// Number of compiled scripts currently cached
    pub fn cached_scripts(&self) -> usize {
        self.cache.len()
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("cache_size", &self.cache.len())
            .finish()
    }
}

fn value_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Uint64(v) => match i64::try_from(*v) {
            Ok(i) => Dynamic::from(i),
            Err(_) => Dynamic::from(*v as f64),
        },
        Value::Double(v) => Dynamic::from(*v),
        Value::Str(s) => Dynamic::from(s.clone()),
        Value::None | Value::Error(_) => Dynamic::UNIT,
    }
}

fn dynamic_to_value(result: Dynamic) -> Result<Value> {
    if result.is_unit() {
        return Ok(Value::None);
    }
    if result.is_string() {
        return result
            .into_string()
            .map(Value::Str)
            .map_err(|t| PreprocError::Script(format!("unexpected result type {}", t)));
    }
    if let Ok(i) = result.as_int() {
        return Ok(match u64::try_from(i) {
            Ok(u) => Value::Uint64(u),
            Err(_) => Value::Double(i as f64),
        });
    }
    if let Ok(f) = result.as_float() {
        if !f.is_finite() {
            return Err(PreprocError::Script(
                "script returned a non-finite number".to_string(),
            ));
        }
        return Ok(Value::Double(f));
    }
    if let Ok(b) = result.as_bool() {
        return Ok(Value::Str(b.to_string()));
    }
    Ok(Value::Str(result.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_creation() {
        let engine = ScriptEngine::new();
        assert_eq!(engine.cached_scripts(), 0);
    }

    #[test]
    fn test_numeric_result() {
        let mut engine = ScriptEngine::new();
        let result = engine
            .run("value * 2", &Value::Uint64(21), ScriptInput::first_run())
            .unwrap();
        assert_eq!(result, Value::Uint64(42));
    }

    #[test]
    fn test_string_result() {
        let mut engine = ScriptEngine::new();
        let result = engine
            .run("value.to_upper()", &Value::from("abc"), ScriptInput::first_run())
            .unwrap();
        assert_eq!(result, Value::from("ABC"));
    }

    #[test]
    fn test_float_result() {
        let mut engine = ScriptEngine::new();
        let result = engine
            .run(
                "parse_float(value) / 4.0",
                &Value::from("1"),
                ScriptInput::first_run(),
            )
            .unwrap();
        assert_eq!(result, Value::Double(0.25));
    }

    #[test]
    fn test_negative_int_becomes_double() {
        let mut engine = ScriptEngine::new();
        let result = engine
            .run("-5", &Value::None, ScriptInput::first_run())
            .unwrap();
        assert_eq!(result, Value::Double(-5.0));
    }

    #[test]
    fn test_unit_result_is_none() {
        let mut engine = ScriptEngine::new();
        let result = engine
            .run("()", &Value::from("x"), ScriptInput::first_run())
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_convert_function() {
        let mut engine = ScriptEngine::new();
        let script = r#"
fn convert(value) {
    value + "!"
}
"#;
        let result = engine
            .run(script, &Value::from("hi"), ScriptInput::first_run())
            .unwrap();
        assert_eq!(result, Value::from("hi!"));
    }

    #[test]
    fn test_prev_functions() {
        let mut engine = ScriptEngine::new();
        let script = "if has_prev() { parse_int(value) - parse_int(prev()) } else { () }";

        let result = engine
            .run(script, &Value::from("10"), ScriptInput::first_run())
            .unwrap();
        assert!(result.is_none());

        let input = ScriptInput::new(Some(Value::from("4")), 1.0);
        let result = engine.run(script, &Value::from("10"), input).unwrap();
        assert_eq!(result, Value::Uint64(6));
    }

    #[test]
    fn test_derivative_function() {
        let mut engine = ScriptEngine::new();
        let input = ScriptInput::new(Some(Value::Double(10.0)), 2.0);
        let result = engine
            .run("derivative(value)", &Value::Double(20.0), input)
            .unwrap();
        assert_eq!(result, Value::Double(5.0));
    }

    #[test]
    fn test_derivative_without_history() {
        let mut engine = ScriptEngine::new();
        let result = engine
            .run("derivative(value)", &Value::Double(20.0), ScriptInput::first_run())
            .unwrap();
        assert_eq!(result, Value::Double(0.0));
    }

    #[test]
    fn test_runtime_error() {
        let mut engine = ScriptEngine::new();
        let err = engine
            .run("throw \"bad input\"", &Value::from("x"), ScriptInput::first_run())
            .unwrap_err();
        assert!(err.to_string().contains("bad input"));
    }

    #[test]
    fn test_operation_limit() {
        let mut engine = ScriptEngine::new();
        assert!(engine
            .run("loop { }", &Value::None, ScriptInput::first_run())
            .is_err());
    }

    #[test]
    fn test_validation() {
        let engine = ScriptEngine::new();
        assert!(engine.validate("value * 2").is_ok());
        assert!(engine.validate("value * ").is_err());
    }

    #[test]
    fn test_caching() {
        let mut engine = ScriptEngine::new();
        engine.compile("value").unwrap();
        engine.compile("value").unwrap();
        assert_eq!(engine.cached_scripts(), 1);
    }
}

//! Rhai Scripting Engine for script preprocessing steps
//!
//! Script steps run user code against the current value. Every worker owns
//! its own [`ScriptEngine`]; engines are never shared between threads.
//!
//! ## Script Environment
//!
//! - `value` - The current value (string, integer, float or `()` for an empty value)
//! - `prev()` - The input value seen by this step on the previous run (`()` if none)
//! - `has_prev()` - Returns true if a previous value is available
//! - `dt()` - Seconds elapsed since the previous value (0.0 if none)
//! - `derivative(value)` - Rate of change against `prev()` over `dt()`
//!
//! A script either evaluates to its result, or defines `fn convert(value)`,
//! which is then called instead.
//!
//! ## Example Scripts
//!
//! Converting a Fahrenheit reading to Celsius:
//! ```rhai
//! (parse_float(value) - 32.0) * 5.0 / 9.0
//! ```
//!
//! Reporting the change since the previous value:
//! ```rhai
//! fn convert(value) {
//!     let v = parse_float(value);
//!     if has_prev() { v - parse_float(prev()) } else { () }
//! }
//! ```

mod engine;

pub use engine::{ScriptContext, ScriptEngine, ScriptInput, SharedScriptContext};

use crate::error::{PreprocError, Result};
use rhai::{Engine, AST};
use std::collections::HashMap;

/// Number of compiled scripts kept per engine before the cache is flushed
pub const MAX_CACHED_SCRIPTS: usize = 1024;

/// A compiled script that can be executed efficiently
#[derive(Clone)]
pub struct CompiledScript {
    /// The compiled AST
    ast: AST,
    /// The original source code
    source: String,
    /// Whether the script defines `convert(value)`
    has_convert: bool,
}

impl CompiledScript {
    /// Get the source code of this script
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn has_convert(&self) -> bool {
        self.has_convert
    }
}

impl std::fmt::Debug for CompiledScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledScript")
            .field("source", &self.source)
            .field("has_convert", &self.has_convert)
            .finish()
    }
}

/// Cache for compiled scripts to avoid recompilation
#[derive(Default)]
pub struct ScriptCache {
    /// Map from script source to compiled script
    cache: HashMap<String, CompiledScript>,
}

impl ScriptCache {
    /// Create a new empty cache
    pub fn new() -> Self {
        Self {
            cache: HashMap::new(),
        }
    }

    /// Get a cached script or compile and cache it
    pub fn get_or_compile(&mut self, engine: &Engine, source: &str) -> Result<CompiledScript> {
        if let Some(script) = self.cache.get(source) {
            return Ok(script.clone());
        }

        let ast = engine
            .compile(source)
            .map_err(|e| PreprocError::Script(format!("Compilation error: {}", e)))?;

        let has_convert = ast
            .iter_functions()
            .any(|f| f.name == "convert" && f.params.len() == 1);

        let script = CompiledScript {
            ast,
            source: source.to_string(),
            has_convert,
        };

        if self.cache.len() >= MAX_CACHED_SCRIPTS {
            self.cache.clear();
        }
        self.cache.insert(source.to_string(), script.clone());
        Ok(script)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Clear the cache
    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

//! Core data types for the preprocessing engine
//!
//! This module contains the value representation shared by every stage of
//! the pipeline:
//!
//! - [`Value`]: the tagged value flowing through preprocessing steps
//! - [`ValueType`]: the declared value type of a monitored item
//! - [`ValueOpt`]: optional metadata travelling alongside a value (log records, file offsets)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp attached to every value and history entry
pub type Timestamp = DateTime<Utc>;

/// A value moving through the preprocessing pipeline.
///
/// `None` marks the absence of a value (discarded or throttled), `Error`
/// carries a failure message in place of a value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    None,
    Uint64(u64),
    Double(f64),
    Str(String),
    Error(String),
}

impl Value {
    /// Short name of the variant, used in step error messages
    pub fn type_desc(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Uint64(_) => "uint64",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::Error(_) => "error",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    /// Take the value out, leaving `Value::None` in its place
    pub fn take(&mut self) -> Value {
        std::mem::take(self)
    }

    /// Numeric view of the value, if it already holds a number
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Uint64(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Convert to a string value.
    ///
    /// Numbers are rendered in their shortest round-trip form. `None` and
    /// `Error` cannot be converted.
    pub fn to_str(&self) -> Result<String, String> {
        match self {
            Value::Str(s) => Ok(s.clone()),
            Value::Uint64(v) => Ok(v.to_string()),
            Value::Double(v) => Ok(format_double(*v)),
            Value::None | Value::Error(_) => Err(format!(
                "cannot convert value of type \"{}\" to string",
                self.type_desc()
            )),
        }
    }

    /// Consuming variant of [`Value::to_str`]
    pub fn into_str(self) -> Result<String, String> {
        match self {
            Value::Str(s) => Ok(s),
            other => other.to_str(),
        }
    }

    /// Convert to a numeric value for arithmetic steps.
    ///
    /// Strings become `Uint64` when they parse as an unsigned integer and
    /// `Double` otherwise. Items of float type always yield `Double`.
    pub fn to_numeric(&self, value_type: ValueType) -> Result<Value, String> {
        let numeric = match self {
            Value::Uint64(_) | Value::Double(_) => self.clone(),
            Value::Str(s) => parse_numeric(s)
                .ok_or_else(|| "cannot convert value to numeric type".to_string())?,
            _ => return Err("cannot convert value to numeric type".to_string()),
        };

        match (value_type, numeric) {
            (ValueType::Float, Value::Uint64(v)) => Ok(Value::Double(v as f64)),
            (_, numeric) => Ok(numeric),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => Ok(()),
            Value::Uint64(v) => write!(f, "{}", v),
            Value::Double(v) => f.write_str(&format_double(*v)),
            Value::Str(s) | Value::Error(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

/// Render a double without a trailing `.0` for integral values
pub fn format_double(v: f64) -> String {
    format!("{}", v)
}

/// Parse an unsigned integer, tolerating surrounding whitespace
pub fn parse_uint64(s: &str) -> Option<u64> {
    s.trim().parse::<u64>().ok()
}

/// Parse a finite double, tolerating surrounding whitespace
pub fn parse_double(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    // "inf"/"nan" parse in Rust but are not accepted as item values
    if trimmed.is_empty() || trimmed.chars().any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E')
    {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_numeric(s: &str) -> Option<Value> {
    parse_uint64(s)
        .map(Value::Uint64)
        .or_else(|| parse_double(s).map(Value::Double))
}

/// Declared value type of a monitored item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Float,
    #[default]
    Str,
    Log,
    Uint64,
    Text,
}

impl ValueType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, ValueType::Float | ValueType::Uint64)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Float => "float",
            ValueType::Str => "str",
            ValueType::Log => "log",
            ValueType::Uint64 => "uint64",
            ValueType::Text => "text",
        };
        f.write_str(name)
    }
}

/// File offset metadata of log and file monitoring items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValueMeta {
    pub lastlogsize: u64,
    pub mtime: i32,
}

/// Event log attributes of a log value
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: i32,
    pub severity: i32,
    pub logeventid: i32,
    pub source: Option<String>,
}

/// Optional data passed through preprocessing untouched and handed to the sink
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValueOpt {
    pub meta: Option<ValueMeta>,
    pub log: Option<LogRecord>,
}

impl ValueOpt {
    pub fn has_meta(&self) -> bool {
        self.meta.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_desc() {
        assert_eq!(Value::None.type_desc(), "none");
        assert_eq!(Value::Uint64(1).type_desc(), "uint64");
        assert_eq!(Value::Double(1.5).type_desc(), "double");
        assert_eq!(Value::from("x").type_desc(), "string");
        assert_eq!(Value::Error("e".into()).type_desc(), "error");
    }

    #[test]
    fn test_to_str() {
        assert_eq!(Value::Uint64(42).to_str().unwrap(), "42");
        assert_eq!(Value::Double(20.0).to_str().unwrap(), "20");
        assert_eq!(Value::Double(0.5).to_str().unwrap(), "0.5");
        assert!(Value::None.to_str().is_err());
        assert!(Value::Error("boom".into()).to_str().is_err());
    }

    #[test]
    fn test_to_numeric_prefers_uint64() {
        assert_eq!(
            Value::from(" 10 ").to_numeric(ValueType::Uint64).unwrap(),
            Value::Uint64(10)
        );
        assert_eq!(
            Value::from("1.5").to_numeric(ValueType::Uint64).unwrap(),
            Value::Double(1.5)
        );
        assert_eq!(
            Value::from("-3").to_numeric(ValueType::Str).unwrap(),
            Value::Double(-3.0)
        );
    }

    #[test]
    fn test_to_numeric_float_items() {
        assert_eq!(
            Value::from("10").to_numeric(ValueType::Float).unwrap(),
            Value::Double(10.0)
        );
    }

    #[test]
    fn test_to_numeric_rejects_text() {
        assert!(Value::from("abc").to_numeric(ValueType::Float).is_err());
        assert!(Value::from("inf").to_numeric(ValueType::Float).is_err());
        assert!(Value::from("").to_numeric(ValueType::Float).is_err());
        assert!(Value::None.to_numeric(ValueType::Float).is_err());
    }

    #[test]
    fn test_parse_double_exponent() {
        assert_eq!(parse_double("1e3"), Some(1000.0));
        assert_eq!(parse_double("NaN"), None);
    }

    #[test]
    fn test_take_leaves_none() {
        let mut v = Value::from("x");
        let taken = v.take();
        assert!(v.is_none());
        assert_eq!(taken, Value::from("x"));
    }

    #[test]
    fn test_value_type_serde() {
        let t: ValueType = serde_json::from_str("\"uint64\"").unwrap();
        assert_eq!(t, ValueType::Uint64);
        assert_eq!(ValueType::Float.to_string(), "float");
    }
}

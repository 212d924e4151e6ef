//! Composite failure message built from per-step results

use crate::preprocessor::execute::StepResult;
use crate::preprocessor::step::StepAction;
use crate::types::Value;
use std::fmt::Write;

/// Characters of the input value quoted in the message
pub const VALUE_PREVIEW_LEN: usize = 100;

/// Truncated rendering of a value for error messages
pub fn preview(value: &Value) -> String {
    let text = match value {
        Value::Str(s) | Value::Error(s) => s.as_str(),
        other => return other.to_string(),
    };

    let mut chars = text.char_indices();
    match chars.nth(VALUE_PREVIEW_LEN) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

/// Build the error reported when a chain ends in failure.
///
/// ```text
/// Preprocessing failed for: <input preview>
/// 1. Result: <value>
/// 2. Failed: <error>
/// ```
pub fn format_error(input_preview: &str, results: &[StepResult]) -> String {
    let mut out = format!("Preprocessing failed for: {}", input_preview);

    for (i, result) in results.iter().enumerate() {
        let _ = write!(out, "\n{}. ", i + 1);

        match &result.error {
            Some(err) => {
                let _ = write!(out, "Failed: {}", err);
                match result.action {
                    StepAction::DiscardValue => out.push_str(" (discard value)"),
                    StepAction::SetValue => {
                        let _ = write!(out, " (set value to \"{}\")", result.value);
                    }
                    StepAction::SetError => {
                        let _ = write!(out, " (set error to \"{}\")", result.value);
                    }
                    _ => {}
                }
            }
            None if result.value.is_none() => out.push_str("Result: <empty>"),
            None => {
                let _ = write!(out, "Result: {}", preview(&result.value));
            }
        }
    }

    out
}

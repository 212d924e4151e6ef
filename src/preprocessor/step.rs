//! Preprocessing step definitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a preprocessing step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Multiplier,
    Rtrim,
    Ltrim,
    Trim,
    Regsub,
    Bool2dec,
    Oct2dec,
    Hex2dec,
    DeltaValue,
    DeltaSpeed,
    Xpath,
    Jsonpath,
    ValidateRange,
    ValidateRegex,
    ValidateNotRegex,
    ValidateNotSupported,
    ErrorFieldJson,
    ErrorFieldXml,
    ErrorFieldRegex,
    ThrottleValue,
    ThrottleTimedValue,
    Script,
    PrometheusPattern,
    PrometheusToJson,
    CsvToJson,
    XmlToJson,
    StrReplace,
}

impl StepType {
    /// Steps that keep state between executions
    pub fn has_history(&self) -> bool {
        matches!(
            self,
            StepType::DeltaValue
                | StepType::DeltaSpeed
                | StepType::ThrottleValue
                | StepType::ThrottleTimedValue
                | StepType::Script
        )
    }

    /// Steps that can reuse a decoded tree held by the preprocessing cache
    pub fn uses_cache(&self) -> bool {
        matches!(self, StepType::Jsonpath | StepType::PrometheusPattern)
    }

    pub fn name(&self) -> &'static str {
        match self {
            StepType::Multiplier => "multiplier",
            StepType::Rtrim => "rtrim",
            StepType::Ltrim => "ltrim",
            StepType::Trim => "trim",
            StepType::Regsub => "regsub",
            StepType::Bool2dec => "bool2dec",
            StepType::Oct2dec => "oct2dec",
            StepType::Hex2dec => "hex2dec",
            StepType::DeltaValue => "delta_value",
            StepType::DeltaSpeed => "delta_speed",
            StepType::Xpath => "xpath",
            StepType::Jsonpath => "jsonpath",
            StepType::ValidateRange => "validate_range",
            StepType::ValidateRegex => "validate_regex",
            StepType::ValidateNotRegex => "validate_not_regex",
            StepType::ValidateNotSupported => "validate_not_supported",
            StepType::ErrorFieldJson => "error_field_json",
            StepType::ErrorFieldXml => "error_field_xml",
            StepType::ErrorFieldRegex => "error_field_regex",
            StepType::ThrottleValue => "throttle_value",
            StepType::ThrottleTimedValue => "throttle_timed_value",
            StepType::Script => "script",
            StepType::PrometheusPattern => "prometheus_pattern",
            StepType::PrometheusToJson => "prometheus_to_json",
            StepType::CsvToJson => "csv_to_json",
            StepType::XmlToJson => "xml_to_json",
            StepType::StrReplace => "str_replace",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What to do when a step fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandler {
    /// Keep the error; it becomes part of the composite failure message
    #[default]
    Default,
    /// Drop the value
    DiscardValue,
    /// Replace the value with `error_handler_params`
    SetValue,
    /// Replace the error message with `error_handler_params`
    SetError,
}

/// Action recorded for an executed step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    Default,
    DiscardValue,
    SetValue,
    SetError,
    /// The step succeeded but left an error value behind
    ForceError,
}

impl From<ErrorHandler> for StepAction {
    fn from(handler: ErrorHandler) -> Self {
        match handler {
            ErrorHandler::Default => StepAction::Default,
            ErrorHandler::DiscardValue => StepAction::DiscardValue,
            ErrorHandler::SetValue => StepAction::SetValue,
            ErrorHandler::SetError => StepAction::SetError,
        }
    }
}

/// A single preprocessing step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub params: String,
    #[serde(default)]
    pub error_handler: ErrorHandler,
    #[serde(default)]
    pub error_handler_params: String,
}

impl Step {
    pub fn new(step_type: StepType, params: impl Into<String>) -> Self {
        Self {
            step_type,
            params: params.into(),
            error_handler: ErrorHandler::Default,
            error_handler_params: String::new(),
        }
    }

    /// Builder method to set the failure policy
    pub fn on_fail(mut self, handler: ErrorHandler, params: impl Into<String>) -> Self {
        self.error_handler = handler;
        self.error_handler_params = params.into();
        self
    }
}

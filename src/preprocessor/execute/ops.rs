//! Step handlers
//!
//! Every handler takes the current value by value and returns the new one.
//! `Err` is a step failure and is subject to the step's error handler.
//! `Ok(Value::Error(_))` is a step that succeeded in producing an error
//! (the error-field checks), which bypasses the error handler.

use crate::codec::{csv, json, xml, PrometheusData};
use crate::preprocessor::cache::PreprocCache;
use crate::preprocessor::execute::ExecutionContext;
use crate::preprocessor::step::{Step, StepType};
use crate::scripting::ScriptInput;
use crate::types::{parse_double, parse_uint64, Timestamp, Value, ValueType};
use regex::{Captures, Regex};

/// Value remembered by a history-bearing step
pub type HistorySlot = Option<(Value, Timestamp)>;

const WHITESPACE: &str = " \t\r\n";

#[allow(clippy::too_many_arguments)]
pub(crate) fn execute_step(
    ctx: &mut ExecutionContext,
    cache: Option<&PreprocCache>,
    value_type: ValueType,
    value: Value,
    ts: Timestamp,
    step: &Step,
    history: &mut HistorySlot,
) -> Result<Value, String> {
    let params = step.params.as_str();
    let cache = cache.filter(|c| c.serves(step.step_type));

    match step.step_type {
        StepType::Multiplier => multiply(value_type, value, params),
        StepType::Rtrim | StepType::Ltrim | StepType::Trim => trim(step.step_type, value, params),
        StepType::Regsub => regsub(value, params),
        StepType::Bool2dec | StepType::Oct2dec | StepType::Hex2dec => {
            to_decimal(step.step_type, value)
        }
        StepType::DeltaValue | StepType::DeltaSpeed => {
            delta(step.step_type, value_type, value, ts, history)
        }
        StepType::Xpath => xpath(value, params),
        StepType::Jsonpath => jsonpath(cache, value, params),
        StepType::ValidateRange => validate_range(value_type, value, params),
        StepType::ValidateRegex => validate_regex(value, params, true),
        StepType::ValidateNotRegex => validate_regex(value, params, false),
        StepType::ValidateNotSupported => match value {
            Value::Error(e) => Err(e),
            other => Ok(other),
        },
        StepType::ErrorFieldJson => error_from_json(value, params),
        StepType::ErrorFieldXml => error_from_xml(value, params),
        StepType::ErrorFieldRegex => error_from_regex(value, params),
        StepType::ThrottleValue => throttle_value(value, ts, history),
        StepType::ThrottleTimedValue => throttle_timed_value(value, ts, params, history),
        StepType::Script => script(ctx, value, ts, params, history),
        StepType::PrometheusPattern => prometheus_pattern(cache, value, params),
        StepType::PrometheusToJson => prometheus_to_json(value, params),
        StepType::CsvToJson => csv_to_json(value, params),
        StepType::XmlToJson => {
            xml_to_json(value).map_err(|e| format!("cannot convert XML to JSON: {}", e))
        }
        StepType::StrReplace => str_replace(value, params),
    }
}

fn multiply(value_type: ValueType, value: Value, params: &str) -> Result<Value, String> {
    let factor = params.trim();
    let Some(factor_dbl) = parse_double(factor) else {
        return Err("a numerical value is expected or the value is out of range".to_string());
    };

    let wrap = |value: &Value, e: String| {
        format!(
            "cannot apply multiplier \"{}\" to value of type \"{}\": {}",
            params,
            value.type_desc(),
            e
        )
    };

    let result = match value.to_numeric(value_type) {
        Ok(Value::Uint64(v)) => match parse_uint64(factor).and_then(|m| v.checked_mul(m)) {
            Some(product) => Value::Uint64(product),
            None => Value::Double(v as f64 * factor_dbl),
        },
        Ok(Value::Double(v)) => Value::Double(v * factor_dbl),
        Ok(_) => return Err(wrap(&value, "cannot convert value to numeric type".to_string())),
        Err(e) => return Err(wrap(&value, e)),
    };

    if let Value::Double(v) = result {
        if !v.is_finite() {
            return Err(wrap(&value, "value is out of range".to_string()));
        }
    }

    Ok(result)
}

fn trim(step_type: StepType, value: Value, params: &str) -> Result<Value, String> {
    let type_desc = value.type_desc();
    let text = value.into_str().map_err(|e| {
        let kind = match step_type {
            StepType::Rtrim => "right ",
            StepType::Ltrim => "left ",
            _ => "",
        };
        format!(
            "cannot perform {}trim of \"{}\" for value of type \"{}\": {}",
            kind,
            params.escape_default(),
            type_desc,
            e
        )
    })?;

    let chars = if params.is_empty() { WHITESPACE } else { params };
    let is_trimmed = |c: char| chars.contains(c);

    let trimmed = match step_type {
        StepType::Rtrim => text.trim_end_matches(is_trimmed),
        StepType::Ltrim => text.trim_start_matches(is_trimmed),
        _ => text.trim_matches(is_trimmed),
    };

    Ok(Value::Str(trimmed.to_string()))
}

fn compile_regex(pattern: &str) -> Result<Regex, String> {
    Regex::new(pattern).map_err(|e| format!("invalid regular expression \"{}\": {}", pattern, e))
}

/// Expand `\0`..`\9` group references in `template`
fn substitute(template: &str, caps: &Captures) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(group) = chars.peek().and_then(|d| d.to_digit(10)) {
                chars.next();
                if let Some(m) = caps.get(group as usize) {
                    out.push_str(m.as_str());
                }
                continue;
            }
        }
        out.push(c);
    }

    out
}

fn regsub(value: Value, params: &str) -> Result<Value, String> {
    let (pattern, output) = params.split_once('\n').unwrap_or((params, ""));
    let type_desc = value.type_desc();
    let wrap = |e: String| {
        format!(
            "cannot perform regular expression \"{}\" match for value of type \"{}\": {}",
            pattern, type_desc, e
        )
    };

    let text = value.into_str().map_err(wrap)?;
    let re = compile_regex(pattern).map_err(wrap)?;
    let caps = re
        .captures(&text)
        .ok_or_else(|| wrap("pattern does not match".to_string()))?;

    Ok(Value::Str(substitute(output, &caps)))
}

fn parse_boolean(text: &str) -> Option<u64> {
    if let Some(v) = parse_double(text) {
        return Some(u64::from(v != 0.0));
    }
    match text.to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "on" | "up" | "running" | "enabled" | "available" | "ok"
        | "master" => Some(1),
        "false" | "f" | "no" | "n" | "off" | "down" | "unused" | "disabled" | "unavailable"
        | "err" | "slave" => Some(0),
        _ => None,
    }
}

fn to_decimal(step_type: StepType, value: Value) -> Result<Value, String> {
    let desc = value.to_string();
    let kind = match step_type {
        StepType::Bool2dec => "boolean",
        StepType::Oct2dec => "octal",
        _ => "hexadecimal",
    };
    let wrap = |e: &str| {
        format!(
            "cannot convert value \"{}\" from {} to decimal format: {}",
            desc, kind, e
        )
    };

    let text = value.into_str().map_err(|e| wrap(&e))?;
    let text = text.trim();

    let parsed = match step_type {
        StepType::Bool2dec => parse_boolean(text),
        StepType::Oct2dec => u64::from_str_radix(text, 8).ok(),
        _ => {
            let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
            let digits = digits
                .strip_prefix("0x")
                .or_else(|| digits.strip_prefix("0X"))
                .unwrap_or(&digits);
            u64::from_str_radix(digits, 16).ok()
        }
    };

    parsed
        .map(Value::Uint64)
        .ok_or_else(|| wrap("invalid value format"))
}

fn delta(
    step_type: StepType,
    value_type: ValueType,
    value: Value,
    ts: Timestamp,
    history: &mut HistorySlot,
) -> Result<Value, String> {
    let kind = if step_type == StepType::DeltaSpeed {
        "speed per second"
    } else {
        "simple change"
    };
    let current = value.to_numeric(value_type).map_err(|e| {
        format!(
            "cannot calculate delta ({}) for value of type \"{}\": {}",
            kind,
            value.type_desc(),
            e
        )
    })?;

    let previous = history.replace((current.clone(), ts));
    let Some((prev, prev_ts)) = previous else {
        return Ok(Value::None);
    };

    // counter reset
    if compare_numeric(&current, &prev) == Some(std::cmp::Ordering::Less) {
        return Ok(Value::None);
    }

    let diff = match (&current, &prev) {
        (Value::Uint64(c), Value::Uint64(p)) => Value::Uint64(c - p),
        _ => Value::Double(current.as_f64().unwrap_or(0.0) - prev.as_f64().unwrap_or(0.0)),
    };

    if step_type == StepType::DeltaValue {
        return Ok(diff);
    }

    let elapsed = (ts - prev_ts).num_nanoseconds().unwrap_or(i64::MAX) as f64 / 1e9;
    if elapsed < 0.0 {
        return Ok(Value::None);
    }
    if elapsed == 0.0 {
        return Err(format!(
            "cannot calculate delta ({}) for value of type \"{}\": time interval between values is zero",
            kind,
            value.type_desc()
        ));
    }

    let speed = diff.as_f64().unwrap_or(0.0) / elapsed;
    Ok(match value_type {
        ValueType::Uint64 => Value::Uint64(speed as u64),
        _ => Value::Double(speed),
    })
}

fn compare_numeric(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Uint64(x), Value::Uint64(y)) => Some(x.cmp(y)),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

fn xpath(value: Value, params: &str) -> Result<Value, String> {
    let text = value.into_str()?;
    xml::query(&text, params)
        .map(Value::Str)
        .map_err(|e| format!("cannot extract XML value with xpath \"{}\": {}", params, e))
}

fn jsonpath(cache: Option<&PreprocCache>, value: Value, params: &str) -> Result<Value, String> {
    let wrap = |e: String| format!("cannot extract value from json by path \"{}\": {}", params, e);

    let found = match cache {
        Some(cache) => json::query(cache.json().map_err(wrap)?, params),
        None => {
            let text = value.into_str().map_err(wrap)?;
            json::query(&json::parse(&text).map_err(wrap)?, params)
        }
    };

    match found.map_err(wrap)? {
        Some(data) => Ok(Value::Str(data)),
        None => Err(wrap("no data matches the specified path".to_string())),
    }
}

fn validate_range(value_type: ValueType, value: Value, params: &str) -> Result<Value, String> {
    let (min, max) = params.split_once('\n').unwrap_or((params, ""));
    let (min, max) = (min.trim(), max.trim());

    let bound = |text: &str, what: &str| -> Result<Option<f64>, String> {
        if text.is_empty() {
            return Ok(None);
        }
        parse_double(text)
            .map(Some)
            .ok_or_else(|| format!("{} value \"{}\" is not a number", what, text))
    };
    let low = bound(min, "minimum")?;
    let high = bound(max, "maximum")?;

    let numeric = value.to_numeric(value_type)?;
    let v = numeric.as_f64().unwrap_or(f64::NAN);

    let below = low.is_some_and(|low| v < low);
    let above = high.is_some_and(|high| v > high);
    if !(below || above) {
        return Ok(value);
    }

    Err(match (low.is_some(), high.is_some()) {
        (true, true) => format!("value must be between {} and {}", min, max),
        (true, false) => format!("value must be greater than or equal to {}", min),
        _ => format!("value must be less than or equal to {}", max),
    })
}

fn validate_regex(value: Value, params: &str, must_match: bool) -> Result<Value, String> {
    let text = value.to_str()?;
    let re = compile_regex(params)?;

    match (re.is_match(&text), must_match) {
        (true, true) | (false, false) => Ok(value),
        (false, true) => Err(format!(
            "value does not match regular expression \"{}\"",
            params
        )),
        (true, false) => Err(format!("value matches regular expression \"{}\"", params)),
    }
}

fn error_from_json(value: Value, params: &str) -> Result<Value, String> {
    let Ok(text) = value.to_str() else {
        return Ok(value);
    };
    let Ok(doc) = json::parse(&text) else {
        return Ok(value);
    };

    match json::query(&doc, params)? {
        Some(message) if !message.is_empty() => Ok(Value::Error(message)),
        _ => Ok(value),
    }
}

fn error_from_xml(value: Value, params: &str) -> Result<Value, String> {
    let Ok(text) = value.to_str() else {
        return Ok(value);
    };

    match xml::query(&text, params) {
        Ok(message) if !message.is_empty() => Ok(Value::Error(message)),
        _ => Ok(value),
    }
}

fn error_from_regex(value: Value, params: &str) -> Result<Value, String> {
    let (pattern, output) = params.split_once('\n').unwrap_or((params, ""));
    let text = value.to_str()?;
    let re = compile_regex(pattern)?;

    match re.captures(&text) {
        Some(caps) => Ok(Value::Error(substitute(output, &caps))),
        None => Ok(value),
    }
}

fn throttle_value(value: Value, ts: Timestamp, history: &mut HistorySlot) -> Result<Value, String> {
    if let Some((prev, _)) = history {
        if *prev == value {
            return Ok(Value::None);
        }
    }

    *history = Some((value.clone(), ts));
    Ok(value)
}

/// Parse a period in seconds with an optional s/m/h/d/w suffix
pub(crate) fn parse_period(text: &str) -> Option<i64> {
    let text = text.trim();
    let (digits, multiplier) = match text.chars().last()? {
        's' => (&text[..text.len() - 1], 1),
        'm' => (&text[..text.len() - 1], 60),
        'h' => (&text[..text.len() - 1], 3_600),
        'd' => (&text[..text.len() - 1], 86_400),
        'w' => (&text[..text.len() - 1], 604_800),
        _ => (text, 1),
    };
    digits.parse::<i64>().ok()?.checked_mul(multiplier)
}

fn throttle_timed_value(
    value: Value,
    ts: Timestamp,
    params: &str,
    history: &mut HistorySlot,
) -> Result<Value, String> {
    let period = parse_period(params)
        .filter(|p| *p > 0)
        .ok_or_else(|| format!("invalid throttling period \"{}\"", params))?;

    if let Some((prev, prev_ts)) = history {
        if *prev == value && (ts - *prev_ts).num_seconds() < period {
            return Ok(Value::None);
        }
    }

    *history = Some((value.clone(), ts));
    Ok(value)
}

fn script(
    ctx: &mut ExecutionContext,
    value: Value,
    ts: Timestamp,
    params: &str,
    history: &mut HistorySlot,
) -> Result<Value, String> {
    let input = match history.take() {
        Some((prev, prev_ts)) => {
            let dt = (ts - prev_ts).num_milliseconds() as f64 / 1000.0;
            ScriptInput::new(Some(prev), dt)
        }
        None => ScriptInput::first_run(),
    };

    let result = ctx
        .script_engine()
        .run(params, &value, input)
        .map_err(|e| e.to_string())?;

    *history = Some((value, ts));
    Ok(result)
}

fn prometheus_pattern(
    cache: Option<&PreprocCache>,
    value: Value,
    params: &str,
) -> Result<Value, String> {
    let (pattern, rest) = params
        .split_once('\n')
        .ok_or_else(|| "cannot find second parameter".to_string())?;
    let (request, output) = rest
        .split_once('\n')
        .ok_or_else(|| "cannot find third parameter".to_string())?;

    let wrap = |e: String| format!("cannot apply Prometheus pattern: {}", e);

    let result = match cache {
        Some(cache) => cache.prometheus().map_err(wrap)?.query(pattern, request, output),
        None => {
            let text = value.into_str()?;
            PrometheusData::parse(&text)
                .map_err(wrap)?
                .query(pattern, request, output)
        }
    };

    result.map(Value::Str).map_err(wrap)
}

fn prometheus_to_json(value: Value, params: &str) -> Result<Value, String> {
    let text = value.into_str()?;
    PrometheusData::parse(&text)
        .and_then(|data| data.to_json(params))
        .map(Value::Str)
        .map_err(|e| format!("cannot convert Prometheus data to JSON: {}", e))
}

fn csv_to_json(value: Value, params: &str) -> Result<Value, String> {
    let mut parts = params.split('\n');
    let delimiter = parts.next().unwrap_or(",");
    let quote = parts.next().unwrap_or("\"");
    let with_header = parts.next().map_or(true, |h| h.trim() == "1");

    let text = value.into_str()?;
    csv::to_json(&text, delimiter, quote, with_header)
        .map(Value::Str)
        .map_err(|e| format!("cannot convert CSV to JSON: {}", e))
}

fn xml_to_json(value: Value) -> Result<Value, String> {
    let text = value.into_str()?;
    xml::to_json(&text).map(Value::Str)
}

/// Unescape `\n`, `\r`, `\t`, `\s` (space) and `\\`
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }

    out
}

fn str_replace(value: Value, params: &str) -> Result<Value, String> {
    let (search, replace) = params.split_once('\n').unwrap_or((params, ""));
    let search = unescape(search);
    if search.is_empty() {
        return Err("cannot replace an empty string".to_string());
    }

    let text = value.into_str()?;
    Ok(Value::Str(text.replace(&search, &unescape(replace))))
}

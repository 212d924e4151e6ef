//! Prometheus exposition format
//!
//! [`PrometheusData`] is the parsed form of a scrape payload. It is what the
//! preprocessing cache keeps for Prometheus pattern steps, so parsing happens
//! once per payload no matter how many dependent items query it.
//!
//! Pattern syntax: `metric_name{label="value",other=~"regex"} == 1`, where the
//! metric name, the label block and the value filter are each optional.
//! Label operators are `=`, `!=`, `=~` and `!~`.

use crate::types::format_double;
use regex::Regex;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;

/// A single sample line
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
    /// Value as written in the payload
    pub raw_value: String,
    pub line: String,
}

impl Sample {
    /// Label lookup; `__name__` resolves to the metric name
    pub fn label(&self, name: &str) -> Option<&str> {
        if name == "__name__" {
            return Some(&self.name);
        }
        self.labels
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Parsed exposition payload
#[derive(Debug, Clone, Default)]
pub struct PrometheusData {
    samples: Vec<Sample>,
    help: HashMap<String, String>,
    types: HashMap<String, String>,
}

impl PrometheusData {
    /// Parse an exposition payload
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut data = Self::default();

        for (n, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(comment) = line.strip_prefix('#') {
                data.parse_comment(comment.trim_start());
                continue;
            }
            let sample =
                parse_sample(line).map_err(|e| format!("cannot parse line {}: {}", n + 1, e))?;
            data.samples.push(sample);
        }

        Ok(data)
    }

    fn parse_comment(&mut self, comment: &str) {
        let mut parts = comment.splitn(3, char::is_whitespace);
        let kind = parts.next();
        let name = parts.next();
        let rest = parts.next().unwrap_or("").trim().to_string();

        match (kind, name) {
            (Some("HELP"), Some(name)) => {
                self.help.insert(name.to_string(), rest);
            }
            (Some("TYPE"), Some(name)) => {
                self.types.insert(name.to_string(), rest);
            }
            _ => {}
        }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Extract data from the samples matching `pattern`.
    ///
    /// `request` is `value` (the single matching sample's value), `label`
    /// (the value of label `output` of the single matching sample) or
    /// `function` (aggregate `output` over all matches: sum, min, max, avg
    /// or count).
    pub fn query(&self, pattern: &str, request: &str, output: &str) -> Result<String, String> {
        let pattern = Pattern::parse(pattern)?;
        let matches: Vec<&Sample> = self.samples.iter().filter(|s| pattern.matches(s)).collect();

        match request {
            "" | "value" => Ok(single(&matches)?.raw_value.clone()),
            "label" => {
                let sample = single(&matches)?;
                sample.label(output).map(str::to_string).ok_or_else(|| {
                    format!("label \"{}\" is not present in the matching metric", output)
                })
            }
            "function" => aggregate(output, &matches),
            other => Err(format!("unknown request \"{}\"", other)),
        }
    }

    /// Render the samples matching `pattern` as a JSON array.
    /// An empty pattern selects every sample.
    pub fn to_json(&self, pattern: &str) -> Result<String, String> {
        let pattern = if pattern.trim().is_empty() {
            None
        } else {
            Some(Pattern::parse(pattern)?)
        };

        let rows: Vec<JsonValue> = self
            .samples
            .iter()
            .filter(|s| pattern.as_ref().map_or(true, |p| p.matches(s)))
            .map(|s| self.sample_to_json(s))
            .collect();

        serde_json::to_string(&rows).map_err(|e| format!("cannot serialize JSON: {}", e))
    }

    fn sample_to_json(&self, sample: &Sample) -> JsonValue {
        let mut obj = Map::new();
        obj.insert("name".into(), JsonValue::String(sample.name.clone()));
        obj.insert("value".into(), JsonValue::String(sample.raw_value.clone()));
        obj.insert("line".into(), JsonValue::String(sample.line.clone()));

        if !sample.labels.is_empty() {
            let labels = sample
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
                .collect();
            obj.insert("labels".into(), JsonValue::Object(labels));
        }
        if let Some(t) = family_lookup(&self.types, &sample.name) {
            obj.insert("type".into(), JsonValue::String(t.clone()));
        }
        if let Some(h) = family_lookup(&self.help, &sample.name) {
            obj.insert("help".into(), JsonValue::String(h.clone()));
        }

        JsonValue::Object(obj)
    }
}

fn family_lookup<'a>(map: &'a HashMap<String, String>, name: &str) -> Option<&'a String> {
    map.get(name).or_else(|| {
        ["_bucket", "_count", "_sum", "_total", "_created"]
            .iter()
            .find_map(|suffix| name.strip_suffix(suffix).and_then(|family| map.get(family)))
    })
}

fn single<'a>(matches: &[&'a Sample]) -> Result<&'a Sample, String> {
    match matches {
        [] => Err("no data matches the specified pattern".to_string()),
        [sample] => Ok(sample),
        _ => Err("data extraction error: multiple metrics match the pattern".to_string()),
    }
}

fn aggregate(function: &str, matches: &[&Sample]) -> Result<String, String> {
    if function == "count" {
        return Ok(matches.len().to_string());
    }
    if matches.is_empty() {
        return Err("no data matches the specified pattern".to_string());
    }

    let values = matches.iter().map(|s| s.value);
    let result = match function {
        "sum" => values.sum(),
        "min" => values.fold(f64::INFINITY, f64::min),
        "max" => values.fold(f64::NEG_INFINITY, f64::max),
        "avg" => values.sum::<f64>() / matches.len() as f64,
        other => return Err(format!("unsupported function \"{}\"", other)),
    };

    Ok(format_double(result))
}

enum MatchOp {
    Equal(String),
    NotEqual(String),
    Regex(Regex),
    NotRegex(Regex),
}

struct LabelMatcher {
    name: String,
    op: MatchOp,
}

impl LabelMatcher {
    fn matches(&self, sample: &Sample) -> bool {
        let value = sample.label(&self.name).unwrap_or("");
        match &self.op {
            MatchOp::Equal(v) => value == v,
            MatchOp::NotEqual(v) => value != v,
            MatchOp::Regex(re) => re.is_match(value),
            MatchOp::NotRegex(re) => !re.is_match(value),
        }
    }
}

/// A parsed sample selector
pub struct Pattern {
    name: Option<String>,
    matchers: Vec<LabelMatcher>,
    value: Option<f64>,
}

impl Pattern {
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut cur = Cursor::new(text);
        cur.skip_ws();

        let name = cur.name();
        let mut matchers = Vec::new();

        cur.skip_ws();
        if cur.peek() == Some('{') {
            for (label, op, value) in cur.labels()? {
                let op = match op {
                    "=" => MatchOp::Equal(value),
                    "!=" => MatchOp::NotEqual(value),
                    "=~" => MatchOp::Regex(anchored(&value)?),
                    _ => MatchOp::NotRegex(anchored(&value)?),
                };
                matchers.push(LabelMatcher { name: label, op });
            }
        }

        cur.skip_ws();
        let value = if cur.eat_str("==") {
            cur.skip_ws();
            Some(parse_value(cur.take_token())?)
        } else {
            None
        };

        cur.skip_ws();
        if !cur.at_end() || (name.is_none() && matchers.is_empty()) {
            return Err(format!("invalid pattern \"{}\"", text));
        }

        Ok(Self {
            name,
            matchers,
            value,
        })
    }

    pub fn matches(&self, sample: &Sample) -> bool {
        if let Some(name) = &self.name {
            if &sample.name != name {
                return false;
            }
        }
        if let Some(v) = self.value {
            let equal = if v.is_nan() {
                sample.value.is_nan()
            } else {
                sample.value == v
            };
            if !equal {
                return false;
            }
        }
        self.matchers.iter().all(|m| m.matches(sample))
    }
}

fn anchored(re: &str) -> Result<Regex, String> {
    Regex::new(&format!("^(?:{})$", re))
        .map_err(|e| format!("invalid regular expression \"{}\": {}", re, e))
}

fn parse_sample(line: &str) -> Result<Sample, String> {
    let mut cur = Cursor::new(line);
    let name = cur.name().ok_or("metric name expected")?;

    let mut labels = Vec::new();
    if cur.peek() == Some('{') {
        for (label, op, value) in cur.labels()? {
            if op != "=" {
                return Err(format!("unexpected label operator \"{}\"", op));
            }
            labels.push((label, value));
        }
    }

    cur.skip_ws();
    let raw_value = cur.take_token().to_string();
    let value = parse_value(&raw_value)?;

    Ok(Sample {
        name,
        labels,
        value,
        raw_value,
        line: line.to_string(),
    })
}

fn parse_value(token: &str) -> Result<f64, String> {
    match token {
        "+Inf" | "Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        "NaN" | "nan" => Ok(f64::NAN),
        _ => token
            .parse::<f64>()
            .map_err(|_| format!("invalid metric value \"{}\"", token)),
    }
}

struct Cursor<'a> {
    s: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(s: &'a str) -> Self {
        Self { s, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.s[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.s.len()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn eat_str(&mut self, t: &str) -> bool {
        if self.rest().starts_with(t) {
            self.pos += t.len();
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn take_token(&mut self) -> &'a str {
        let rest = self.rest();
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        self.pos += end;
        &rest[..end]
    }

    fn name(&mut self) -> Option<String> {
        let rest = self.rest();
        let end = rest
            .char_indices()
            .find(|&(i, c)| {
                let valid = c == '_' || c == ':' || c.is_ascii_alphabetic();
                !(valid || (i > 0 && c.is_ascii_digit()))
            })
            .map_or(rest.len(), |(i, _)| i);

        if end == 0 {
            return None;
        }
        self.pos += end;
        Some(rest[..end].to_string())
    }

    fn quoted(&mut self) -> Result<String, String> {
        if !self.eat('"') {
            return Err("'\"' expected".to_string());
        }
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err("unterminated label value".to_string()),
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some(c) => out.push(c),
                    None => return Err("unterminated label value".to_string()),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn labels(&mut self) -> Result<Vec<(String, &'static str, String)>, String> {
        let mut labels = Vec::new();
        if !self.eat('{') {
            return Err("'{' expected".to_string());
        }

        loop {
            self.skip_ws();
            if self.eat('}') {
                break;
            }

            let name = self.name().ok_or("label name expected")?;
            self.skip_ws();
            let op = if self.eat_str("=~") {
                "=~"
            } else if self.eat_str("!=") {
                "!="
            } else if self.eat_str("!~") {
                "!~"
            } else if self.eat('=') {
                "="
            } else {
                return Err(format!("operator expected after label \"{}\"", name));
            };
            self.skip_ws();
            let value = self.quoted()?;
            labels.push((name, op, value));

            self.skip_ws();
            if self.eat(',') {
                continue;
            }
            if self.eat('}') {
                break;
            }
            return Err("',' or '}' expected".to_string());
        }

        Ok(labels)
    }
}

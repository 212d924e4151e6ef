//! Payload codecs used by extraction and conversion steps
//!
//! Each submodule wraps one payload format and reports failures as plain
//! messages, which the step interpreter turns into error values.
//!
//! - [`json`]: JSON parsing and JSONPath queries
//! - [`xml`]: XPath queries and XML to JSON conversion
//! - [`prometheus`]: Prometheus exposition format parsing, pattern queries and JSON output
//! - [`csv`]: CSV to JSON conversion

pub mod csv;
pub mod json;
pub mod prometheus;
pub mod xml;

pub use prometheus::PrometheusData;

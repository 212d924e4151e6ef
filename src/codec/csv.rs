//! CSV to JSON conversion

use serde_json::{Map, Value as JsonValue};

/// Convert CSV text to a JSON array of objects.
///
/// With a header row, object keys come from the header; otherwise columns
/// are keyed by their 1-based position. An empty `quote` disables quoting.
pub fn to_json(text: &str, delimiter: &str, quote: &str, with_header: bool) -> Result<String, String> {
    let delimiter = single_byte(delimiter, b',').ok_or("delimiter must be a single character")?;
    let quote_char = single_byte(quote, b'"').ok_or("quotation symbol must be a single character")?;

    let mut reader = ::csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .quote(quote_char)
        .quoting(!quote.is_empty())
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut header: Option<Vec<String>> = None;
    let mut rows = Vec::new();

    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| format!("cannot parse CSV line {}: {}", line + 1, e))?;

        if with_header && header.is_none() {
            header = Some(record.iter().map(str::to_string).collect());
            continue;
        }

        let mut row = Map::new();
        for (i, field) in record.iter().enumerate() {
            let key = header
                .as_ref()
                .and_then(|h| h.get(i).cloned())
                .unwrap_or_else(|| (i + 1).to_string());
            row.insert(key, JsonValue::String(field.to_string()));
        }
        rows.push(JsonValue::Object(row));
    }

    serde_json::to_string(&rows).map_err(|e| format!("cannot serialize JSON: {}", e))
}

fn single_byte(param: &str, default: u8) -> Option<u8> {
    match param.as_bytes() {
        [] => Some(default),
        [b] => Some(*b),
        _ => None,
    }
}

//! JSON parsing and JSONPath extraction

use serde_json::Value as JsonValue;
use serde_json_path::JsonPath;

/// Parse a JSON document
pub fn parse(text: &str) -> Result<JsonValue, String> {
    serde_json::from_str(text).map_err(|e| format!("cannot parse as a valid JSON object: {}", e))
}

/// Run a JSONPath query against a parsed document.
///
/// A definite path with a single match yields that value (strings without
/// quotes). Indefinite paths (wildcards, filters, slices, unions, deep scans)
/// yield a JSON array of all matches. `Ok(None)` means nothing matched.
pub fn query(doc: &JsonValue, path: &str) -> Result<Option<String>, String> {
    let json_path = JsonPath::parse(path).map_err(|e| format!("invalid JSONPath: {}", e))?;
    let nodes = json_path.query(doc).all();

    if nodes.is_empty() {
        return Ok(None);
    }

    if nodes.len() == 1 && is_definite(path) {
        return Ok(Some(render(nodes[0])));
    }

    serde_json::to_string(&nodes)
        .map(Some)
        .map_err(|e| format!("cannot serialize matches: {}", e))
}

/// Render a single matched node the way item values expect it
pub fn render(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Whether `path` can select at most one node.
///
/// Only the selector syntax counts: quoted member names such as `$['a:b']`
/// are skipped.
fn is_definite(path: &str) -> bool {
    let mut chars = path.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            match c {
                '\\' => {
                    chars.next();
                }
                c if c == q => quote = None,
                _ => {}
            }
            continue;
        }

        match c {
            '\'' | '"' => quote = Some(c),
            '*' | '?' | ',' | ':' => return false,
            '.' if chars.peek() == Some(&'.') => return false,
            _ => {}
        }
    }

    true
}

//! XML handling: XPath extraction and XML to JSON conversion

use crate::types::format_double;
use serde_json::{Map, Value as JsonValue};
use std::fmt::Write;
use sxd_document::{dom, parser};
use sxd_xpath::nodeset::Node;
use sxd_xpath::{evaluate_xpath, Value as XPathValue};

/// Evaluate an XPath expression against an XML document.
///
/// Element nodes are serialized back to XML, other nodes contribute their
/// string value. Scalar results are rendered as text.
pub fn query(text: &str, xpath: &str) -> Result<String, String> {
    let package = parser::parse(text).map_err(|e| format!("cannot parse xml value: {:?}", e))?;
    let document = package.as_document();

    let value = evaluate_xpath(&document, xpath).map_err(|e| format!("{}", e))?;

    let out = match value {
        XPathValue::Boolean(b) => b.to_string(),
        XPathValue::Number(n) => format_double(n),
        XPathValue::String(s) => s,
        XPathValue::Nodeset(nodes) => {
            let mut out = String::new();
            for node in nodes.document_order() {
                match node {
                    Node::Element(element) => write_element(&mut out, element),
                    other => out.push_str(&other.string_value()),
                }
            }
            out
        }
    };

    Ok(out)
}

/// Convert an XML document to JSON.
///
/// Attributes become `@name` keys, text mixed with child elements becomes
/// `#text`, repeated child elements collapse into arrays and leaf elements
/// become strings.
pub fn to_json(text: &str) -> Result<String, String> {
    let package = parser::parse(text).map_err(|e| format!("cannot parse xml value: {:?}", e))?;
    let document = package.as_document();

    let mut root = Map::new();
    for child in document.root().children() {
        if let dom::ChildOfRoot::Element(element) = child {
            let name = element.name().local_part().to_string();
            insert_child(&mut root, name, element_to_json(element));
        }
    }

    serde_json::to_string(&JsonValue::Object(root))
        .map_err(|e| format!("cannot serialize JSON: {}", e))
}

fn element_to_json(element: dom::Element) -> JsonValue {
    let mut map = Map::new();

    for attribute in element.attributes() {
        map.insert(
            format!("@{}", attribute.name().local_part()),
            JsonValue::String(attribute.value().to_string()),
        );
    }

    let mut text = String::new();
    for child in element.children() {
        match child {
            dom::ChildOfElement::Element(child) => {
                let name = child.name().local_part().to_string();
                insert_child(&mut map, name, element_to_json(child));
            }
            dom::ChildOfElement::Text(t) => text.push_str(t.text()),
            _ => {}
        }
    }

    let text = text.trim();
    if map.is_empty() {
        return JsonValue::String(text.to_string());
    }
    if !text.is_empty() {
        map.insert("#text".to_string(), JsonValue::String(text.to_string()));
    }
    JsonValue::Object(map)
}

fn insert_child(map: &mut Map<String, JsonValue>, name: String, value: JsonValue) {
    match map.get_mut(&name) {
        Some(JsonValue::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = JsonValue::Array(vec![first, value]);
        }
        None => {
            map.insert(name, value);
        }
    }
}

fn write_element(out: &mut String, element: dom::Element) {
    let name = element.name().local_part().to_string();
    out.push('<');
    out.push_str(&name);
    for attribute in element.attributes() {
        let _ = write!(
            out,
            " {}=\"{}\"",
            attribute.name().local_part(),
            escape(attribute.value())
        );
    }

    let children = element.children();
    if children.is_empty() {
        out.push_str("/>");
        return;
    }

    out.push('>');
    for child in children {
        match child {
            dom::ChildOfElement::Element(child) => write_element(out, child),
            dom::ChildOfElement::Text(t) => out.push_str(&escape(t.text())),
            dom::ChildOfElement::Comment(c) => {
                let _ = write!(out, "<!--{}-->", c.text());
            }
            _ => {}
        }
    }
    let _ = write!(out, "</{}>", name);
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

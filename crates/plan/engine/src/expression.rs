//! `<+scope.key>` expressions inside node state parameters
//!
//! A string that is exactly one expression is replaced by the referenced
//! value with its JSON type intact. Expressions embedded in longer text
//! are replaced by the value's text. Object keys are never rewritten and
//! an unterminated `<+` stays literal.

use serde_json::Value;
use std::collections::HashMap;

const OPEN: &str = "<+";
const CLOSE: char = '>';

/// Expression bodies (`scope.key`) referenced anywhere in `value`, in
/// first-seen order without duplicates
pub(crate) fn references(value: &Value) -> Vec<String> {
    let mut found = Vec::new();
    collect(value, &mut found);
    found
}

fn collect(value: &Value, found: &mut Vec<String>) {
    match value {
        Value::String(text) => {
            for body in scan(text).into_iter().filter_map(Segment::expression) {
                if !found.iter().any(|f| f == body) {
                    found.push(body.to_string());
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect(item, found)),
        Value::Object(map) => map.values().for_each(|item| collect(item, found)),
        _ => {}
    }
}

/// Copy of `value` with every expression found in `values` replaced
pub(crate) fn substitute(value: &Value, values: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(text) => substitute_text(text, values),
        Value::Array(items) => Value::Array(items.iter().map(|item| substitute(item, values)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), substitute(item, values)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_text(text: &str, values: &HashMap<String, Value>) -> Value {
    let segments = scan(text);
    if let [Segment::Expression(body)] = segments.as_slice() {
        if let Some(value) = values.get(*body) {
            return value.clone();
        }
    }

    let mut out = String::with_capacity(text.len());
    for segment in segments {
        match segment {
            Segment::Text(literal) => out.push_str(literal),
            Segment::Expression(body) => match values.get(body) {
                Some(Value::String(s)) => out.push_str(s),
                Some(other) => out.push_str(&other.to_string()),
                None => {
                    out.push_str(OPEN);
                    out.push_str(body);
                    out.push(CLOSE);
                }
            },
        }
    }
    Value::String(out)
}

enum Segment<'a> {
    Text(&'a str),
    Expression(&'a str),
}

impl<'a> Segment<'a> {
    fn expression(self) -> Option<&'a str> {
        match self {
            Segment::Expression(body) => Some(body),
            Segment::Text(_) => None,
        }
    }
}

fn scan(text: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        let after = &rest[start + OPEN.len()..];
        let Some(end) = after.find(CLOSE) else {
            break;
        };
        if start > 0 {
            segments.push(Segment::Text(&rest[..start]));
        }
        segments.push(Segment::Expression(after[..end].trim()));
        rest = &after[end + CLOSE.len_utf8()..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }
    segments
}

//! Payload codec: JSON, newline-delimited JSON, and URL query strings
//!
//! All operations are pure. Failures map onto the transport error
//! taxonomy so callers can distinguish encode from decode problems.

use serde_json::Value;

use crate::error::{Result, TransportError};

/// JSON-encode a value
pub fn serialize(value: &Value) -> Result<String> {
    serde_json::to_string(value).map_err(|e| TransportError::Serialization(e.to_string()))
}

/// JSON-decode a payload
pub fn deserialize(payload: &str) -> Result<Value> {
    serde_json::from_str(payload).map_err(|e| TransportError::Deserialization(e.to_string()))
}

/// Encode a bulk body: one JSON document per line, every line
/// newline-terminated, including the last.
pub fn ndserialize(items: &[Value]) -> Result<String> {
    let mut out = String::new();
    for item in items {
        match item {
            // strings are assumed to be pre-serialized lines
            Value::String(s) => out.push_str(s),
            other => out.push_str(&serialize(other)?),
        }
        out.push('\n');
    }
    Ok(out)
}

/// Encode pre-rendered bulk lines verbatim
pub fn ndserialize_lines(lines: &[String]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Encode a query-string mapping.
///
/// Absent and null inputs yield an empty string, a string input is
/// returned unchanged, and an object is form-encoded with null values
/// dropped and array values joined with commas. Anything else is not a
/// legal query source.
pub fn qserialize(value: Option<&Value>) -> Result<String> {
    let value = match value {
        None | Some(Value::Null) => return Ok(String::new()),
        Some(Value::String(s)) => return Ok(s.clone()),
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(TransportError::Serialization(format!(
                "unable to build a query string from {}",
                type_name(other)
            )))
        }
    };

    let mut encoder = form_urlencoded::Serializer::new(String::new());
    for (key, val) in value {
        match val {
            Value::Null => continue,
            Value::Array(items) => {
                let joined = items
                    .iter()
                    .map(render_scalar)
                    .collect::<Result<Vec<_>>>()?
                    .join(",");
                encoder.append_pair(key, &joined);
            }
            other => {
                encoder.append_pair(key, &render_scalar(other)?);
            }
        }
    }

    // form encoding writes spaces as '+'; the service expects %20, and a
    // literal plus is already escaped to %2B, so this rewrite is safe
    Ok(encoder.finish().replace('+', "%20"))
}

fn render_scalar(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => serialize(other),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

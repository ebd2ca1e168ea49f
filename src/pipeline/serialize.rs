//! Serializer stage implementations.
//!
//! Grounded in a `format::json::JsonRecord` pattern (a dedicated
//! serialize-only struct with `level` rendered as a string, not the
//! wire-format enum) and `format::template` (placeholder-driven pretty
//! lines), generalized to the dynamic [`crate::envelope::Value`] tree.

use async_trait::async_trait;
use base64::Engine;
use indexmap::IndexMap;
use serde::Serialize;

use crate::envelope::{CorrelationIds, Envelope, Value};
use crate::pipeline::Serializer;

pub fn base64_encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn base64_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(s)
}

/// Converts a [`Value`] tree into `serde_json::Value`, rendering
/// non-finite floats as `null` and calling `on_non_finite` once per
/// occurrence so the caller can raise a diagnostic for each NaN/Infinity
/// emitted as `null`.
fn value_to_json(value: &Value, on_non_finite: &mut impl FnMut()) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(n) => serde_json::Value::Number((*n).into()),
        Value::Float(f) => {
            if f.is_finite() {
                serde_json::Number::from_f64(*f)
                    .map(serde_json::Value::Number)
                    .unwrap_or_else(|| {
                        on_non_finite();
                        serde_json::Value::Null
                    })
            } else {
                on_non_finite();
                serde_json::Value::Null
            }
        }
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => serde_json::Value::String(base64_encode(b)),
        Value::List(items) => {
            serde_json::Value::Array(items.iter().map(|v| value_to_json(v, on_non_finite)).collect())
        }
        Value::Map(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), value_to_json(v, on_non_finite)))
                .collect(),
        ),
    }
}

fn json_object_is_empty(value: &serde_json::Value) -> bool {
    matches!(value, serde_json::Value::Object(map) if map.is_empty())
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    timestamp: chrono::DateTime<chrono::Utc>,
    level: &'a str,
    message: &'a str,
    origin: &'static str,
    #[serde(skip_serializing_if = "json_object_is_empty")]
    context: serde_json::Value,
    #[serde(skip_serializing_if = "json_object_is_empty")]
    data: serde_json::Value,
    #[serde(skip_serializing_if = "json_object_is_empty")]
    diagnostics: serde_json::Value,
    #[serde(flatten, skip_serializing_if = "CorrelationIds::is_empty")]
    correlation: &'a CorrelationIds,
}

fn origin_str(origin: crate::envelope::Origin) -> &'static str {
    match origin {
        crate::envelope::Origin::Native => "native",
        crate::envelope::Origin::Bridged => "bridged",
        crate::envelope::Origin::ThirdParty => "third_party",
    }
}

fn level_name(envelope: &Envelope) -> &str {
    if envelope.level_name.is_empty() {
        envelope.level.builtin_name().unwrap_or("UNKNOWN")
    } else {
        envelope.level_name.as_str()
    }
}

/// One JSON object per line, UTF-8, trailing `\n` — the default format.
#[derive(Default)]
pub struct JsonLinesSerializer;

fn map_to_json(map: &IndexMap<String, Value>, on_non_finite: &mut impl FnMut()) -> serde_json::Value {
    value_to_json(&Value::Map(map.clone()), on_non_finite)
}

impl JsonLinesSerializer {
    fn to_json_value(envelope: &Envelope, non_finite_count: &mut usize) -> serde_json::Value {
        let mut on_non_finite = || *non_finite_count += 1;
        let record = JsonRecord {
            timestamp: envelope.timestamp,
            level: level_name(envelope),
            message: &envelope.message,
            origin: origin_str(envelope.origin),
            context: map_to_json(&envelope.context, &mut on_non_finite),
            data: map_to_json(&envelope.data, &mut on_non_finite),
            diagnostics: map_to_json(&envelope.diagnostics, &mut on_non_finite),
            correlation: &envelope.correlation,
        };
        serde_json::to_value(record).unwrap_or(serde_json::Value::Null)
    }
}

#[async_trait]
impl Serializer for JsonLinesSerializer {
    fn name(&self) -> &str {
        "json_lines"
    }

    fn serialize(&self, envelope: &Envelope) -> Vec<u8> {
        let mut non_finite = 0usize;
        let value = Self::to_json_value(envelope, &mut non_finite);
        let mut out = serde_json::to_vec(&value).unwrap_or_default();
        out.push(b'\n');
        out
    }
}

/// Human-readable, deterministic column layout: `HH:MM:SS.sss
/// LEVEL [context-summary] message  key=value ...`. Not stable for
/// machine parsing.
#[derive(Default)]
pub struct PrettySerializer;

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(n) => n.to_string(),
        Value::Float(f) => {
            if f.is_finite() {
                f.to_string()
            } else {
                "null".to_string()
            }
        }
        Value::Str(s) => s.clone(),
        Value::Bytes(b) => base64_encode(b),
        Value::List(items) => {
            let rendered: Vec<String> = items.iter().map(render_value).collect();
            format!("[{}]", rendered.join(","))
        }
        Value::Map(map) => {
            let rendered: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{k}={}", render_value(v)))
                .collect();
            format!("{{{}}}", rendered.join(","))
        }
    }
}

#[async_trait]
impl Serializer for PrettySerializer {
    fn name(&self) -> &str {
        "pretty"
    }

    fn serialize(&self, envelope: &Envelope) -> Vec<u8> {
        let time = envelope.timestamp.format("%H:%M:%S%.3f");
        let mut context_summary = String::new();
        if !envelope.context.is_empty() {
            let parts: Vec<String> = envelope
                .context
                .iter()
                .map(|(k, v)| format!("{k}={}", render_value(v)))
                .collect();
            context_summary = format!("[{}] ", parts.join(","));
        }

        let fields: Vec<String> = envelope
            .data
            .iter()
            .map(|(k, v)| format!("{k}={}", render_value(v)))
            .collect();
        let fields_str = if fields.is_empty() {
            String::new()
        } else {
            format!("  {}", fields.join(" "))
        };

        let line = format!(
            "{time} {level} {context_summary}{message}{fields_str}\n",
            level = level_name(envelope),
            message = envelope.message,
        );
        line.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Level;

    fn env() -> Envelope {
        let mut e = Envelope::new(Level::INFO, "INFO", "hello");
        e.data.insert("user".to_string(), Value::from("alice"));
        e
    }

    #[test]
    fn json_lines_output_ends_with_newline_and_parses() {
        let out = JsonLinesSerializer.serialize(&env());
        assert_eq!(*out.last().unwrap(), b'\n');
        let parsed: serde_json::Value = serde_json::from_slice(&out[..out.len() - 1]).unwrap();
        assert_eq!(parsed["level"], "INFO");
        assert_eq!(parsed["message"], "hello");
        assert_eq!(parsed["data"]["user"], "alice");
    }

    #[test]
    fn json_lines_nan_becomes_null() {
        let mut e = env();
        e.data.insert("ratio".to_string(), Value::Float(f64::NAN));
        let out = JsonLinesSerializer.serialize(&e);
        let parsed: serde_json::Value = serde_json::from_slice(&out[..out.len() - 1]).unwrap();
        assert!(parsed["data"]["ratio"].is_null());
    }

    #[test]
    fn json_lines_bytes_base64_round_trip() {
        let mut e = env();
        e.data.insert("blob".to_string(), Value::Bytes(vec![1, 2, 3, 255]));
        let out = JsonLinesSerializer.serialize(&e);
        let parsed: serde_json::Value = serde_json::from_slice(&out[..out.len() - 1]).unwrap();
        let encoded = parsed["data"]["blob"].as_str().unwrap();
        assert_eq!(base64_decode(encoded).unwrap(), vec![1, 2, 3, 255]);
    }

    #[test]
    fn pretty_format_includes_key_value_fields() {
        let out = PrettySerializer.serialize(&env());
        let line = String::from_utf8(out).unwrap();
        assert!(line.contains("INFO"));
        assert!(line.contains("hello"));
        assert!(line.contains("user=alice"));
    }

    #[test]
    fn base64_round_trip() {
        let encoded = base64_encode(b"hello world");
        assert_eq!(base64_decode(&encoded).unwrap(), b"hello world");
    }
}

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

/// Fields bound into an event hash, in chain order.
#[derive(Debug, Clone, Copy)]
pub struct HashInput<'a> {
    pub prev_hash: &'a str,
    pub id: &'a str,
    pub event_type: &'a str,
    pub source: &'a str,
    pub conversation_id: &'a str,
    pub ts_nanos: i64,
    pub canonical_content: &'a str,
}

/// `sha256(prev|id|type|source|conversation|ts_nanos|content)` as lowercase hex.
pub fn compute_hash(input: &HashInput<'_>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.prev_hash.as_bytes());
    hasher.update(b"|");
    hasher.update(input.id.as_bytes());
    hasher.update(b"|");
    hasher.update(input.event_type.as_bytes());
    hasher.update(b"|");
    hasher.update(input.source.as_bytes());
    hasher.update(b"|");
    hasher.update(input.conversation_id.as_bytes());
    hasher.update(b"|");
    hasher.update(input.ts_nanos.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(input.canonical_content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compact JSON with object keys sorted at every depth.
///
/// Independent of `serde_json`'s map ordering feature so the bytes stay
/// stable whatever features the dependency graph enables.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        // Scalars already have a single compact rendering.
        other => {
            let _ = write!(out, "{other}");
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    // Value::String's Display is the escaped JSON literal.
    let _ = write!(out, "{}", Value::String(s.to_owned()));
}

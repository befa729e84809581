//! Structural `{__type__, data}` envelopes for non-JSON-native values.
//!
//! Recognition is structural: any object carrying a `__type__` key is an
//! envelope, regardless of where it came from, so the codec has no
//! dependency on any runtime's type system. Supported tags:
//!
//! - `date` — `data` is an RFC 3339 string
//! - `bytes` — `data` is standard base64
//! - `set` — `data` is an array, each element recursively checked
//! - `map` — `data` is an array of `[key, value]` pairs
//!
//! An unrecognized tag is a decode error, never a silent pass-through.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};

use crate::error::WireError;

/// The envelope discriminator key.
pub const TYPE_KEY: &str = "__type__";

const TAG_DATE: &str = "date";
const TAG_BYTES: &str = "bytes";
const TAG_SET: &str = "set";
const TAG_MAP: &str = "map";

// ── Constructors ────────────────────────────────────────────────────

/// Encode a timestamp as a date envelope.
pub fn date(value: DateTime<Utc>) -> Value {
    json!({
        TYPE_KEY: TAG_DATE,
        "data": value.to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

/// Encode a binary blob as a bytes envelope.
pub fn bytes(value: &[u8]) -> Value {
    json!({ TYPE_KEY: TAG_BYTES, "data": BASE64.encode(value) })
}

/// Encode a set of values as a set envelope.
pub fn set(values: Vec<Value>) -> Value {
    json!({ TYPE_KEY: TAG_SET, "data": values })
}

/// Encode key/value pairs as a map envelope.
pub fn map(pairs: Vec<(Value, Value)>) -> Value {
    let entries: Vec<Value> = pairs.into_iter().map(|(k, v)| json!([k, v])).collect();
    json!({ TYPE_KEY: TAG_MAP, "data": entries })
}

// ── Extractors ──────────────────────────────────────────────────────

/// Read a date envelope back into a timestamp.
pub fn as_date(value: &Value) -> Result<DateTime<Utc>, WireError> {
    let data = envelope_data(value, TAG_DATE)?;
    let raw = data
        .as_str()
        .ok_or_else(|| WireError::InvalidEnvelope("date data must be a string".into()))?;
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| WireError::InvalidEnvelope(format!("bad date '{raw}': {e}")))?;
    Ok(parsed.with_timezone(&Utc))
}

/// Read a bytes envelope back into raw bytes.
pub fn as_bytes(value: &Value) -> Result<Vec<u8>, WireError> {
    let data = envelope_data(value, TAG_BYTES)?;
    let raw = data
        .as_str()
        .ok_or_else(|| WireError::InvalidEnvelope("bytes data must be a string".into()))?;
    BASE64
        .decode(raw)
        .map_err(|e| WireError::InvalidEnvelope(format!("bad base64: {e}")))
}

fn envelope_data<'a>(value: &'a Value, expected_tag: &str) -> Result<&'a Value, WireError> {
    let obj = value
        .as_object()
        .ok_or_else(|| WireError::InvalidEnvelope("not an envelope object".into()))?;
    let tag = obj
        .get(TYPE_KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| WireError::InvalidEnvelope("missing __type__ tag".into()))?;
    if tag != expected_tag {
        return Err(WireError::InvalidEnvelope(format!(
            "expected '{expected_tag}' envelope, found '{tag}'"
        )));
    }
    obj.get("data")
        .ok_or_else(|| WireError::InvalidEnvelope("missing data field".into()))
}

// ── Validation ──────────────────────────────────────────────────────

/// Walk a payload tree, validating every envelope it contains.
///
/// Called on every decoded frame; this is where an unknown `__type__`
/// becomes a parse error.
pub fn check_value(value: &Value) -> Result<(), WireError> {
    match value {
        Value::Object(obj) => {
            if let Some(tag) = obj.get(TYPE_KEY) {
                let tag = tag.as_str().ok_or_else(|| {
                    WireError::InvalidEnvelope("__type__ tag must be a string".into())
                })?;
                let data = obj
                    .get("data")
                    .ok_or_else(|| WireError::InvalidEnvelope("missing data field".into()))?;
                return check_envelope(tag, data, value);
            }
            for child in obj.values() {
                check_value(child)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                check_value(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn check_envelope(tag: &str, data: &Value, whole: &Value) -> Result<(), WireError> {
    match tag {
        TAG_DATE => as_date(whole).map(|_| ()),
        TAG_BYTES => as_bytes(whole).map(|_| ()),
        TAG_SET => {
            let items = data
                .as_array()
                .ok_or_else(|| WireError::InvalidEnvelope("set data must be an array".into()))?;
            for item in items {
                check_value(item)?;
            }
            Ok(())
        }
        TAG_MAP => {
            let entries = data
                .as_array()
                .ok_or_else(|| WireError::InvalidEnvelope("map data must be an array".into()))?;
            for entry in entries {
                let pair = entry.as_array().filter(|p| p.len() == 2).ok_or_else(|| {
                    WireError::InvalidEnvelope("map entries must be [key, value] pairs".into())
                })?;
                check_value(&pair[0])?;
                check_value(&pair[1])?;
            }
            Ok(())
        }
        other => Err(WireError::UnknownEnvelopeTag(other.to_owned())),
    }
}

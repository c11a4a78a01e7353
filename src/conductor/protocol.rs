//! Conductor Wire Protocol
//!
//! Single responsibility: Encode and decode messages in the conductor's msgpack wire format.
//!
//! # Wire Format
//!
//! ## Request Envelope (outer)
//! ```text
//! {
//!     "id": <u64>,           // Request ID for correlation
//!     "type": "request",
//!     "data": <binary>,      // Inner request as msgpack bytes
//! }
//! ```
//!
//! ## Inner Request
//! ```text
//! { "type": "<request_type>", "value": <request-specific value> }
//! ```
//!
//! ## Response Envelope
//! ```text
//! {
//!     "id": <u64>,
//!     "type": "response" | "error",
//!     "data": <binary>,      // Inner response (or error) as msgpack bytes
//! }
//! ```
//!
//! Envelopes of type `"signal"` carry no id and are ignored by this client.

use rmpv::Value;
use std::io::Cursor;

use crate::error::{ConnectError, Result};

/// A decoded envelope from the conductor.
#[derive(Debug)]
pub enum Incoming {
    /// Reply to request `id`: the inner value, or the conductor's error message
    Response {
        id: u64,
        result: std::result::Result<Value, String>,
    },
    /// Unsolicited signal
    Signal,
}

/// Encode a `rmpv::Value` to msgpack bytes.
pub fn encode_value(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value)
        .map_err(|e| ConnectError::Protocol(format!("Failed to encode msgpack: {}", e)))?;
    Ok(buf)
}

/// Decode msgpack bytes into a `rmpv::Value`.
pub fn decode_value(bytes: &[u8]) -> Result<Value> {
    let mut cursor = Cursor::new(bytes);
    rmpv::decode::read_value(&mut cursor)
        .map_err(|e| ConnectError::Protocol(format!("Failed to decode msgpack: {}", e)))
}

/// Build `{ type, value }`.
pub fn inner_request(request_type: &str, value: Value) -> Value {
    Value::Map(vec![
        (Value::String("type".into()), Value::String(request_type.into())),
        (Value::String("value".into()), value),
    ])
}

/// Wrap an inner request in the outer request envelope.
pub fn encode_request(id: u64, inner: &Value) -> Result<Vec<u8>> {
    let inner_bytes = encode_value(inner)?;
    let envelope = Value::Map(vec![
        (Value::String("id".into()), Value::Integer(id.into())),
        (Value::String("type".into()), Value::String("request".into())),
        (Value::String("data".into()), Value::Binary(inner_bytes)),
    ]);
    encode_value(&envelope)
}

/// Encode the `authenticate` message sent first on an app interface.
pub fn encode_authenticate(token: &[u8]) -> Result<Vec<u8>> {
    let inner = Value::Map(vec![(
        Value::String("token".into()),
        Value::Binary(token.to_vec()),
    )]);
    let envelope = Value::Map(vec![
        (Value::String("type".into()), Value::String("authenticate".into())),
        (Value::String("data".into()), Value::Binary(encode_value(&inner)?)),
    ]);
    encode_value(&envelope)
}

/// Decode an incoming envelope.
pub fn decode_incoming(bytes: &[u8]) -> Result<Incoming> {
    let value = decode_value(bytes)?;
    let map = value
        .as_map()
        .ok_or_else(|| ConnectError::Protocol("Envelope is not a map".into()))?;

    let kind = get_str(map, "type")
        .ok_or_else(|| ConnectError::Protocol("Envelope missing 'type' field".into()))?;

    if kind == "signal" {
        return Ok(Incoming::Signal);
    }

    let id = get_field(map, "id")
        .and_then(Value::as_u64)
        .ok_or_else(|| ConnectError::Protocol("Envelope missing 'id' field".into()))?;

    let result = match kind {
        "response" => {
            let data = get_field(map, "data")
                .and_then(Value::as_slice)
                .ok_or_else(|| ConnectError::Protocol("Response missing binary 'data'".into()))?;
            let inner = decode_value(data)?;
            match inner_error(&inner) {
                Some(msg) => Err(msg),
                None => Ok(inner),
            }
        }
        "error" => Err(envelope_error(map)),
        other => {
            return Err(ConnectError::Protocol(format!(
                "Unknown envelope type: {}",
                other
            )))
        }
    };

    Ok(Incoming::Response { id, result })
}

/// Error text carried by an error envelope, in whichever shape it arrived.
fn envelope_error(map: &[(Value, Value)]) -> String {
    if let Some(data) = get_field(map, "data") {
        if let Some(s) = data.as_str() {
            return s.to_string();
        }
        if let Some(bytes) = data.as_slice() {
            if let Ok(inner) = decode_value(bytes) {
                return inner_error(&inner).unwrap_or_else(|| format!("{}", inner));
            }
        }
    }
    if let Some(Value::Map(err)) = get_field(map, "value") {
        if let Some(msg) = get_str(err, "value").or_else(|| get_str(err, "message")) {
            return msg.to_string();
        }
    }
    "Unknown conductor error".to_string()
}

/// `{ type: "error", value: { type, value | message } }` inside a response.
fn inner_error(inner: &Value) -> Option<String> {
    let map = inner.as_map()?;
    if get_str(map, "type")? != "error" {
        return None;
    }
    match get_field(map, "value") {
        Some(Value::Map(err)) => Some(
            get_str(err, "value")
                .or_else(|| get_str(err, "message"))
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}", Value::Map(err.clone()))),
        ),
        Some(Value::String(s)) => s.as_str().map(str::to_string),
        _ => Some("Unknown conductor error".to_string()),
    }
}

// =============================================================================
// Map helpers
// =============================================================================

/// Get a field from a msgpack map by string key.
pub fn get_field<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

pub fn get_str<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a str> {
    get_field(map, key).and_then(Value::as_str)
}

/// Bytes stored either as msgpack binary or as an array of small integers.
pub fn as_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Binary(bytes) => Some(bytes.clone()),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
            .collect(),
        _ => None,
    }
}

/// The `value` of an inner response, falling back to `data` for older conductors.
pub fn response_value(inner: &Value) -> Option<&Value> {
    let map = inner.as_map()?;
    get_field(map, "value").or_else(|| get_field(map, "data"))
}

/// Convert a decoded zome result into JSON. Binary becomes an array of bytes.
pub fn msgpack_to_json(value: Value) -> serde_json::Value {
    use serde_json::Value as Json;
    match value {
        Value::Nil => Json::Null,
        Value::Boolean(b) => Json::Bool(b),
        Value::Integer(i) => {
            if let Some(n) = i.as_u64() {
                Json::from(n)
            } else if let Some(n) = i.as_i64() {
                Json::from(n)
            } else {
                Json::Null
            }
        }
        Value::F32(f) => serde_json::Number::from_f64(f as f64)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::F64(f) => serde_json::Number::from_f64(f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::String(s) => Json::String(s.into_str().unwrap_or_default()),
        Value::Binary(bytes) => Json::Array(bytes.into_iter().map(Json::from).collect()),
        Value::Array(items) => Json::Array(items.into_iter().map(msgpack_to_json).collect()),
        Value::Map(entries) => {
            let mut obj = serde_json::Map::with_capacity(entries.len());
            for (k, v) in entries {
                let key = match k {
                    Value::String(s) => s.into_str().unwrap_or_default(),
                    other => other.to_string(),
                };
                obj.insert(key, msgpack_to_json(v));
            }
            Json::Object(obj)
        }
        Value::Ext(_, bytes) => Json::Array(bytes.into_iter().map(Json::from).collect()),
    }
}

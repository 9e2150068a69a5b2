//! Turning caller values into wire bytes

use serde::Serialize;

/// A value accepted by [`Connection::send`](super::Connection::send).
///
/// Each value is normalized to bytes on its own, then the values are joined.
#[derive(Debug, Clone, PartialEq)]
pub enum SendValue {
    /// Raw bytes, surrounding ASCII whitespace trimmed
    Bytes(Vec<u8>),
    /// Text, surrounding whitespace trimmed
    Text(String),
    /// Structured value, sent as compact JSON
    Json(serde_json::Value),
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    UInt(u64),
    /// Floating point number
    Float(f64),
    /// Boolean, sent as `true` / `false`
    Bool(bool),
}

impl SendValue {
    /// Serialize any value into a JSON payload
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(SendValue::Json(serde_json::to_value(value)?))
    }
}

impl From<&str> for SendValue {
    fn from(s: &str) -> Self {
        SendValue::Text(s.to_string())
    }
}

impl From<String> for SendValue {
    fn from(s: String) -> Self {
        SendValue::Text(s)
    }
}

impl From<&[u8]> for SendValue {
    fn from(b: &[u8]) -> Self {
        SendValue::Bytes(b.to_vec())
    }
}

impl From<Vec<u8>> for SendValue {
    fn from(b: Vec<u8>) -> Self {
        SendValue::Bytes(b)
    }
}

impl<const N: usize> From<&[u8; N]> for SendValue {
    fn from(b: &[u8; N]) -> Self {
        SendValue::Bytes(b.to_vec())
    }
}

impl From<i64> for SendValue {
    fn from(n: i64) -> Self {
        SendValue::Int(n)
    }
}

impl From<i32> for SendValue {
    fn from(n: i32) -> Self {
        SendValue::Int(n.into())
    }
}

impl From<u64> for SendValue {
    fn from(n: u64) -> Self {
        SendValue::UInt(n)
    }
}

impl From<u32> for SendValue {
    fn from(n: u32) -> Self {
        SendValue::UInt(n.into())
    }
}

impl From<f64> for SendValue {
    fn from(x: f64) -> Self {
        SendValue::Float(x)
    }
}

impl From<bool> for SendValue {
    fn from(b: bool) -> Self {
        SendValue::Bool(b)
    }
}

impl From<serde_json::Value> for SendValue {
    fn from(v: serde_json::Value) -> Self {
        SendValue::Json(v)
    }
}

/// How a batch of values is framed on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOptions {
    /// Appended once after the joined values
    pub ending: String,
    /// Placed between consecutive values
    pub joiner: String,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            ending: "\r\n".to_string(),
            joiner: " ".to_string(),
        }
    }
}

fn format_float(x: f64) -> String {
    if x.is_nan() {
        "nan".to_string()
    } else if x.is_infinite() {
        let s = if x > 0.0 { "inf" } else { "-inf" };
        s.to_string()
    } else if x.fract() == 0.0 && x.abs() < 1e16 {
        format!("{x:.1}")
    } else {
        format!("{x}")
    }
}

/// Bytes for a single value
pub fn normalize(value: &SendValue) -> Vec<u8> {
    match value {
        SendValue::Bytes(b) => b.trim_ascii().to_vec(),
        SendValue::Text(s) => s.trim().as_bytes().to_vec(),
        SendValue::Json(v) => v.to_string().into_bytes(),
        SendValue::Int(n) => n.to_string().into_bytes(),
        SendValue::UInt(n) => n.to_string().into_bytes(),
        SendValue::Float(x) => format_float(*x).into_bytes(),
        SendValue::Bool(b) => b.to_string().into_bytes(),
    }
}

/// Normalize, join and terminate a batch of values
pub fn encode(values: &[SendValue], options: &SendOptions) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.extend_from_slice(options.joiner.as_bytes());
        }
        out.extend_from_slice(&normalize(value));
    }
    out.extend_from_slice(options.ending.as_bytes());
    out
}

//! The closed value type carried by every protocol payload field.
//!
//! Node values, configs, attributes, invoke params and update rows are all
//! [`Value`]s.  Loose input is parsed once at the codec boundary; everything
//! past that point works with this enum.

use std::collections::BTreeMap;
use std::fmt;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Prefix marking a binary value inside a JSON string.
pub const BYTES_PREFIX: &str = "\u{1b}bytes:";

/// URL-safe alphabet, padded on encode, padding optional on decode.
const BYTES_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// A protocol value.
///
/// Structured payloads (arbitrary JSON objects and arrays) are kept as
/// `Map` and `Array` trees, so nothing a peer sends collapses into `Null`.
///
/// `Int`, `Float` and `Double` are distinct representations: `Int(1)` and
/// `Double(1.0)` compare unequal, so replacing one with the other counts as
/// a change.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// An empty map value.
    pub fn map() -> Self {
        Value::Map(BTreeMap::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view.  Whole doubles are accepted since JSON peers do not
    /// always preserve the integer representation.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Double(d) if d.fract() == 0.0 && d.is_finite() => Some(*d as i64),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(f64::from(*f)),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Look up a key when this value is a map.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Insert into a map value.  No-op for non-map values.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        if let Value::Map(m) = self {
            m.insert(key.into(), value.into());
        }
    }

    /// The `$type` name the protocol uses for this representation.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "dynamic",
            Value::Bool(_) => "bool",
            Value::Int(_) | Value::Float(_) | Value::Double(_) => "number",
            Value::String(_) => "string",
            Value::Bytes(_) => "binary",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }
}

/// Encode bytes the way JSON peers expect them.
pub fn encode_bytes(bytes: &[u8]) -> String {
    format!("{BYTES_PREFIX}{}", BYTES_ENGINE.encode(bytes))
}

/// Decode a JSON-escaped binary string.  Returns `None` when `s` is not an
/// escaped binary or the payload is not valid base64.
pub fn decode_bytes(s: &str) -> Option<Vec<u8>> {
    let payload = s.strip_prefix(BYTES_PREFIX)?;
    BYTES_ENGINE.decode(payload).ok()
}

// ── Conversions ─────────────────────────────────────────────────────

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Value {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Value::Map(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl FromIterator<Value> for Value {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Value::Array(iter.into_iter().collect())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(s) => f.write_str(s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Array(a) => write!(f, "<array of {}>", a.len()),
            Value::Map(m) => write!(f, "<map of {}>", m.len()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// serde
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f32(*f),
            Value::Double(d) => serializer.serialize_f64(*d),
            Value::String(s) => serializer.serialize_str(s),
            Value::Bytes(b) => {
                // Text formats have no binary type.
                if serializer.is_human_readable() {
                    serializer.serialize_str(&encode_bytes(b))
                } else {
                    serializer.serialize_bytes(b)
                }
            }
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = deserializer.is_human_readable();
        deserializer.deserialize_any(ValueVisitor { text })
    }
}

/// `text` is set for human-readable formats, the only ones where the
/// bytes escape is decoded.
struct ValueVisitor {
    text: bool,
}

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a protocol value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Value, D::Error> {
        Value::deserialize(d)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        Ok(i64::try_from(v).map_or(Value::Double(v as f64), Value::Int))
    }

    fn visit_f32<E: de::Error>(self, v: f32) -> Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Double(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
        let bytes = if self.text { decode_bytes(v) } else { None };
        Ok(match bytes {
            Some(bytes) => Value::Bytes(bytes),
            None => Value::String(v.to_string()),
        })
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
        if self.text && v.starts_with(BYTES_PREFIX) {
            return self.visit_str(&v);
        }
        Ok(Value::String(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Value, E> {
        Ok(Value::Bytes(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Value, E> {
        Ok(Value::Bytes(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element::<Value>()? {
            items.push(item);
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut entries = BTreeMap::new();
        while let Some(key) = map.next_key::<Value>()? {
            // MessagePack peers occasionally send integer keys.
            let key = match key {
                Value::String(s) => s,
                Value::Int(i) => i.to_string(),
                other => {
                    return Err(de::Error::custom(format!(
                        "unsupported map key of type {}",
                        other.type_name()
                    )))
                }
            };
            entries.insert(key, map.next_value::<Value>()?);
        }
        Ok(Value::Map(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_and_double_are_distinct() {
        assert_ne!(Value::Int(1), Value::Double(1.0));
        assert_eq!(Value::Int(1).as_f64(), Value::Double(1.0).as_f64());
    }

    #[test]
    fn json_bytes_use_escape_prefix() {
        let v = Value::Bytes(vec![0, 1, 2, 250, 251, 252, 253, 254, 255]);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"\\u001bbytes:AAEC-vv8_f7_\"");
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn escaped_string_stays_a_string_in_msgpack() {
        let v = Value::String("\u{1b}bytes:AQI=".into());
        let packed = rmp_serde::to_vec_named(&v).unwrap();
        let back: Value = rmp_serde::from_slice(&packed).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn nested_structures_survive_json() {
        let json = r#"{"a":[1,{"b":null}],"c":{"d":"e"}}"#;
        let v: Value = serde_json::from_str(json).unwrap();
        assert!(matches!(v.get("a"), Some(Value::Array(items)) if items.len() == 2));
        assert_eq!(serde_json::to_string(&v).unwrap(), json);
    }

    #[test]
    fn unpadded_bytes_decode() {
        assert_eq!(decode_bytes("\u{1b}bytes:AAE"), Some(vec![0, 1]));
        assert_eq!(decode_bytes("\u{1b}bytes:AAE="), Some(vec![0, 1]));
        assert_eq!(decode_bytes("plain"), None);
    }

    #[test]
    fn json_numbers_pick_representation() {
        let v: Value = serde_json::from_str("[1, -2, 1.5]").unwrap();
        assert_eq!(
            v,
            Value::Array(vec![Value::Int(1), Value::Int(-2), Value::Double(1.5)])
        );
    }

    #[test]
    fn collect_into_map() {
        let v: Value = [("a", Value::from(1)), ("b", Value::from("x"))]
            .into_iter()
            .collect();
        assert_eq!(v.get("a"), Some(&Value::Int(1)));
        assert_eq!(v.get("b").and_then(Value::as_str), Some("x"));
    }

    #[test]
    fn whole_double_reads_as_integer() {
        assert_eq!(Value::Double(7.0).as_i64(), Some(7));
        assert_eq!(Value::Double(7.5).as_i64(), None);
    }
}

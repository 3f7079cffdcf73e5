//! Plain data model exchanged between contexts and persisted per location.
//!
//! A [`Value`] is the "plain data" every layer agrees on: the bus moves it
//! across context boundaries, the state engine hydrates it into the
//! observable graph, and storage persists it.
//!
//! # JSON encoding
//!
//! JSON has no binary type, so bytes are written as a tagged object. A tagged
//! object is an object with exactly one key drawn from the reserved tags:
//!
//! | Tag | Meaning |
//! |-----|---------|
//! | `$bytes` | inline base64 payload |
//! | `$blob` | reference to a blob held by another context (bus only) |
//! | `$map` | escaped map whose only key happens to be a reserved tag |

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map as JsonMap, Number, Value as Json};

use crate::error::{CoreError, CoreResult};

/// Tag for inline base64 bytes.
pub const BYTES_TAG: &str = "$bytes";
/// Tag for a blob reference.
pub const BLOB_TAG: &str = "$blob";
/// Tag for an escaped map.
pub const MAP_TAG: &str = "$map";

const RESERVED_TAGS: [&str; 3] = [BYTES_TAG, BLOB_TAG, MAP_TAG];

/// Ordered string-keyed mapping of values.
pub type Map = BTreeMap<String, Value>;

/// A plain data value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absence of a value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Finite float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Binary payload, compared by content.
    Bytes(Vec<u8>),
    /// Ordered list.
    List(Vec<Value>),
    /// String-keyed mapping.
    Map(Map),
}

impl Value {
    /// Create an empty map value.
    #[must_use]
    pub fn map() -> Self {
        Self::Map(Map::new())
    }

    /// Name of the variant, for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    /// Whether this value is [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Whether this value is a list or a map.
    #[must_use]
    pub fn is_compound(&self) -> bool {
        matches!(self, Self::List(_) | Self::Map(_))
    }

    /// Borrow as a bool.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Borrow as an integer.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Read a non-negative integer.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        self.as_i64().and_then(|i| u64::try_from(i).ok())
    }

    /// Read as a float; integers are widened.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Borrow as a string slice.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow as bytes.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Borrow as a list.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Borrow as a map.
    #[must_use]
    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Mutably borrow as a map.
    pub fn as_map_mut(&mut self) -> Option<&mut Map> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Consume into a map, if this is one.
    #[must_use]
    pub fn into_map(self) -> Option<Map> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a key when this value is a map.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Encode to JSON, writing bytes inline as base64.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NonFiniteFloat`] for NaN or infinite floats.
    pub fn to_json(&self) -> CoreResult<Json> {
        self.encode_with(&mut |bytes| Ok(tagged(BYTES_TAG, Json::String(STANDARD.encode(bytes)))))
    }

    /// Encode to JSON, delegating every binary payload to `on_bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NonFiniteFloat`] for NaN or infinite floats, or
    /// whatever `on_bytes` returns.
    pub fn encode_with<F>(&self, on_bytes: &mut F) -> CoreResult<Json>
    where
        F: FnMut(&[u8]) -> CoreResult<Json>,
    {
        Ok(match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(i) => Json::Number((*i).into()),
            Self::Float(f) => Json::Number(Number::from_f64(*f).ok_or(CoreError::NonFiniteFloat)?),
            Self::String(s) => Json::String(s.clone()),
            Self::Bytes(bytes) => on_bytes(bytes)?,
            Self::List(items) => Json::Array(
                items
                    .iter()
                    .map(|v| v.encode_with(on_bytes))
                    .collect::<CoreResult<_>>()?,
            ),
            Self::Map(map) => {
                let mut obj = JsonMap::with_capacity(map.len());
                for (key, value) in map {
                    obj.insert(key.clone(), value.encode_with(on_bytes)?);
                }
                if obj.len() == 1 && obj.keys().all(|k| is_reserved(k)) {
                    tagged(MAP_TAG, Json::Object(obj))
                } else {
                    Json::Object(obj)
                }
            },
        })
    }

    /// Decode from JSON produced by [`to_json`](Self::to_json).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidEncoding`] for malformed tagged objects and
    /// [`CoreError::UnsupportedTag`] for blob references.
    pub fn from_json(json: Json) -> CoreResult<Self> {
        Self::decode_with(json, &mut |tag, _| Err(CoreError::UnsupportedTag(tag.to_owned())))
    }

    /// Decode from JSON, delegating tags other than `$bytes`/`$map` to `on_tag`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidEncoding`] for malformed tagged objects, or
    /// whatever `on_tag` returns.
    pub fn decode_with<F>(json: Json, on_tag: &mut F) -> CoreResult<Self>
    where
        F: FnMut(&str, Json) -> CoreResult<Self>,
    {
        Ok(match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(b),
            Json::Number(n) => number_to_value(&n),
            Json::String(s) => Self::String(s),
            Json::Array(items) => Self::List(
                items
                    .into_iter()
                    .map(|v| Self::decode_with(v, on_tag))
                    .collect::<CoreResult<_>>()?,
            ),
            Json::Object(obj) => match split_tag(obj) {
                Ok((tag, body)) => match (tag.as_str(), body) {
                    (MAP_TAG, Json::Object(inner)) => Self::Map(decode_entries(inner, on_tag)?),
                    (BYTES_TAG, Json::String(encoded)) => Self::Bytes(
                        STANDARD
                            .decode(encoded)
                            .map_err(|e| CoreError::InvalidEncoding(e.to_string()))?,
                    ),
                    (MAP_TAG | BYTES_TAG, other) => {
                        return Err(CoreError::InvalidEncoding(format!(
                            "{tag} body must not be {other}"
                        )));
                    },
                    (_, body) => on_tag(&tag, body)?,
                },
                Err(obj) => Self::Map(decode_entries(obj, on_tag)?),
            },
        })
    }
}

fn is_reserved(key: &str) -> bool {
    RESERVED_TAGS.contains(&key)
}

fn tagged(tag: &str, body: Json) -> Json {
    let mut obj = JsonMap::with_capacity(1);
    obj.insert(tag.to_owned(), body);
    Json::Object(obj)
}

/// Split a single-key reserved object into `(tag, body)`, or hand the object back.
fn split_tag(obj: JsonMap<String, Json>) -> Result<(String, Json), JsonMap<String, Json>> {
    if obj.len() != 1 || !obj.keys().all(|k| is_reserved(k)) {
        return Err(obj);
    }
    obj.into_iter().next().ok_or_else(JsonMap::new)
}

fn decode_entries<F>(obj: JsonMap<String, Json>, on_tag: &mut F) -> CoreResult<Map>
where
    F: FnMut(&str, Json) -> CoreResult<Value>,
{
    obj.into_iter()
        .map(|(k, v)| Ok((k, Value::decode_with(v, on_tag)?)))
        .collect()
}

fn number_to_value(n: &Number) -> Value {
    if let Some(i) = n.as_i64() {
        Value::Int(i)
    } else {
        n.as_f64().map_or(Value::Null, Value::Float)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_json() {
            Ok(json) => write!(f, "{json}"),
            Err(_) => write!(f, "{self:?}"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = Json::deserialize(deserializer)?;
        Self::from_json(json).map_err(serde::de::Error::custom)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<u64> for Value {
    fn from(i: u64) -> Self {
        Self::Int(i64::try_from(i).unwrap_or(i64::MAX))
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Self::Int(i64::try_from(i).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Self::Map(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Value {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::Map(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalars_round_trip() {
        for v in [
            Value::Null,
            Value::Bool(true),
            Value::Int(-7),
            Value::Float(1.5),
            Value::Float(2.0),
            Value::from("hello"),
        ] {
            let back = Value::from_json(v.to_json().unwrap()).unwrap();
            assert_eq!(back, v);
        }
    }

    #[test]
    fn test_bytes_are_inlined_as_base64() {
        let v = Value::Bytes(vec![0, 1, 2, 255]);
        let json = v.to_json().unwrap();
        assert_eq!(json, json!({ "$bytes": "AAEC/w==" }));
        assert_eq!(Value::from_json(json).unwrap(), v);
    }

    #[test]
    fn test_map_with_reserved_key_is_escaped() {
        let v: Value = [("$bytes", Value::from("not really bytes"))]
            .into_iter()
            .collect();
        let json = v.to_json().unwrap();
        assert_eq!(json, json!({ "$map": { "$bytes": "not really bytes" } }));
        assert_eq!(Value::from_json(json).unwrap(), v);
    }

    #[test]
    fn test_map_with_reserved_key_among_others_is_not_escaped() {
        let v: Value = [("$model", Value::from("Todo")), ("title", Value::from("x"))]
            .into_iter()
            .collect();
        let json = v.to_json().unwrap();
        assert_eq!(json, json!({ "$model": "Todo", "title": "x" }));
    }

    #[test]
    fn test_nested_structures() {
        let v: Value = [
            ("items", Value::List(vec![Value::Int(1), Value::Bytes(vec![9])])),
            ("meta", Value::from_iter([("ok", true)])),
        ]
        .into_iter()
        .collect();
        assert_eq!(Value::from_json(v.to_json().unwrap()).unwrap(), v);
    }

    #[test]
    fn test_non_finite_float_rejected() {
        assert_eq!(
            Value::Float(f64::NAN).to_json().unwrap_err(),
            CoreError::NonFiniteFloat
        );
    }

    #[test]
    fn test_blob_tag_unsupported_without_resolver() {
        let err = Value::from_json(json!({ "$blob": { "id": "x" } })).unwrap_err();
        assert_eq!(err, CoreError::UnsupportedTag("$blob".into()));
    }

    #[test]
    fn test_malformed_bytes_tag() {
        assert!(matches!(
            Value::from_json(json!({ "$bytes": 12 })),
            Err(CoreError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_serde_impls_use_tagged_encoding() {
        let v = Value::List(vec![Value::Bytes(vec![1, 2])]);
        let text = serde_json::to_string(&v).unwrap();
        assert_eq!(text, r#"[{"$bytes":"AQI="}]"#);
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back, v);
    }
}

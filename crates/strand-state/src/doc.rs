//! Conversions between plain [`Value`]s and the automerge document.

use automerge::{AutoCommit, ObjId, ObjType, Prop, ReadDoc, ScalarValue};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use strand_core::value::Map;
use strand_core::{CoreError, Value};

use crate::error::{StateError, StateResult};

/// Scalar form of a non-compound value.
pub(crate) fn to_scalar(value: &Value) -> StateResult<ScalarValue> {
    Ok(match value {
        Value::Null => ScalarValue::Null,
        Value::Bool(b) => ScalarValue::Boolean(*b),
        Value::Int(i) => ScalarValue::Int(*i),
        Value::Float(f) if f.is_finite() => ScalarValue::F64(*f),
        Value::Float(_) => return Err(CoreError::NonFiniteFloat.into()),
        Value::String(s) => ScalarValue::from(s.as_str()),
        Value::Bytes(b) => ScalarValue::Bytes(b.clone()),
        Value::List(_) | Value::Map(_) => {
            return Err(StateError::InvalidOperation(format!(
                "{} is not a scalar",
                value.type_name()
            )));
        },
    })
}

/// Plain form of a document scalar.
pub(crate) fn from_scalar(scalar: &ScalarValue) -> Value {
    match scalar {
        ScalarValue::Null => Value::Null,
        ScalarValue::Boolean(b) => Value::Bool(*b),
        ScalarValue::Int(i) | ScalarValue::Timestamp(i) => Value::Int(*i),
        ScalarValue::Uint(u) => Value::from(*u),
        ScalarValue::F64(f) => Value::Float(*f),
        ScalarValue::Str(s) => Value::String(s.to_string()),
        ScalarValue::Bytes(b) => Value::Bytes(b.clone()),
        other => other.to_i64().map_or(Value::Null, Value::Int),
    }
}

/// Flatten the object `obj` into plain data.
pub(crate) fn read_obj(doc: &AutoCommit, obj: &ObjId) -> StateResult<Value> {
    match doc.object_type(obj)? {
        ObjType::Map | ObjType::Table => {
            let mut map = Map::new();
            for key in doc.keys(obj).collect::<Vec<_>>() {
                if let Some(value) = read_prop(doc, obj, key.as_str())? {
                    map.insert(key, value);
                }
            }
            Ok(Value::Map(map))
        },
        ObjType::List => (0..doc.length(obj))
            .map(|index| read_prop(doc, obj, index).map(Option::unwrap_or_default))
            .collect::<StateResult<Vec<_>>>()
            .map(Value::List),
        ObjType::Text => Ok(Value::String(doc.text(obj)?)),
    }
}

/// Flatten whatever sits at `prop` of `obj`.
pub(crate) fn read_prop(
    doc: &AutoCommit,
    obj: &ObjId,
    prop: impl Into<Prop>,
) -> StateResult<Option<Value>> {
    match doc.get(obj, prop)? {
        None => Ok(None),
        Some((automerge::Value::Object(_), child)) => read_obj(doc, &child).map(Some),
        Some((automerge::Value::Scalar(scalar), _)) => Ok(Some(from_scalar(&scalar))),
    }
}

/// The compound child at `prop` of `obj`, if there is one.
pub(crate) fn child_obj(
    doc: &AutoCommit,
    obj: &ObjId,
    prop: impl Into<Prop>,
) -> Option<(ObjId, ObjType)> {
    match doc.get(obj, prop) {
        Ok(Some((automerge::Value::Object(kind), child))) => Some((child, kind)),
        _ => None,
    }
}

/// Updates travel as base64 strings so they never become blob references.
pub(crate) fn encode_update(bytes: &[u8]) -> Value {
    Value::String(STANDARD.encode(bytes))
}

/// Inverse of [`encode_update`].
pub(crate) fn decode_update(value: &Value) -> StateResult<Vec<u8>> {
    let text = value
        .as_str()
        .ok_or_else(|| CoreError::InvalidEncoding("update is not a string".into()))?;
    STANDARD
        .decode(text)
        .map_err(|e| CoreError::InvalidEncoding(e.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use automerge::ROOT;
    use automerge::transaction::Transactable;

    #[test]
    fn test_scalars_survive_the_document() {
        let mut doc = AutoCommit::new();
        let values = [
            ("null", Value::Null),
            ("flag", Value::Bool(true)),
            ("n", Value::Int(-4)),
            ("ratio", Value::Float(0.25)),
            ("name", Value::from("strand")),
            ("raw", Value::Bytes(vec![0, 255])),
        ];
        for (key, value) in &values {
            doc.put(&ROOT, *key, to_scalar(value).unwrap()).unwrap();
        }
        for (key, value) in &values {
            assert_eq!(read_prop(&doc, &ROOT, *key).unwrap().as_ref(), Some(value));
        }
    }

    #[test]
    fn test_nested_objects_flatten() {
        let mut doc = AutoCommit::new();
        let list = doc.put_object(&ROOT, "items", ObjType::List).unwrap();
        doc.insert(&list, 0, ScalarValue::Int(1)).unwrap();
        let inner = doc.insert_object(&list, 1, ObjType::Map).unwrap();
        doc.put(&inner, "k", "v").unwrap();

        let expected = Value::from_iter([(
            "items",
            Value::List(vec![Value::Int(1), Value::from_iter([("k", "v")])]),
        )]);
        assert_eq!(read_obj(&doc, &ROOT).unwrap(), expected);
        assert!(child_obj(&doc, &ROOT, "items").is_some());
    }

    #[test]
    fn test_non_finite_float_rejected() {
        assert!(matches!(
            to_scalar(&Value::Float(f64::INFINITY)),
            Err(StateError::Core(CoreError::NonFiniteFloat))
        ));
    }

    #[test]
    fn test_update_encoding_round_trip() {
        let encoded = encode_update(&[1, 2, 3]);
        assert_eq!(decode_update(&encoded).unwrap(), vec![1, 2, 3]);
        assert!(decode_update(&Value::Int(1)).is_err());
    }
}

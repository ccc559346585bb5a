//! Payload codec: `serialize(value) -> bytes` and
//! `deserialize(map: name -> bytes) -> runtime_value`. The framework only
//! requires a round-trip law over whatever values the codec supports; this
//! repo's concrete codec operates over `ScriptValue`, a small enum mirroring
//! the subset of Python values `pyo3` round-trips losslessly through JSON.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A host-side stand-in for a Python value, used at the serialize/output and
/// input/deserialize boundary so the codec doesn't need the GIL.
///
/// Adjacently tagged (not `untagged`): `List(Vec<ScriptValue>)` and
/// `Bytes(Vec<u8>)` would otherwise both encode to a bare JSON array of
/// numbers, making decode ambiguous and order-dependent (`Bytes` would
/// shadow `List` on any all-integer list, breaking the round-trip law for
/// an ordinary `return [1, 2, 3]`). The explicit `type` tag makes every
/// variant self-describing regardless of its payload shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ScriptValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<ScriptValue>),
    Map(IndexMap<String, ScriptValue>),
}

impl Default for ScriptValue {
    fn default() -> Self {
        ScriptValue::None
    }
}

/// Fatal codec failure: malformed bytes, or a value shape the codec doesn't
/// support.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("failed to encode a script value: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode a script value for source '{source_name}': {source}")]
    Decode {
        source_name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// `serialize(value) -> bytes` / `deserialize(map: name -> bytes) -> value`.
/// `Map` is the runtime mapping keyed by source name that a deserialize
/// step hands to the first script step.
pub trait Codec: Send + Sync {
    fn serialize(&self, value: &ScriptValue) -> Result<Vec<u8>, CodecError>;
    fn deserialize(
        &self,
        by_source: &IndexMap<String, Vec<u8>>,
    ) -> Result<ScriptValue, CodecError>;
}

/// JSON-backed codec. Every value is wrapped in `ScriptValue`'s `type`/`value`
/// tag, so a `Bytes` payload (itself a JSON array of numbers, same as
/// `Vec<u8>`'s default serde representation) is never mistaken for a `List`.
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn serialize(&self, value: &ScriptValue) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(CodecError::Encode)
    }

    fn deserialize(
        &self,
        by_source: &IndexMap<String, Vec<u8>>,
    ) -> Result<ScriptValue, CodecError> {
        let mut out: IndexMap<String, ScriptValue> = IndexMap::with_capacity(by_source.len());
        for (name, bytes) in by_source {
            let value: ScriptValue =
                serde_json::from_slice(bytes).map_err(|source| CodecError::Decode {
                    source_name: name.clone(),
                    source,
                })?;
            out.insert(name.clone(), value);
        }
        Ok(ScriptValue::Map(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scalars() {
        let codec = JsonCodec;
        for value in [
            ScriptValue::None,
            ScriptValue::Bool(true),
            ScriptValue::Int(-42),
            ScriptValue::Float(3.5),
            ScriptValue::Str("hello".into()),
        ] {
            let bytes = codec.serialize(&value).unwrap();
            let mut map = IndexMap::new();
            map.insert("a".to_string(), bytes);
            let decoded = codec.deserialize(&map).unwrap();
            let ScriptValue::Map(m) = decoded else {
                panic!("expected a Map");
            };
            assert_eq!(m.get("a").unwrap(), &value);
        }
    }

    #[test]
    fn round_trips_nested_structures() {
        let codec = JsonCodec;
        let mut nested = IndexMap::new();
        nested.insert("x".to_string(), ScriptValue::Int(1));
        let value = ScriptValue::List(vec![ScriptValue::Map(nested), ScriptValue::Str("y".into())]);
        let bytes = codec.serialize(&value).unwrap();
        let mut map = IndexMap::new();
        map.insert("src".to_string(), bytes);
        let decoded = codec.deserialize(&map).unwrap();
        let ScriptValue::Map(m) = decoded else {
            panic!("expected a Map");
        };
        assert_eq!(m.get("src").unwrap(), &value);
    }

    #[test]
    fn deserialize_builds_one_key_per_source() {
        let codec = JsonCodec;
        let mut map = IndexMap::new();
        map.insert("a".to_string(), codec.serialize(&ScriptValue::Int(1)).unwrap());
        map.insert("b".to_string(), codec.serialize(&ScriptValue::Int(2)).unwrap());
        let decoded = codec.deserialize(&map).unwrap();
        let ScriptValue::Map(m) = decoded else {
            panic!("expected a Map");
        };
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn a_list_of_ints_round_trips_as_a_list_not_bytes() {
        let codec = JsonCodec;
        let value = ScriptValue::List(vec![ScriptValue::Int(1), ScriptValue::Int(2)]);
        let bytes = codec.serialize(&value).unwrap();
        let mut map = IndexMap::new();
        map.insert("a".to_string(), bytes);
        let decoded = codec.deserialize(&map).unwrap();
        let ScriptValue::Map(m) = decoded else {
            panic!("expected a Map");
        };
        assert_eq!(m.get("a").unwrap(), &value);
    }

    #[test]
    fn bytes_round_trip_distinctly_from_an_equal_length_int_list() {
        let codec = JsonCodec;
        let bytes_value = ScriptValue::Bytes(vec![1, 2]);
        let bytes = codec.serialize(&bytes_value).unwrap();
        let mut map = IndexMap::new();
        map.insert("a".to_string(), bytes);
        let decoded = codec.deserialize(&map).unwrap();
        let ScriptValue::Map(m) = decoded else {
            panic!("expected a Map");
        };
        assert_eq!(m.get("a").unwrap(), &bytes_value);
    }

    #[test]
    fn malformed_bytes_name_the_source() {
        let codec = JsonCodec;
        let mut map = IndexMap::new();
        map.insert("bad-source".to_string(), b"{not json".to_vec());
        let err = codec.deserialize(&map).unwrap_err();
        match err {
            CodecError::Decode { source_name, .. } => assert_eq!(source_name, "bad-source"),
            _ => panic!("expected Decode error"),
        }
    }
}

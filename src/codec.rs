//! Wire codec for `FieldValue` records (spec §4.A).
//!
//! A record is a nested map of string keys to scalars, byte strings,
//! lists, or nested maps. `encode` serializes it to JSON (internally
//! tagged so byte-strings and text-strings never collapse into the same
//! shape) and base64-wraps the result so the wire bytes stay ASCII-clean,
//! mirroring the original's `dict_to_b64`/`b64_to_dict` helpers.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// A scalar or composite value in a wire record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum FieldValue {
    Text(String),
    Bytes(#[serde(with = "bytes_as_base64")] Vec<u8>),
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<FieldValue>),
    Map(Record),
}

/// A record: string keys to `FieldValue`s. `BTreeMap` keeps key order
/// deterministic so `encode` is deterministic for a given input structure.
pub type Record = BTreeMap<String, FieldValue>;

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Int(n)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(b: Vec<u8>) -> Self {
        FieldValue::Bytes(b)
    }
}

mod bytes_as_base64 {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        BASE64
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Encodes a record to base64-wrapped, ASCII-clean wire bytes.
pub fn encode(record: &Record) -> Vec<u8> {
    let json = serde_json::to_vec(record).expect("Record serialization is infallible");
    BASE64.encode(json).into_bytes()
}

/// Decodes wire bytes produced by `encode` back into a record.
pub fn decode(bytes: &[u8]) -> Result<Record, CodecError> {
    let json = BASE64.decode(bytes)?;
    let record = serde_json::from_slice(&json)?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> Record {
        let mut inner = Record::new();
        inner.insert("nested".to_string(), FieldValue::Bool(true));

        let mut record = Record::new();
        record.insert("text".to_string(), FieldValue::Text("hello".to_string()));
        record.insert(
            "raw".to_string(),
            FieldValue::Bytes(vec![0, 159, 146, 150]),
        );
        record.insert("count".to_string(), FieldValue::Int(42));
        record.insert("ratio".to_string(), FieldValue::Float(0.5));
        record.insert(
            "list".to_string(),
            FieldValue::Array(vec![FieldValue::Int(1), FieldValue::Int(2)]),
        );
        record.insert("map".to_string(), FieldValue::Map(inner));
        record
    }

    #[test]
    fn round_trips_scalars_bytes_lists_and_maps() {
        let record = sample_record();
        let wire = encode(&record);
        let decoded = decode(&wire).expect("decode succeeds");
        assert_eq!(record, decoded);
    }

    #[test]
    fn wire_bytes_are_ascii_clean() {
        let wire = encode(&sample_record());
        assert!(wire.iter().all(|b| b.is_ascii()));
    }

    #[test]
    fn encode_is_deterministic_for_same_structure() {
        let a = encode(&sample_record());
        let b = encode(&sample_record());
        assert_eq!(a, b);
    }

    #[test]
    fn byte_strings_and_text_strings_stay_distinct() {
        let mut record = Record::new();
        record.insert(
            "value".to_string(),
            FieldValue::Bytes(b"hello".to_vec()),
        );
        let decoded = decode(&encode(&record)).unwrap();
        assert_eq!(decoded.get("value").unwrap().as_bytes(), Some(&b"hello"[..]));
        assert_eq!(decoded.get("value").unwrap().as_text(), None);
    }

    #[test]
    fn decode_rejects_invalid_base64() {
        let err = decode(b"not-valid-base64!!!").unwrap_err();
        matches!(err, CodecError::Base64(_));
        let _ = err;
    }
}

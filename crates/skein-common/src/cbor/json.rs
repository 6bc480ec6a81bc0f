//! Conversion between DAG-CBOR values and the atproto JSON representation.
//!
//! Links are written as `{"$link": "<cid>"}` and byte strings as
//! `{"$bytes": "<base64>"}`. Every other shape maps across structurally.
//! JSON floats have no DAG-CBOR counterpart here and are rejected.

use super::{CborError, DagCborValue};
use crate::types::cid::Cid;
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use bytes::Bytes;
use serde_json::{Map, Number, Value};
use smol_str::SmolStr;

/// Convert a JSON value into a DAG-CBOR value
pub fn from_json(json: &Value) -> Result<DagCborValue, CborError> {
    Ok(match json {
        Value::Null => DagCborValue::Null,
        Value::Bool(b) => DagCborValue::Bool(*b),
        Value::Number(n) => number_to_cbor(n)?,
        Value::String(s) => DagCborValue::Text(SmolStr::new(s)),
        Value::Array(items) => {
            DagCborValue::Array(items.iter().map(from_json).collect::<Result<_, _>>()?)
        }
        Value::Object(obj) => {
            if let Some(value) = special_object(obj)? {
                value
            } else {
                let mut entries = Vec::with_capacity(obj.len());
                for (k, v) in obj {
                    entries.push((SmolStr::new(k), from_json(v)?));
                }
                DagCborValue::Map(entries)
            }
        }
    })
}

fn number_to_cbor(n: &Number) -> Result<DagCborValue, CborError> {
    if let Some(u) = n.as_u64() {
        Ok(DagCborValue::UnsignedInt(u))
    } else if let Some(i) = n.as_i64() {
        Ok(DagCborValue::integer(i))
    } else {
        Err(CborError::InvalidJson(format!(
            "floating point number {} is not allowed",
            n
        )))
    }
}

fn special_object(obj: &Map<String, Value>) -> Result<Option<DagCborValue>, CborError> {
    if obj.len() != 1 {
        return Ok(None);
    }

    if let Some(Value::String(link)) = obj.get("$link") {
        let cid = link
            .parse::<Cid>()
            .map_err(|e| CborError::InvalidJson(format!("bad $link {}: {}", link, e)))?;
        return Ok(Some(DagCborValue::Link(cid)));
    }

    if let Some(Value::String(encoded)) = obj.get("$bytes") {
        let trimmed = encoded.trim_end_matches('=');
        let raw = STANDARD_NO_PAD
            .decode(trimmed)
            .map_err(|e| CborError::InvalidJson(format!("bad $bytes: {}", e)))?;
        return Ok(Some(DagCborValue::Bytes(Bytes::from(raw))));
    }

    Ok(None)
}

/// Convert a DAG-CBOR value into JSON
pub fn to_json(value: &DagCborValue) -> Value {
    match value {
        DagCborValue::Null => Value::Null,
        DagCborValue::Bool(b) => Value::Bool(*b),
        DagCborValue::UnsignedInt(n) => Value::Number((*n).into()),
        DagCborValue::NegativeInt(n) => Value::Number((*n).into()),
        DagCborValue::Text(s) => Value::String(s.to_string()),
        DagCborValue::Bytes(b) => {
            let mut obj = Map::new();
            obj.insert("$bytes".into(), Value::String(STANDARD_NO_PAD.encode(b)));
            Value::Object(obj)
        }
        DagCborValue::Array(items) => Value::Array(items.iter().map(to_json).collect()),
        DagCborValue::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), to_json(v)))
                .collect(),
        ),
        DagCborValue::Link(cid) => {
            let mut obj = Map::new();
            obj.insert("$link".into(), Value::String(cid.to_string()));
            Value::Object(obj)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cbor::{decode, encode};
    use serde_json::json;

    #[test]
    fn test_post_record_from_json() {
        let json = json!({
            "$type": "app.bsky.feed.post",
            "text": "hello",
            "createdAt": "2024-01-01T00:00:00.000Z",
            "langs": ["en"],
            "reply": null,
            "likes": 3,
            "delta": -2
        });
        let value = from_json(&json).unwrap();
        assert_eq!(value.get("text").and_then(|t| t.as_str()), Some("hello"));
        assert_eq!(value.get("likes"), Some(&DagCborValue::UnsignedInt(3)));
        assert_eq!(value.get("delta"), Some(&DagCborValue::NegativeInt(-2)));
        assert!(value.get("reply").unwrap().is_null());

        let back = to_json(&decode(&encode(&value)).unwrap());
        assert_eq!(back, json);
    }

    #[test]
    fn test_link_object() {
        let cid = Cid::for_raw_bytes(b"image bytes");
        let json = json!({"image": {"$link": cid.to_string()}});
        let value = from_json(&json).unwrap();
        assert_eq!(value.get("image"), Some(&DagCborValue::Link(cid)));
        assert_eq!(to_json(&value), json);
    }

    #[test]
    fn test_bytes_object() {
        let json = json!({"$bytes": "AAEC/w"});
        let value = from_json(&json).unwrap();
        assert_eq!(value, DagCborValue::Bytes(Bytes::from_static(&[0, 1, 2, 255])));
        assert_eq!(to_json(&value), json);

        // some producers pad
        let padded = json!({"$bytes": "AAEC/w=="});
        assert_eq!(from_json(&padded).unwrap(), value);
    }

    #[test]
    fn test_link_with_extra_keys_is_a_map() {
        let json = json!({"$link": "not-a-cid", "other": 1});
        let value = from_json(&json).unwrap();
        assert!(value.as_map().is_some());
    }

    #[test]
    fn test_bad_link_rejected() {
        assert!(from_json(&json!({"$link": "zzzz"})).is_err());
    }

    #[test]
    fn test_floats_rejected() {
        assert!(matches!(
            from_json(&json!({"ratio": 0.5})),
            Err(CborError::InvalidJson(_))
        ));
    }
}

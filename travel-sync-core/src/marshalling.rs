//! Value marshalling between domain objects and tree leaves.
//!
//! Leaves hold JSON text. Snapshots produced by
//! [`Store::get_data`](crate::Store::get_data) are `serde_json::Value`
//! trees where a leaf is a string and a node with both a value and children
//! is an object carrying its value under `"_"`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::key::VALUE_KEY;

/// Errors converting between leaves and typed values.
#[derive(Error, Debug)]
pub enum MarshalError {
    #[error("Failed to serialize value: {0}")]
    Serialize(serde_json::Error),

    #[error("Failed to parse persisted value: {0}")]
    Parse(serde_json::Error),

    #[error("Unexpected persisted object {0}")]
    UnexpectedObject(String),
}

/// Serializes a value into leaf text.
pub fn marshal<T: Serialize + ?Sized>(value: &T) -> Result<String, MarshalError> {
    serde_json::to_string(value).map_err(MarshalError::Serialize)
}

/// Parses leaf text.
pub fn unmarshal<T: DeserializeOwned>(leaf: &str) -> Result<T, MarshalError> {
    serde_json::from_str(leaf).map_err(MarshalError::Parse)
}

/// Reads a typed value out of a snapshot entry.
///
/// Returns `Ok(None)` when the entry is absent or has no value of its own.
pub fn read_value<T: DeserializeOwned>(entry: Option<&Value>) -> Result<Option<T>, MarshalError> {
    let leaf = match entry {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Object(map)) => match map.get(VALUE_KEY) {
            None => return Ok(None),
            Some(inner) => inner,
        },
        Some(other) => other,
    };

    match leaf {
        Value::String(text) => unmarshal(text).map(Some),
        Value::Object(_) | Value::Array(_) => {
            Err(MarshalError::UnexpectedObject(leaf.to_string()))
        }
        // Non-string scalars are already decoded.
        scalar => serde_json::from_value(scalar.clone())
            .map(Some)
            .map_err(MarshalError::Parse),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_marshal_string_list() {
        let ids = vec!["d1".to_string(), "d2".to_string()];
        assert_eq!(marshal(&ids).unwrap(), r#"["d1","d2"]"#);
    }

    #[test]
    fn test_unmarshal_rejects_garbage() {
        assert!(unmarshal::<Vec<String>>("not json").is_err());
    }

    #[test]
    fn test_read_value_bare_leaf() {
        let entry = json!(r#"["a","b"]"#);
        let ids: Option<Vec<String>> = read_value(Some(&entry)).unwrap();
        assert_eq!(ids, Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn test_read_value_mixed_node() {
        let entry = json!({ "_": r#"["a"]"#, "a": { "place": "{}" } });
        let ids: Option<Vec<String>> = read_value(Some(&entry)).unwrap();
        assert_eq!(ids, Some(vec!["a".to_string()]));
    }

    #[test]
    fn test_read_value_container_without_value() {
        let entry = json!({ "a": { "place": "{}" } });
        let ids: Option<Vec<String>> = read_value(Some(&entry)).unwrap();
        assert!(ids.is_none());
        assert!(read_value::<Vec<String>>(None).unwrap().is_none());
    }

    #[test]
    fn test_read_value_nested_object_is_corrupt() {
        let entry = json!({ "_": { "oops": true } });
        let err = read_value::<Vec<String>>(Some(&entry)).unwrap_err();
        assert!(matches!(err, MarshalError::UnexpectedObject(_)));
    }
}

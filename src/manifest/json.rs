//! Typed extraction over permissively-parsed JSON manifests.
//!
//! Manifests are written in a relaxed JSON dialect (unquoted keys, trailing
//! commas, single quotes). The whole document is parsed once into a dynamic
//! tree; everything after that entry point is strongly typed field
//! extraction that reports errors with a full path (`libraries[0].uses[1]`)
//! and rejects unknown keys with a did-you-mean against the known-key set.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::dym::did_you_mean;

#[derive(Error, Debug)]
pub enum WalkError {
    #[error("manifest is not valid JSON5: {0}")]
    Syntax(String),

    #[error("{path}: expected {expected}, found {found}")]
    WrongType {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("{path}: missing required key {key:?}")]
    MissingKey { path: String, key: &'static str },

    #[error("{path}: unknown key {key:?}{}", suggestion_suffix(.suggestion))]
    UnknownKey {
        path: String,
        key: String,
        suggestion: Option<String>,
    },

    #[error("{path}: unknown value {value:?}, expected one of {known:?}{}", suggestion_suffix(.suggestion))]
    UnknownVariant {
        path: String,
        value: String,
        known: &'static [&'static str],
        suggestion: Option<String>,
    },

    #[error("{path}: {message}")]
    Invalid { path: String, message: String },
}

fn suggestion_suffix(s: &Option<String>) -> String {
    match s {
        Some(name) => format!(" (did you mean {name:?}?)"),
        None => String::new(),
    }
}

/// Parse the permissive dialect into a dynamic tree. The single entry point
/// for dynamic data; everything downstream is typed.
pub fn parse_text(text: &str) -> Result<Value, WalkError> {
    json5::from_str(text).map_err(|e| WalkError::Syntax(e.to_string()))
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a mapping",
    }
}

pub fn mapping<'v>(v: &'v Value, path: &str) -> Result<&'v Map<String, Value>, WalkError> {
    v.as_object().ok_or_else(|| WalkError::WrongType {
        path: path.to_string(),
        expected: "a mapping",
        found: type_name(v),
    })
}

pub fn array<'v>(v: &'v Value, path: &str) -> Result<&'v [Value], WalkError> {
    v.as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| WalkError::WrongType {
            path: path.to_string(),
            expected: "an array",
            found: type_name(v),
        })
}

pub fn string<'v>(v: &'v Value, path: &str) -> Result<&'v str, WalkError> {
    v.as_str().ok_or_else(|| WalkError::WrongType {
        path: path.to_string(),
        expected: "a string",
        found: type_name(v),
    })
}

pub fn integer(v: &Value, path: &str) -> Result<u64, WalkError> {
    v.as_u64().ok_or_else(|| WalkError::WrongType {
        path: path.to_string(),
        expected: "a non-negative integer",
        found: type_name(v),
    })
}

/// Fetch a required key from a mapping.
pub fn required<'v>(
    map: &'v Map<String, Value>,
    key: &'static str,
    path: &str,
) -> Result<&'v Value, WalkError> {
    map.get(key).ok_or_else(|| WalkError::MissingKey {
        path: path.to_string(),
        key,
    })
}

/// Reject any key of `map` outside `known`, suggesting the closest known key.
pub fn check_keys(
    map: &Map<String, Value>,
    known: &'static [&'static str],
    path: &str,
) -> Result<(), WalkError> {
    for key in map.keys() {
        if !known.contains(&key.as_str()) {
            return Err(WalkError::UnknownKey {
                path: path.to_string(),
                key: key.clone(),
                suggestion: did_you_mean(key, known.iter().copied()).map(str::to_string),
            });
        }
    }
    Ok(())
}

/// Parse an enum-valued field by exact lowercase match over `known`,
/// falling back to a did-you-mean suggestion.
pub fn variant(
    v: &Value,
    known: &'static [&'static str],
    path: &str,
) -> Result<&'static str, WalkError> {
    let s = string(v, path)?;
    if let Some(hit) = known.iter().find(|k| **k == s) {
        return Ok(hit);
    }
    Err(WalkError::UnknownVariant {
        path: path.to_string(),
        value: s.to_string(),
        known,
        suggestion: did_you_mean(s, known.iter().copied()).map(str::to_string),
    })
}

/// Wrap a domain parse error with the path it occurred at.
pub fn invalid(path: &str, err: impl std::fmt::Display) -> WalkError {
    WalkError::Invalid {
        path: path.to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_relaxed_syntax() {
        let v = parse_text("{ name: 'zlib', version: \"1.2.13\", }").unwrap();
        let map = mapping(&v, "$").unwrap();
        assert_eq!(string(map.get("name").unwrap(), "$.name").unwrap(), "zlib");
    }

    #[test]
    fn unknown_key_gets_suggestion() {
        let v = parse_text("{ nane: 'x' }").unwrap();
        let map = mapping(&v, "$").unwrap();
        let err = check_keys(map, &["name", "version"], "$").unwrap_err();
        match err {
            WalkError::UnknownKey {
                key, suggestion, ..
            } => {
                assert_eq!(key, "nane");
                assert_eq!(suggestion.as_deref(), Some("name"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn variant_suggests_close_match() {
        let v = Value::String("lob".to_string());
        let err = variant(&v, &["lib", "test", "app"], "$.kind").unwrap_err();
        match err {
            WalkError::UnknownVariant { suggestion, .. } => {
                assert_eq!(suggestion.as_deref(), Some("lib"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn type_errors_carry_paths() {
        let v = parse_text("{ libraries: 42 }").unwrap();
        let map = mapping(&v, "$").unwrap();
        let err = array(map.get("libraries").unwrap(), "$.libraries").unwrap_err();
        assert!(err.to_string().contains("$.libraries"));
        assert!(err.to_string().contains("a number"));
    }
}

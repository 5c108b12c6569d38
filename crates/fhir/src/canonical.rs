//! Canonical JSON and content hashing.
//!
//! The audit ledger stores only a hash of each record, so the hash must be a pure function of
//! the record's content. The canonical form is:
//! - the value serialised through `serde_json` into a JSON tree
//! - object keys sorted by byte order at every depth
//! - no insignificant whitespace
//! - strings and numbers rendered exactly as `serde_json` renders them
//! - array order preserved
//!
//! The hash is SHA-256 over the canonical UTF-8 bytes, rendered as `0x` followed by 64 lowercase
//! hex digits. Comparison is exact and case-sensitive.

use crate::{FhirError, FhirResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Render `value` in canonical JSON form.
///
/// # Errors
///
/// Returns [`FhirError::InvalidJson`] if `value` cannot be represented as JSON
/// (for example a map with non-string keys).
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> FhirResult<String> {
    let tree = serde_json::to_value(value)?;
    let mut out = String::new();
    write_canonical(&tree, &mut out)?;
    Ok(out)
}

/// Compute the content hash of `value`'s canonical JSON form.
///
/// # Errors
///
/// Returns [`FhirError::InvalidJson`] if `value` cannot be serialised.
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> FhirResult<ContentHash> {
    let canonical = canonical_json(value)?;
    Ok(ContentHash::of_bytes(canonical.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) -> FhirResult<()> {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            out.push_str(&serde_json::to_string(value)?);
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(&map[key], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

/// A `0x`-prefixed lowercase hex SHA-256 digest.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    const PREFIX: &'static str = "0x";

    /// Hash raw bytes.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(format!("{}{}", Self::PREFIX, hex::encode(digest)))
    }

    /// Validate a hash string produced elsewhere (for example read back from the ledger).
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::InvalidInput`] unless `input` is `0x` followed by exactly 64
    /// lowercase hex digits.
    pub fn parse(input: &str) -> FhirResult<Self> {
        let digits = input.strip_prefix(Self::PREFIX).ok_or_else(|| {
            FhirError::InvalidInput(format!("content hash must start with 0x: {input}"))
        })?;
        let ok = digits.len() == 64
            && digits
                .bytes()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !ok {
            return Err(FhirError::InvalidInput(format!(
                "content hash must be 64 lowercase hex digits: {input}"
            )));
        }
        Ok(Self(input.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ContentHash::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Observation, ResourceId, StructuredRecord};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use triage_types::SubjectId;

    fn record(narrative: &str) -> StructuredRecord {
        let at = Utc.with_ymd_and_hms(2026, 1, 11, 14, 35, 22).unwrap();
        Observation::assessment_narrative(
            ResourceId::parse("obs-1").unwrap(),
            &SubjectId::new("patient-abc").unwrap(),
            narrative,
            at,
        )
        .into()
    }

    #[test]
    fn test_canonical_json_sorts_keys_at_every_depth() {
        let value = json!({"b": 1, "a": {"z": [3, {"y": 1, "x": 2}], "m": null}});
        assert_eq!(
            canonical_json(&value).unwrap(),
            r#"{"a":{"m":null,"z":[3,{"x":2,"y":1}]},"b":1}"#
        );
    }

    #[test]
    fn test_canonical_json_ignores_source_key_order() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":"two"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{ "y" : "two",  "x" : 1 }"#).unwrap();
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn test_hash_is_stable_for_identical_records() {
        let first = record("Sharp chest pain").content_hash().unwrap();
        let second = record("Sharp chest pain").content_hash().unwrap();
        assert_eq!(first, second);
        assert!(first.as_str().starts_with("0x"));
        assert_eq!(first.as_str().len(), 66);
    }

    #[test]
    fn test_hash_changes_when_any_field_changes() {
        let base = record("Sharp chest pain");
        let mut changed = base.clone();
        if let StructuredRecord::Observation(o) = &mut changed {
            o.value_string.push('.');
        }
        assert_ne!(base.content_hash().unwrap(), changed.content_hash().unwrap());

        let mut retimed = base.clone();
        if let StructuredRecord::Observation(o) = &mut retimed {
            o.issued = o.issued + chrono::Duration::milliseconds(1);
        }
        assert_ne!(base.content_hash().unwrap(), retimed.content_hash().unwrap());
    }

    #[test]
    fn test_hash_survives_storage_round_trip() {
        let original = record("Sharp chest pain");
        let stored = original.to_json_pretty().unwrap();
        let reloaded = StructuredRecord::parse_json(&stored).unwrap();
        assert_eq!(
            original.content_hash().unwrap(),
            reloaded.content_hash().unwrap()
        );
    }

    #[test]
    fn test_parse_is_case_sensitive() {
        let hash = ContentHash::of_bytes(b"abc");
        assert!(ContentHash::parse(hash.as_str()).is_ok());
        assert!(ContentHash::parse(&hash.as_str().to_uppercase()).is_err());
        assert!(ContentHash::parse("0x1234").is_err());
    }
}

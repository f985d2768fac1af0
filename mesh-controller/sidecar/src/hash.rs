//! Content hashes of document sub-trees.
//!
//! The hash is taken over the JSON form: zero values (null, false, 0, empty strings, arrays
//! and objects) are skipped, object keys are visited in order and arrays are hashed as sets,
//! so that reordering a list or adding an empty field leaves the hash unchanged.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

type Sum = [u8; 32];

/// Hashes a value, folding the digest to a `u64`. Zero values hash to 0.
pub fn hash<T: Serialize>(value: &T) -> Result<u64, serde_json::Error> {
    Ok(fold(digest(&serde_json::to_value(value)?)))
}

/// Hashes a document together with the plugin set version its chains were resolved against.
pub(crate) fn document_hash<T: Serialize>(
    doc: &T,
    plugin_set_version: &str,
) -> Result<u64, serde_json::Error> {
    let mut value = serde_json::to_value(doc)?;
    if let Value::Object(fields) = &mut value {
        fields.insert(
            "PluginSetV".to_string(),
            Value::String(plugin_set_version.to_string()),
        );
    }
    Ok(fold(digest(&value)))
}

fn fold(sum: Option<Sum>) -> u64 {
    let Some(sum) = sum else {
        return 0;
    };
    let mut head = [0u8; 8];
    head.copy_from_slice(&sum[..8]);
    u64::from_be_bytes(head)
}

fn digest(value: &Value) -> Option<Sum> {
    let mut h = Sha256::new();
    match value {
        Value::Null | Value::Bool(false) => return None,
        Value::Bool(true) => h.update(b"b"),
        Value::Number(n) => {
            if n.as_f64() == Some(0.0) {
                return None;
            }
            h.update(b"n");
            h.update(n.to_string());
        }
        Value::String(s) => {
            if s.is_empty() {
                return None;
            }
            h.update(b"s");
            h.update(s);
        }
        Value::Array(items) => {
            if items.is_empty() {
                return None;
            }
            let mut sums = items
                .iter()
                .map(|item| digest(item).unwrap_or_default())
                .collect::<Vec<_>>();
            sums.sort_unstable();
            sums.dedup();
            h.update(b"a");
            for sum in sums {
                h.update(sum);
            }
        }
        Value::Object(fields) => {
            let mut keys = fields.keys().collect::<Vec<_>>();
            keys.sort_unstable();
            let mut empty = true;
            h.update(b"o");
            for key in keys {
                if let Some(sum) = digest(&fields[key.as_str()]) {
                    empty = false;
                    h.update((key.len() as u64).to_be_bytes());
                    h.update(key);
                    h.update(sum);
                }
            }
            if empty {
                return None;
            }
        }
    }
    let mut sum = Sum::default();
    sum.copy_from_slice(&h.finalize());
    Some(sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn zero_values_are_skipped() {
        let a = hash(&json!({ "Weight": 100, "Key": "" })).unwrap();
        let b = hash(&json!({ "Weight": 100, "Path": null, "Tags": [], "Extra": {} })).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, hash(&json!({ "Weight": 50 })).unwrap());
        assert_eq!(hash(&json!({ "Enabled": false })).unwrap(), 0);
    }

    #[test]
    fn arrays_are_sets() {
        let a = hash(&json!({ "Methods": ["GET", "POST"] })).unwrap();
        let b = hash(&json!({ "Methods": ["POST", "GET", "GET"] })).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn keys_are_significant() {
        let a = hash(&json!({ "a": "x" })).unwrap();
        let b = hash(&json!({ "b": "x" })).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn plugin_version_changes_document_hash() {
        let doc = json!({ "Metrics": true });
        assert_ne!(
            document_hash(&doc, "1").unwrap(),
            document_hash(&doc, "2").unwrap()
        );
        assert_eq!(document_hash(&doc, "").unwrap(), hash(&doc).unwrap());
    }
}

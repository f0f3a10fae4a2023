//! Stable short identities for configurations.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::Config;

/// Number of hex characters kept from the digest.
pub const FINGERPRINT_LEN: usize = 8;

/// Copy of `root` without the given dot-path keys. Paths that do not exist
/// are ignored.
pub fn remove_keys<S: AsRef<str>>(root: &Value, keys: &[S]) -> Value {
    let mut out = root.clone();
    for key in keys {
        let mut parts: Vec<&str> = key.as_ref().split('.').collect();
        let Some(leaf) = parts.pop() else { continue };
        let parent = parts
            .iter()
            .try_fold(&mut out, |node, part| node.as_object_mut()?.get_mut(*part));
        if let Some(Value::Object(map)) = parent {
            map.remove(leaf);
        }
    }
    out
}

/// Serialize with mapping keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(val, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// 8-character hex fingerprint of `config` with `exclude_keys` stripped.
pub fn hash_config<S: AsRef<str>>(config: &Config, exclude_keys: &[S]) -> String {
    hash_value(config.root(), exclude_keys)
}

pub fn hash_value<S: AsRef<str>>(root: &Value, exclude_keys: &[S]) -> String {
    let stripped = remove_keys(root, exclude_keys);
    let digest = Sha256::digest(canonical_json(&stripped).as_bytes());
    let mut hex = format!("{digest:x}");
    hex.truncate(FINGERPRINT_LEN);
    hex
}

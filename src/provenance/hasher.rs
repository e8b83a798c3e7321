//! BLAKE3 hashing over canonical (sorted-key) JSON.
//!
//! Property hashes must not change when a mapping is merely reordered, so
//! every object is written with its keys sorted before hashing.

use std::collections::BTreeMap;

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Compute a composite hash from multiple component strings.
///
/// Order-sensitive: callers sort components when order carries no meaning.
pub fn composite_hash(components: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for c in components {
        hasher.update(c.as_bytes());
        hasher.update(b"\0");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

/// Serialize a JSON value with object keys in ascending order.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
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

/// Hash one JSON value canonically.
pub fn hash_value(value: &serde_json::Value) -> String {
    hash_string(&canonical_json(value))
}

/// Per-key digests plus one overall digest over the sorted `key=digest` pairs.
///
/// `header` components (kind, lookup target) are mixed into the overall hash.
pub fn hash_mapping<'a, I>(header: &[&str], entries: I) -> (String, BTreeMap<String, String>)
where
    I: IntoIterator<Item = (&'a String, serde_json::Value)>,
{
    let key_hashes: BTreeMap<String, String> = entries
        .into_iter()
        .map(|(k, v)| (k.clone(), hash_value(&v)))
        .collect();

    let pairs: Vec<String> = key_hashes
        .iter()
        .map(|(k, h)| format!("{}={}", k, h))
        .collect();
    let mut components: Vec<&str> = header.to_vec();
    components.extend(pairs.iter().map(String::as_str));
    (composite_hash(&components), key_hashes)
}

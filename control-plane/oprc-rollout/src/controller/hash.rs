use serde::Serialize;
use serde_json::Value;

/// Consonants and digits only, so encoded hashes never spell words or mix up
/// look-alike characters.
const SAFE_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Fingerprint a template, optionally salted with a collision count.
pub fn compute_hash<T: Serialize>(
    template: &T,
    collision_count: Option<i32>,
) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(template)?;
    let mut hasher = crc32fast::Hasher::new();
    write_canonical(&mut hasher, &value);
    if let Some(count) = collision_count {
        hasher.update(&(count as u32).to_le_bytes());
    }
    Ok(safe_encode(&hasher.finalize().to_string()))
}

fn safe_encode(s: &str) -> String {
    s.bytes()
        .map(|b| SAFE_ALPHABET[b as usize % SAFE_ALPHABET.len()] as char)
        .collect()
}

// Keys are visited in sorted order, independent of map implementation.
fn write_canonical(hasher: &mut crc32fast::Hasher, value: &Value) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(b) => hasher.update(if *b { b"t" } else { b"f" }),
        Value::Number(n) => {
            hasher.update(b"#");
            hasher.update(n.to_string().as_bytes());
        }
        Value::String(s) => {
            hasher.update(b"\"");
            hasher.update(&(s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update(b"[");
            hasher.update(&(items.len() as u64).to_le_bytes());
            for item in items {
                write_canonical(hasher, item);
            }
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            hasher.update(&(keys.len() as u64).to_le_bytes());
            for key in keys {
                hasher.update(&(key.len() as u64).to_le_bytes());
                hasher.update(key.as_bytes());
                write_canonical(hasher, &map[key]);
            }
        }
    }
}

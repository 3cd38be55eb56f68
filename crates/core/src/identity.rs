//! Resource id derivation
//!
//! When no id command is declared, the id is a blake3 digest over the new
//! context, the new state and the declared environment. Maps iterate in key
//! order and every key and value is length-prefixed, so the same inputs
//! always give the same id and no two distinct inputs share an encoding.

use crate::change_map::StringMap;

/// Derive a stable id from the new snapshots
pub fn derive_id(context: &StringMap, state: &StringMap, environment: &StringMap) -> String {
    let mut hasher = blake3::Hasher::new();
    for (section, map) in [("context", context), ("state", state), ("environment", environment)] {
        update_field(&mut hasher, section);
        hasher.update(&(map.len() as u64).to_le_bytes());
        for (key, value) in map {
            update_field(&mut hasher, key);
            update_field(&mut hasher, value);
        }
    }
    hasher.finalize().to_hex().to_string()
}

fn update_field(hasher: &mut blake3::Hasher, text: &str) {
    hasher.update(&(text.len() as u64).to_le_bytes());
    hasher.update(text.as_bytes());
}

/// Id taken from an id command's stdout
///
/// Only surrounding whitespace is removed; an empty result falls back to the
/// derived id.
pub fn id_from_output(stdout: &str) -> Option<String> {
    let id = stdout.trim();
    (!id.is_empty()).then(|| id.to_string())
}

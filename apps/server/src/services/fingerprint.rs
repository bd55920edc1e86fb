//! Content fingerprints for skippable updates
//!
//! Two versions of a resource that differ only in server-managed metadata
//! (`meta.versionId`, `meta.lastUpdated`) share a fingerprint. Object keys
//! are hashed in sorted order so the client's member order does not matter.

use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

const SALT: &[u8] = b"fhir-rest-engine/fingerprint/v1";

/// Hex-encoded SHA-256 over the canonical form of `resource`.
pub fn fingerprint(resource: &JsonValue) -> String {
    let mut hasher = Sha256::new();
    hasher.update(SALT);
    hash_value(&mut hasher, &without_server_meta(resource));
    format!("{:x}", hasher.finalize())
}

/// True when both documents carry the same content.
pub fn same_content(a: &JsonValue, b: &JsonValue) -> bool {
    fingerprint(a) == fingerprint(b)
}

fn without_server_meta(resource: &JsonValue) -> JsonValue {
    let mut copy = resource.clone();
    if let Some(obj) = copy.as_object_mut() {
        let empty_meta = match obj.get_mut("meta").and_then(|m| m.as_object_mut()) {
            Some(meta) => {
                meta.remove("versionId");
                meta.remove("lastUpdated");
                meta.is_empty()
            }
            None => false,
        };
        if empty_meta {
            obj.remove("meta");
        }
    }
    copy
}

fn hash_value(hasher: &mut Sha256, value: &JsonValue) {
    match value {
        JsonValue::Null => hasher.update(b"n"),
        JsonValue::Bool(b) => hasher.update(if *b { b"t" } else { b"f" }),
        JsonValue::Number(n) => {
            hasher.update(b"#");
            hasher.update(n.to_string().as_bytes());
            hasher.update(b";");
        }
        JsonValue::String(s) => {
            hasher.update(b"s");
            hasher.update((s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
        }
        JsonValue::Array(items) => {
            hasher.update(b"[");
            for item in items {
                hash_value(hasher, item);
            }
            hasher.update(b"]");
        }
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                hasher.update((key.len() as u64).to_le_bytes());
                hasher.update(key.as_bytes());
                hash_value(hasher, &map[key]);
            }
            hasher.update(b"}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ignores_server_metadata_and_key_order() {
        let a = json!({
            "resourceType": "Patient",
            "id": "p1",
            "meta": { "versionId": "1", "lastUpdated": "2024-01-01T00:00:00Z" },
            "active": true
        });
        let b = json!({
            "active": true,
            "id": "p1",
            "resourceType": "Patient",
            "meta": { "versionId": "7", "lastUpdated": "2025-01-01T00:00:00Z" }
        });
        assert!(same_content(&a, &b));
        assert_eq!(fingerprint(&a).len(), 64);
    }

    #[test]
    fn content_and_profile_changes_are_detected() {
        let base = json!({ "resourceType": "Patient", "id": "p1", "active": true });
        let changed = json!({ "resourceType": "Patient", "id": "p1", "active": false });
        let profiled = json!({
            "resourceType": "Patient",
            "id": "p1",
            "active": true,
            "meta": { "profile": ["http://example.org/p"] }
        });
        assert!(!same_content(&base, &changed));
        assert!(!same_content(&base, &profiled));
    }

    #[test]
    fn string_boundaries_are_unambiguous() {
        let a = json!({ "a": "bc", "d": "" });
        let b = json!({ "a": "b", "d": "c" });
        assert!(!same_content(&a, &b));
    }
}

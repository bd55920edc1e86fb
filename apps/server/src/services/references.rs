//! Bundle-local references
//!
//! Entries with a `urn:` fullUrl may be referenced by other entries of the
//! same bundle before they have a server id. The meta phase records
//! `urn:… -> Type/id` in a [`LocalReferenceMap`]; once every entry of a
//! method group has been through that phase the map is frozen and the frozen
//! view is used to rewrite resources.

use crate::Result;
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

pub const LOCAL_REF_PREFIX: &str = "urn:";

pub fn is_local_reference(value: &str) -> bool {
    value.starts_with(LOCAL_REF_PREFIX)
}

/// Mutable map, written only while assigning ids.
#[derive(Debug, Default)]
pub struct LocalReferenceMap {
    mapping: HashMap<String, String>,
}

impl LocalReferenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `local_identifier -> Type/id`. Registering the same identifier
    /// twice with a different target is an error.
    pub fn register(&mut self, local_identifier: &str, reference: String) -> Result<()> {
        match self.mapping.get(local_identifier) {
            Some(existing) if existing != &reference => Err(crate::Error::InvalidRequest(format!(
                "Duplicate local identifier '{}' in bundle (already mapped to '{}')",
                local_identifier, existing
            ))),
            Some(_) => Ok(()),
            None => {
                tracing::debug!(
                    local_identifier = %local_identifier,
                    reference = %reference,
                    "Registered local reference"
                );
                self.mapping.insert(local_identifier.to_string(), reference);
                Ok(())
            }
        }
    }

    pub fn get(&self, local_identifier: &str) -> Option<&str> {
        self.mapping.get(local_identifier).map(String::as_str)
    }

    /// Id reserved for `local_identifier`, if its target has the given type.
    pub fn reserved_id(&self, local_identifier: &str, resource_type: &str) -> Option<&str> {
        let (rt, id) = self.get(local_identifier)?.split_once('/')?;
        (rt == resource_type).then_some(id)
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    /// Immutable snapshot of the current mappings.
    pub fn freeze(&self) -> FrozenReferenceMap {
        FrozenReferenceMap {
            mapping: Arc::new(self.mapping.clone()),
        }
    }
}

/// Read-only view used by the reference-mapping phase.
#[derive(Debug, Clone, Default)]
pub struct FrozenReferenceMap {
    mapping: Arc<HashMap<String, String>>,
}

impl FrozenReferenceMap {
    pub fn get(&self, local_identifier: &str) -> Option<&str> {
        self.mapping.get(local_identifier).map(String::as_str)
    }

    /// Copy of `resource` with every local reference replaced.
    ///
    /// Fails listing every `urn:` reference that has no mapping. Other `urn:`
    /// strings (code systems, identifier systems) are left alone unless mapped.
    pub fn rewrite(&self, resource: &JsonValue) -> Result<JsonValue> {
        let mut copy = resource.clone();
        let mut unresolved = BTreeSet::new();
        rewrite_json_value(&mut copy, None, &self.mapping, &mut unresolved);
        if unresolved.is_empty() {
            Ok(copy)
        } else {
            Err(crate::Error::InvalidRequest(format!(
                "Unable to resolve local reference(s): {}",
                unresolved.into_iter().collect::<Vec<_>>().join(", ")
            )))
        }
    }
}

fn rewrite_json_value(
    value: &mut JsonValue,
    key: Option<&str>,
    mapping: &HashMap<String, String>,
    unresolved: &mut BTreeSet<String>,
) {
    match value {
        JsonValue::Object(map) => {
            for (k, v) in map.iter_mut() {
                rewrite_json_value(v, Some(k.as_str()), mapping, unresolved);
            }
        }
        JsonValue::Array(arr) => {
            for item in arr.iter_mut() {
                rewrite_json_value(item, key, mapping, unresolved);
            }
        }
        JsonValue::String(s) => match rewrite_string(s, mapping) {
            Some(updated) => *s = updated,
            None if key == Some("reference") && is_local_reference(s) => {
                unresolved.insert(s.clone());
            }
            None => {}
        },
        _ => {}
    }
}

fn rewrite_string(input: &str, mapping: &HashMap<String, String>) -> Option<String> {
    if mapping.is_empty() {
        return None;
    }

    if let Some(replacement) = mapping.get(input) {
        return Some(replacement.clone());
    }

    if let Some((base, frag)) = input.split_once('#') {
        if let Some(replacement) = mapping.get(base) {
            return Some(format!("{}#{}", replacement, frag));
        }
    }

    // Narrative and markdown may embed local references mid-string.
    if is_local_reference(input) {
        return None;
    }
    rewrite_embedded(input, mapping)
}

/// Replace whole `urn:` tokens found inside free text. A token runs until the
/// first character that cannot be part of an identifier, so `urn:uuid:1`
/// never matches inside `urn:uuid:12`.
fn rewrite_embedded(input: &str, mapping: &HashMap<String, String>) -> Option<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    let mut changed = false;

    while let Some(pos) = rest.find(LOCAL_REF_PREFIX) {
        let (head, tail) = rest.split_at(pos);
        out.push_str(head);
        let end = tail
            .find(|c: char| !is_identifier_char(c))
            .unwrap_or(tail.len());
        // A trailing full stop ends the sentence, not the identifier.
        let token = tail[..end].trim_end_matches('.');
        match mapping.get(token) {
            Some(reference) => {
                out.push_str(reference);
                changed = true;
            }
            None => out.push_str(token),
        }
        rest = &tail[token.len()..];
    }
    out.push_str(rest);

    changed.then_some(out)
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '.' | '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frozen() -> FrozenReferenceMap {
        let mut map = LocalReferenceMap::new();
        map.register("urn:uuid:p1", "Patient/123".to_string()).unwrap();
        map.freeze()
    }

    #[test]
    fn rewrites_exact_and_fragment_references() {
        let obs = json!({
            "resourceType": "Observation",
            "subject": { "reference": "urn:uuid:p1" },
            "focus": [{ "reference": "urn:uuid:p1#contained" }],
            "text": { "div": "<div>About urn:uuid:p1</div>" }
        });
        let out = frozen().rewrite(&obs).unwrap();
        assert_eq!(out["subject"]["reference"], "Patient/123");
        assert_eq!(out["focus"][0]["reference"], "Patient/123#contained");
        assert_eq!(out["text"]["div"], "<div>About Patient/123</div>");
        assert_eq!(obs["subject"]["reference"], "urn:uuid:p1");
    }

    #[test]
    fn embedded_references_match_whole_identifiers() {
        let mut map = LocalReferenceMap::new();
        map.register("urn:uuid:1", "Patient/a".to_string()).unwrap();
        map.register("urn:uuid:12", "Patient/b".to_string()).unwrap();
        let frozen = map.freeze();

        let obs = json!({
            "note": [
                { "text": "see urn:uuid:12" },
                { "text": "before urn:uuid:1, after urn:uuid:12." },
                { "text": "unknown urn:uuid:123 stays" }
            ]
        });
        let out = frozen.rewrite(&obs).unwrap();
        assert_eq!(out["note"][0]["text"], "see Patient/b");
        assert_eq!(out["note"][1]["text"], "before Patient/a, after Patient/b.");
        assert_eq!(out["note"][2]["text"], "unknown urn:uuid:123 stays");

        let text = json!({ "div": "<div>urn:uuid:12 and urn:uuid:1.</div>" });
        let out = frozen.rewrite(&text).unwrap();
        assert_eq!(out["div"], "<div>Patient/b and Patient/a.</div>");
    }

    #[test]
    fn unresolved_references_are_listed() {
        let obs = json!({
            "identifier": [{ "system": "urn:oid:2.16.840.1", "value": "x" }],
            "subject": { "reference": "urn:uuid:missing" },
            "performer": [{ "reference": "urn:oid:1.2.3" }]
        });
        let err = frozen().rewrite(&obs).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("urn:uuid:missing"));
        assert!(message.contains("urn:oid:1.2.3"));
        assert!(!message.contains("2.16.840.1"));
    }

    #[test]
    fn conflicting_registration_is_rejected() {
        let mut map = LocalReferenceMap::new();
        map.register("urn:uuid:a", "Patient/1".to_string()).unwrap();
        map.register("urn:uuid:a", "Patient/1".to_string()).unwrap();
        assert!(map.register("urn:uuid:a", "Patient/2".to_string()).is_err());
        assert_eq!(map.reserved_id("urn:uuid:a", "Patient"), Some("1"));
        assert_eq!(map.reserved_id("urn:uuid:a", "Observation"), None);
    }
}

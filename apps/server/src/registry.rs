//! Profile registry
//!
//! Resolves conformance resources (StructureDefinitions) by canonical URL.
//! Canonicals may carry a `|version` suffix.

use crate::Result;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::RwLock;

#[async_trait]
pub trait ProfileRegistry: Send + Sync {
    async fn resolve_profile(&self, url: &str) -> Result<Option<JsonValue>>;
}

/// Split `url|version` into its parts.
pub fn split_canonical(canonical: &str) -> (&str, Option<&str>) {
    match canonical.split_once('|') {
        Some((url, version)) => (url, Some(version)),
        None => (canonical, None),
    }
}

/// Registry backed by a map of loaded StructureDefinitions.
#[derive(Debug, Default)]
pub struct InMemoryProfileRegistry {
    profiles: RwLock<HashMap<String, JsonValue>>,
}

impl InMemoryProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a StructureDefinition under `url` and, when it has one,
    /// `url|version`. The latest registration wins for the bare URL.
    pub fn register(&self, definition: JsonValue) -> Result<()> {
        let url = definition
            .get("url")
            .and_then(|u| u.as_str())
            .ok_or_else(|| {
                crate::Error::InvalidArgument("StructureDefinition has no url".to_string())
            })?
            .to_string();
        let version = definition
            .get("version")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let mut profiles = self
            .profiles
            .write()
            .map_err(|_| crate::Error::Internal("profile registry lock poisoned".to_string()))?;
        if let Some(version) = version {
            profiles.insert(format!("{}|{}", url, version), definition.clone());
        }
        tracing::debug!(url = %url, "Registered profile");
        profiles.insert(url, definition);
        Ok(())
    }
}

#[async_trait]
impl ProfileRegistry for InMemoryProfileRegistry {
    async fn resolve_profile(&self, url: &str) -> Result<Option<JsonValue>> {
        let profiles = self
            .profiles
            .read()
            .map_err(|_| crate::Error::Internal("profile registry lock poisoned".to_string()))?;
        Ok(profiles.get(url).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolves_bare_and_versioned_canonicals() {
        let registry = InMemoryProfileRegistry::new();
        registry
            .register(json!({
                "resourceType": "StructureDefinition",
                "url": "http://example.org/fhir/StructureDefinition/vip-patient",
                "version": "1.0.0"
            }))
            .unwrap();

        let bare = "http://example.org/fhir/StructureDefinition/vip-patient";
        assert!(registry.resolve_profile(bare).await.unwrap().is_some());
        assert!(registry
            .resolve_profile(&format!("{}|1.0.0", bare))
            .await
            .unwrap()
            .is_some());
        assert!(registry
            .resolve_profile(&format!("{}|2.0.0", bare))
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn canonical_split() {
        assert_eq!(split_canonical("http://a|1"), ("http://a", Some("1")));
        assert_eq!(split_canonical("http://a"), ("http://a", None));
    }
}

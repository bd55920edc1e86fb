//! FHIR Bundle model
//!
//! Version-agnostic model for Bundles that works across R4, R4B, and R5.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// FHIR Bundle resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    #[serde(default = "default_resource_type")]
    pub resource_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,

    #[serde(rename = "type")]
    pub bundle_type: BundleType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// If search or history, the total number of matches
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<Vec<BundleLink>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<Vec<BundleEntry>>,

    /// Additional content beyond core fields
    #[serde(flatten)]
    pub extensions: HashMap<String, Value>,
}

fn default_resource_type() -> String {
    "Bundle".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundleType {
    Document,
    Message,
    Transaction,
    TransactionResponse,
    Batch,
    BatchResponse,
    History,
    Searchset,
    Collection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleLink {
    pub relation: String,
    pub url: String,
}

/// Entry in the bundle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<BundleEntrySearch>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<BundleEntryRequest>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<BundleEntryResponse>,

    #[serde(flatten)]
    pub extensions: HashMap<String, Value>,
}

/// Request details for a Bundle entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntryRequest {
    /// HTTP verb for the entry (GET | HEAD | POST | PUT | PATCH | DELETE)
    pub method: String,

    pub url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub if_none_match: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub if_modified_since: Option<String>,

    /// For managing update contention
    #[serde(skip_serializing_if = "Option::is_none")]
    pub if_match: Option<String>,

    /// For conditional creates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub if_none_exist: Option<String>,

    #[serde(flatten)]
    pub extensions: HashMap<String, Value>,
}

/// Response details for a Bundle entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntryResponse {
    /// Status response code (text), e.g. "201 Created"
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,

    /// OperationOutcome with hints and warnings (for batch/transaction)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Value>,

    #[serde(flatten)]
    pub extensions: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntrySearch {
    #[serde(rename = "mode", skip_serializing_if = "Option::is_none")]
    pub search_mode: Option<BundleEntrySearchMode>,

    /// Search ranking (between 0 and 1)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleEntrySearchMode {
    Match,
    Include,
    Outcome,
}

impl Bundle {
    pub fn new(bundle_type: BundleType) -> Self {
        Self {
            resource_type: default_resource_type(),
            id: None,
            meta: None,
            bundle_type,
            timestamp: None,
            total: None,
            link: None,
            entry: None,
            extensions: HashMap::new(),
        }
    }

    pub fn from_value(value: Value) -> crate::Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| crate::Error::InvalidRequest(format!("Invalid Bundle: {}", e)))
    }

    pub fn to_value(&self) -> crate::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn is_transaction(&self) -> bool {
        matches!(self.bundle_type, BundleType::Transaction)
    }

    pub fn is_batch(&self) -> bool {
        matches!(self.bundle_type, BundleType::Batch)
    }

    pub fn entries(&self) -> &[BundleEntry] {
        self.entry.as_deref().unwrap_or(&[])
    }

    pub fn entry_count(&self) -> usize {
        self.entries().len()
    }

    pub fn add_entry(&mut self, entry: BundleEntry) {
        self.entry.get_or_insert_with(Vec::new).push(entry);
    }

    pub fn add_link(&mut self, relation: impl Into<String>, url: impl Into<String>) {
        self.link.get_or_insert_with(Vec::new).push(BundleLink {
            relation: relation.into(),
            url: url.into(),
        });
    }

    pub fn link_url(&self, relation: &str) -> Option<&str> {
        self.link
            .as_deref()?
            .iter()
            .find(|l| l.relation == relation)
            .map(|l| l.url.as_str())
    }
}

impl BundleEntryResponse {
    pub fn with_status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_transaction_bundle() {
        let bundle = Bundle::from_value(json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [{
                "fullUrl": "urn:uuid:61ebe359-bfdc-4613-8bf2-c5e300945f0a",
                "resource": { "resourceType": "Patient" },
                "request": {
                    "method": "POST",
                    "url": "Patient",
                    "ifNoneExist": "identifier=http://acme.org/mrns|12345"
                }
            }]
        }))
        .unwrap();

        assert!(bundle.is_transaction());
        assert_eq!(bundle.entry_count(), 1);
        let request = bundle.entries()[0].request.as_ref().unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(
            request.if_none_exist.as_deref(),
            Some("identifier=http://acme.org/mrns|12345")
        );
    }

    #[test]
    fn test_response_types_serialize_kebab_case() {
        let bundle = Bundle::new(BundleType::BatchResponse);
        let json = bundle.to_value().unwrap();
        assert_eq!(json["type"], "batch-response");
        assert_eq!(json["resourceType"], "Bundle");
    }

    #[test]
    fn test_links() {
        let mut bundle = Bundle::new(BundleType::Searchset);
        bundle.add_link("self", "Patient?_page=1");
        bundle.add_link("next", "Patient?_page=2");
        assert_eq!(bundle.link_url("next"), Some("Patient?_page=2"));
        assert_eq!(bundle.link_url("previous"), None);
    }

    #[test]
    fn test_invalid_bundle_is_rejected() {
        let err = Bundle::from_value(json!({ "resourceType": "Bundle" })).unwrap_err();
        assert!(matches!(err, crate::Error::InvalidRequest(_)));
    }
}

//! Response bundle assembly
//!
//! Search, history and batch/transaction response bundles, their paging
//! links and the base URI derivation shared by all of them.

use crate::models::{
    resource, Bundle, BundleEntry, BundleEntryRequest, BundleEntryResponse, BundleEntrySearch,
    BundleEntrySearchMode, BundleType, ChangeRecord, ChangeType, Resource,
};
use crate::persistence::SearchResult;
use crate::search::{SearchContext, SummaryMode};
use crate::url::parse_query_string;
use crate::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};

pub const SUBSETTED_SYSTEM: &str = "http://terminology.hl7.org/CodeSystem/v3-ObservationValue";

/// Strip query, resource path, `/_history`, `/_search` or `/$op` from a
/// request URI, leaving the service base.
pub fn base_uri(request_uri: &str, resource_type: Option<&str>) -> String {
    let without_query = request_uri.split('?').next().unwrap_or(request_uri);

    if let Some(rt) = resource_type.filter(|rt| !rt.is_empty()) {
        return match without_query.rfind(&format!("/{}", rt)) {
            Some(pos) => without_query[..pos].to_string(),
            None => without_query.to_string(),
        };
    }

    if let Some(base) = without_query.strip_suffix("/_history") {
        base.to_string()
    } else if let Some(base) = without_query.strip_suffix("/_search") {
        base.to_string()
    } else if let Some(pos) = without_query.rfind("/$") {
        without_query[..pos].to_string()
    } else {
        without_query.to_string()
    }
}

pub fn full_url(base_url: &str, resource_type: &str, id: &str) -> String {
    format!("{}/{}/{}", base_url.trim_end_matches('/'), resource_type, id)
}

/// `request_uri` with its `_page` parameter replaced.
pub fn page_url(request_uri: &str, page: usize) -> String {
    let (path, query) = request_uri.split_once('?').unwrap_or((request_uri, ""));
    let mut pairs: Vec<String> = parse_query_string(query)
        .into_iter()
        .filter(|(name, _)| name != "_page")
        .flat_map(|(name, values)| {
            values.into_iter().map(move |v| {
                format!("{}={}", urlencoding::encode(&name), urlencoding::encode(&v))
            })
        })
        .collect();
    pairs.push(format!("_page={}", page));
    format!("{}?{}", path, pairs.join("&"))
}

/// Add `self`, `next` and `previous` links. Only `self` is written when
/// `suppress_navigation` is set (page size 0 or `_summary=count`).
pub fn add_paging_links(
    bundle: &mut Bundle,
    request_uri: &str,
    page_number: usize,
    last_page_number: usize,
    suppress_navigation: bool,
) {
    bundle.add_link("self", page_url(request_uri, page_number));
    if suppress_navigation {
        return;
    }
    if page_number < last_page_number {
        bundle.add_link("next", page_url(request_uri, page_number + 1));
    }
    if page_number > 1 {
        bundle.add_link("previous", page_url(request_uri, page_number - 1));
    }
}

fn subsetted_tag() -> JsonValue {
    json!({
        "system": SUBSETTED_SYSTEM,
        "code": "SUBSETTED",
        "display": "subsetted"
    })
}

/// Copy of `resource` reduced per `_elements` / `_summary` and tagged
/// SUBSETTED. Unchanged when the search does not subset.
pub fn subset(resource: &JsonValue, ctx: &SearchContext) -> JsonValue {
    if !ctx.is_subsetted() {
        return resource.clone();
    }
    let Some(obj) = resource.as_object() else {
        return resource.clone();
    };

    let keep = |key: &str| -> bool {
        if matches!(key, "resourceType" | "id" | "meta") {
            return true;
        }
        if !ctx.elements.is_empty() {
            return ctx.elements.iter().any(|e| e == key);
        }
        match ctx.summary {
            Some(SummaryMode::Text) => key == "text",
            Some(SummaryMode::Data) | Some(SummaryMode::True) => key != "text",
            _ => true,
        }
    };

    let mut trimmed: serde_json::Map<String, JsonValue> = obj
        .iter()
        .filter(|(k, _)| keep(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let meta = trimmed.entry("meta".to_string()).or_insert_with(|| json!({}));
    if let Some(meta) = meta.as_object_mut() {
        let tags = meta.entry("tag".to_string()).or_insert_with(|| json!([]));
        if let Some(tags) = tags.as_array_mut() {
            tags.push(subsetted_tag());
        }
    }
    JsonValue::Object(trimmed)
}

/// Searchset bundle for one page of results.
pub fn search_bundle(
    ctx: &SearchContext,
    result: &SearchResult,
    base_url: &str,
    request_uri: &str,
    max_includes: usize,
) -> Result<Bundle> {
    if result.includes.len() > max_includes {
        return Err(crate::Error::BusinessRule(format!(
            "Number of returned 'include' resources exceeds allowable limit of {}",
            max_includes
        )));
    }

    let mut bundle = Bundle::new(BundleType::Searchset);
    bundle.id = Some(uuid::Uuid::new_v4().to_string());
    bundle.total = Some(ctx.total_count as u32);

    if !ctx.is_count_only() {
        let matches = result.matches.iter().map(|r| (r, BundleEntrySearchMode::Match));
        let includes = result.includes.iter().map(|r| (r, BundleEntrySearchMode::Include));
        for (found, mode) in matches.chain(includes) {
            bundle.add_entry(BundleEntry {
                full_url: Some(full_url(base_url, &found.resource_type, &found.id)),
                resource: Some(subset(&found.resource, ctx)),
                search: Some(BundleEntrySearch {
                    search_mode: Some(mode),
                    score: Some(1.0),
                }),
                ..Default::default()
            });
        }
    }

    if !ctx.warnings.is_empty() {
        let outcome = crate::models::OperationOutcome::new(ctx.warnings.clone());
        bundle.add_entry(BundleEntry {
            resource: Some(outcome.to_value()),
            search: Some(BundleEntrySearch {
                search_mode: Some(BundleEntrySearchMode::Outcome),
                score: None,
            }),
            ..Default::default()
        });
    }

    add_paging_links(
        &mut bundle,
        request_uri,
        ctx.page_number,
        ctx.last_page_number,
        ctx.is_count_only(),
    );
    Ok(bundle)
}

/// One version in a history bundle.
#[derive(Debug, Clone)]
pub struct HistoryItem {
    pub resource_type: String,
    pub id: String,
    pub version_id: i32,
    pub change_type: ChangeType,
    pub last_updated: DateTime<Utc>,
    /// Omitted for deletions.
    pub resource: Option<JsonValue>,
}

impl HistoryItem {
    pub fn from_resource(version: &Resource) -> Self {
        let change_type = if version.deleted {
            ChangeType::Delete
        } else if version.version_id == 1 {
            ChangeType::Create
        } else {
            ChangeType::Update
        };
        Self {
            resource_type: version.resource_type.clone(),
            id: version.id.clone(),
            version_id: version.version_id,
            change_type,
            last_updated: version.last_updated,
            resource: (!version.deleted).then(|| version.resource.clone()),
        }
    }

    pub fn from_change(record: &ChangeRecord, version: Option<&Resource>) -> Self {
        Self {
            resource_type: record.resource_type.clone(),
            id: record.logical_id.clone(),
            version_id: record.version_id,
            change_type: record.change_type,
            last_updated: record.changed_at,
            resource: version
                .filter(|v| !v.deleted && record.change_type != ChangeType::Delete)
                .map(|v| v.resource.clone()),
        }
    }

    fn entry(self, base_url: &str) -> BundleEntry {
        let (method, url, status) = match self.change_type {
            ChangeType::Create => ("POST", self.resource_type.clone(), "201"),
            ChangeType::Update => ("PUT", format!("{}/{}", self.resource_type, self.id), "200"),
            ChangeType::Delete => ("DELETE", format!("{}/{}", self.resource_type, self.id), "200"),
        };
        BundleEntry {
            full_url: Some(full_url(base_url, &self.resource_type, &self.id)),
            resource: self.resource,
            request: Some(BundleEntryRequest {
                method: method.to_string(),
                url,
                ..Default::default()
            }),
            response: Some(BundleEntryResponse {
                status: status.to_string(),
                location: Some(resource::location(&self.resource_type, &self.id, self.version_id)),
                etag: Some(resource::etag(self.version_id)),
                last_modified: Some(resource::format_instant(self.last_updated)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

pub fn history_bundle(items: Vec<HistoryItem>, total: Option<usize>, base_url: &str) -> Bundle {
    let mut bundle = Bundle::new(BundleType::History);
    bundle.id = Some(uuid::Uuid::new_v4().to_string());
    bundle.total = total.map(|t| t as u32);
    for item in items {
        bundle.add_entry(item.entry(base_url));
    }
    bundle
}

/// Batch or transaction response holding `entries` in request order.
pub fn response_bundle(transaction: bool, entries: Vec<BundleEntry>) -> Bundle {
    let mut bundle = Bundle::new(if transaction {
        BundleType::TransactionResponse
    } else {
        BundleType::BatchResponse
    });
    bundle.id = Some(uuid::Uuid::new_v4().to_string());
    bundle.timestamp = Some(resource::format_instant(Utc::now()));
    bundle.entry = Some(entries);
    bundle
}

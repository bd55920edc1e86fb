//! Filter evaluation for the in-memory store
//!
//! Supported filters: `_id`, `_lastUpdated` with comparison prefixes,
//! token-style `system|value` on identifiers and codings, references, and
//! case-insensitive prefix matching on any other top-level element.

use crate::models::Resource;
use crate::search::{SearchContext, SearchFilter, SortSpec};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;

pub(crate) fn matches(resource: &Resource, ctx: &SearchContext) -> bool {
    if let Some(rt) = &ctx.resource_type {
        if &resource.resource_type != rt {
            return false;
        }
    }
    if let Some((compartment, id)) = &ctx.compartment {
        let target = format!("{}/{}", compartment, id);
        if !references_anywhere(&resource.resource, &target) {
            return false;
        }
    }
    ctx.filters.iter().all(|f| matches_filter(resource, f))
}

fn matches_filter(resource: &Resource, filter: &SearchFilter) -> bool {
    match filter.name.as_str() {
        "_id" => filter.values.iter().any(|v| v == &resource.id),
        "_lastUpdated" => filter
            .values
            .iter()
            .any(|v| matches_instant(resource.last_updated, v)),
        name => {
            let element = resource.resource.get(name);
            if filter.modifier.as_deref() == Some("missing") {
                let want_missing = filter.values.iter().any(|v| v == "true");
                return element.is_none() == want_missing;
            }
            let Some(element) = element else {
                return false;
            };
            let exact = filter.modifier.as_deref() == Some("exact");
            let mut candidates = Vec::new();
            collect_candidates(element, &mut candidates);
            filter
                .values
                .iter()
                .any(|wanted| candidates.iter().any(|c| value_matches(c, wanted, exact)))
        }
    }
}

fn value_matches(candidate: &str, wanted: &str, exact: bool) -> bool {
    if candidate == wanted {
        return true;
    }
    // `|value` means "no system"; `value` alone means "any system".
    if let Some(code) = wanted.strip_prefix('|') {
        return candidate == code;
    }
    if exact {
        return false;
    }
    candidate.to_lowercase().starts_with(&wanted.to_lowercase())
}

/// Searchable strings of an element: leaf strings plus `system|code` and
/// `system|value` pairs of codings and identifiers.
fn collect_candidates(value: &JsonValue, out: &mut Vec<String>) {
    match value {
        JsonValue::String(s) => out.push(s.clone()),
        JsonValue::Bool(b) => out.push(b.to_string()),
        JsonValue::Number(n) => out.push(n.to_string()),
        JsonValue::Array(items) => items.iter().for_each(|i| collect_candidates(i, out)),
        JsonValue::Object(map) => {
            let system = map.get("system").and_then(|s| s.as_str());
            for key in ["code", "value"] {
                if let (Some(system), Some(v)) = (system, map.get(key).and_then(|v| v.as_str())) {
                    out.push(format!("{}|{}", system, v));
                }
            }
            for (k, v) in map {
                if k == "system" {
                    continue;
                }
                collect_candidates(v, out);
            }
        }
        JsonValue::Null => {}
    }
}

fn matches_instant(actual: DateTime<Utc>, raw: &str) -> bool {
    let (prefix, date) = match raw.get(..2) {
        Some(p @ ("eq" | "ne" | "gt" | "lt" | "ge" | "le")) => (p, &raw[2..]),
        _ => ("eq", raw),
    };
    let Some((start, end)) = parse_instant_range(date) else {
        return false;
    };
    match prefix {
        "gt" => actual >= end,
        "lt" => actual < start,
        "ge" => actual >= start,
        "le" => actual < end,
        "ne" => actual < start || actual >= end,
        _ => actual >= start && actual < end,
    }
}

/// A date covers its whole day; an instant covers one microsecond.
fn parse_instant_range(raw: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        let start = dt.with_timezone(&Utc);
        return Some((start, start + chrono::Duration::microseconds(1)));
    }
    let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    let start = day.and_hms_opt(0, 0, 0)?.and_utc();
    Some((start, start + chrono::Duration::days(1)))
}

pub(crate) fn references_anywhere(value: &JsonValue, target: &str) -> bool {
    match value {
        JsonValue::Object(map) => {
            if map.get("reference").and_then(|r| r.as_str()) == Some(target) {
                return true;
            }
            map.values().any(|v| references_anywhere(v, target))
        }
        JsonValue::Array(items) => items.iter().any(|v| references_anywhere(v, target)),
        _ => false,
    }
}

/// `Type/id` references held by the named top-level element.
pub(crate) fn reference_targets(resource: &JsonValue, element: &str) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(value) = resource.get(element) {
        collect_references(value, &mut out);
    }
    out
}

fn collect_references(value: &JsonValue, out: &mut Vec<String>) {
    match value {
        JsonValue::Object(map) => {
            if let Some(r) = map.get("reference").and_then(|r| r.as_str()) {
                out.push(r.to_string());
            }
        }
        JsonValue::Array(items) => items.iter().for_each(|i| collect_references(i, out)),
        _ => {}
    }
}

pub(crate) fn compare(a: &Resource, b: &Resource, sort: &[SortSpec]) -> Ordering {
    for spec in sort {
        let ord = match spec.parameter.as_str() {
            "_lastUpdated" => a.last_updated.cmp(&b.last_updated),
            "_id" => a.id.cmp(&b.id),
            other => sort_key(&a.resource, other).cmp(&sort_key(&b.resource, other)),
        };
        let ord = if spec.ascending { ord } else { ord.reverse() };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.last_updated
        .cmp(&b.last_updated)
        .then_with(|| a.reference().cmp(&b.reference()))
}

fn sort_key(resource: &JsonValue, element: &str) -> Option<String> {
    let mut candidates = Vec::new();
    collect_candidates(resource.get(element)?, &mut candidates);
    candidates.into_iter().min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn stored(resource: JsonValue) -> Resource {
        Resource {
            id: resource["id"].as_str().unwrap().to_string(),
            resource_type: resource["resourceType"].as_str().unwrap().to_string(),
            version_id: 1,
            resource,
            last_updated: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            deleted: false,
        }
    }

    fn filter(name: &str, modifier: Option<&str>, value: &str) -> SearchContext {
        let mut ctx = SearchContext::new(Some("Patient"), 10);
        ctx.filters.push(SearchFilter {
            name: name.to_string(),
            modifier: modifier.map(str::to_string),
            values: vec![value.to_string()],
        });
        ctx
    }

    fn patient() -> Resource {
        stored(json!({
            "resourceType": "Patient",
            "id": "p1",
            "identifier": [{ "system": "http://acme.org/mrns", "value": "12345" }],
            "name": [{ "family": "Doe", "given": ["Jane"] }],
            "managingOrganization": { "reference": "Organization/o1" }
        }))
    }

    #[test]
    fn identifier_token() {
        let p = patient();
        assert!(matches(&p, &filter("identifier", None, "http://acme.org/mrns|12345")));
        assert!(matches(&p, &filter("identifier", None, "12345")));
        assert!(!matches(&p, &filter("identifier", None, "http://other|12345")));
    }

    #[test]
    fn string_prefix_and_exact() {
        let p = patient();
        assert!(matches(&p, &filter("name", None, "do")));
        assert!(!matches(&p, &filter("name", Some("exact"), "do")));
        assert!(matches(&p, &filter("name", Some("exact"), "Doe")));
        assert!(matches(&p, &filter("birthDate", Some("missing"), "true")));
    }

    #[test]
    fn last_updated_prefixes() {
        let p = patient();
        assert!(matches(&p, &filter("_lastUpdated", None, "2024-03-01")));
        assert!(matches(&p, &filter("_lastUpdated", None, "gt2024-02-28")));
        assert!(!matches(&p, &filter("_lastUpdated", None, "lt2024-03-01")));
    }

    #[test]
    fn compartment_and_references() {
        let p = patient();
        let mut ctx = SearchContext::new(Some("Patient"), 10);
        ctx.compartment = Some(("Organization".into(), "o1".into()));
        assert!(matches(&p, &ctx));
        assert_eq!(
            reference_targets(&p.resource, "managingOrganization"),
            vec!["Organization/o1"]
        );
    }
}

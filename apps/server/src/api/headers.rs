//! Request and response header helpers

use crate::services::{translator, RequestContext, RestOperationResponse};
use axum::http::{header, HeaderMap, HeaderValue};
use chrono::{DateTime, Utc};

/// Header value as a trimmed, non-empty string.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// `If-None-Match: *` on an update.
pub fn if_none_match(headers: &HeaderMap) -> bool {
    translator::parse_if_none_match(header_str(headers, "if-none-match")).is_some()
}

/// HTTP-date (RFC 7231 IMF-fixdate).
pub fn http_date(instant: DateTime<Utc>) -> String {
    instant.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// `Location`, `ETag` and `Last-Modified` for a single-resource response.
pub fn apply_resource_headers(
    headers: &mut HeaderMap,
    ctx: &RequestContext,
    response: &RestOperationResponse,
) {
    if let Some(location) = response.location.as_deref() {
        let absolute = format!("{}/{}", ctx.base_url, location);
        if let Ok(value) = HeaderValue::from_str(&absolute) {
            headers.insert(header::LOCATION, value);
        }
    }
    if let Some(etag) = response.etag.as_deref() {
        if let Ok(value) = HeaderValue::from_str(etag) {
            headers.insert(header::ETAG, value);
        }
    }
    if let Some(last_modified) = response.last_modified {
        if let Ok(value) = HeaderValue::from_str(&http_date(last_modified)) {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
}

//! FHIR REST handlers
//!
//! Every `/fhir` request lands in [`dispatch`], which routes on the method and
//! the path tokens the same way bundle entries are routed, then calls the
//! matching [`crate::services::RestHelper`] operation.

use crate::{
    api::headers,
    models::{Bundle, OperationContext},
    services::{FhirPatch, RequestContext, RestOperationResponse},
    state::AppState,
    url::{parse_query_string, UrlParser},
    Error, Result,
};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use serde_json::Value as JsonValue;

const FHIR_JSON: &str = "application/fhir+json";

/// POST /fhir (bundles), GET /fhir (system search)
pub async fn fhir_root(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    dispatch(&state, method, "", &headers, &uri, &body).await
}

/// Everything below /fhir/
pub async fn fhir_path(
    State(state): State<AppState>,
    Path(path): Path<String>,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    dispatch(&state, method, &path, &headers, &uri, &body).await
}

async fn dispatch(
    state: &AppState,
    method: Method,
    path: &str,
    headers: &HeaderMap,
    uri: &Uri,
    body: &Bytes,
) -> Response {
    let ctx = state.request_context(headers);
    let mut response = match route(state, &ctx, &method, path, headers, uri, body).await {
        Ok(response) => response,
        Err(err) => {
            tracing::debug!(
                correlation_id = ?ctx.correlation_id,
                method = %method,
                path,
                error = %err,
                "FHIR request failed"
            );
            err.into_response()
        }
    };
    if let Some(id) = ctx.correlation_id.as_deref() {
        if let Ok(value) = HeaderValue::from_str(id) {
            response.headers_mut().insert("x-correlation-id", value);
        }
    }
    response
}

#[allow(clippy::too_many_arguments)]
async fn route(
    state: &AppState,
    ctx: &RequestContext,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    uri: &Uri,
    body: &Bytes,
) -> Result<Response> {
    let helper = &state.helper;
    let relative = match uri.query() {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    };
    let url = UrlParser::parse(&format!("/{}", relative))?;
    let request_uri = absolute_uri(&ctx.base_url, &relative);
    let tokens: Vec<&str> = url.path_tokens().iter().map(String::as_str).collect();
    let query = url.query_pairs();
    let head = *method == Method::HEAD;

    if let Some(operation_name) = url.operation_name() {
        let context = operation_context(&tokens)?;
        let body = if *method == Method::POST {
            parse_body(body)?
        } else if *method == Method::GET || head {
            None
        } else {
            return Err(unsupported_method(method, &url));
        };
        let response = helper
            .do_invoke(ctx, operation_name, &context, body.as_ref(), &query)
            .await?;
        return Ok(rest_response(ctx, response, head));
    }

    match (method.clone(), tokens.as_slice()) {
        (Method::GET | Method::HEAD, [] | ["_search"]) => {
            let bundle = helper.do_search(ctx, None, None, &query, &request_uri).await?;
            bundle_response(&bundle, head)
        }
        (Method::GET | Method::HEAD, ["_history"]) => {
            let bundle = helper.do_system_history(ctx, &query, &request_uri).await?;
            bundle_response(&bundle, head)
        }
        (Method::GET | Method::HEAD, [rt]) => {
            let bundle = helper.do_search(ctx, Some(*rt), None, &query, &request_uri).await?;
            bundle_response(&bundle, head)
        }
        (Method::GET | Method::HEAD, [rt, "_history"]) => {
            let bundle = helper.do_history(ctx, rt, None, &query, &request_uri).await?;
            bundle_response(&bundle, head)
        }
        (Method::GET | Method::HEAD, [rt, id]) => {
            let response = helper.do_read(ctx, rt, id).await?;
            Ok(read_response(ctx, response, headers, head))
        }
        (Method::GET | Method::HEAD, [rt, id, "_history"]) => {
            let bundle = helper.do_history(ctx, rt, Some(*id), &query, &request_uri).await?;
            bundle_response(&bundle, head)
        }
        (Method::GET | Method::HEAD, [rt, id, "_history", version]) => {
            let response = helper.do_vread(ctx, rt, id, version).await?;
            Ok(read_response(ctx, response, headers, head))
        }
        (Method::GET | Method::HEAD, [compartment, compartment_id, rt]) => {
            let bundle = helper
                .do_search(
                    ctx,
                    Some(*rt),
                    Some((*compartment, *compartment_id)),
                    &query,
                    &request_uri,
                )
                .await?;
            bundle_response(&bundle, head)
        }
        (Method::POST, []) => {
            let body = require_body(body)?;
            let bundle = helper.do_bundle(ctx, &body).await?;
            bundle_response(&bundle, false)
        }
        (Method::POST, ["_search"]) => {
            let query = with_form_body(query, body)?;
            let bundle = helper.do_search(ctx, None, None, &query, &request_uri).await?;
            bundle_response(&bundle, false)
        }
        (Method::POST, [rt, "_search"]) => {
            let query = with_form_body(query, body)?;
            let bundle = helper.do_search(ctx, Some(*rt), None, &query, &request_uri).await?;
            bundle_response(&bundle, false)
        }
        (Method::POST, [rt]) => {
            let body = require_body(body)?;
            let if_none_exist = headers::header_str(headers, "if-none-exist");
            let response = helper.do_create(ctx, rt, &body, if_none_exist).await?;
            Ok(rest_response(ctx, response, false))
        }
        (Method::PUT, [rt]) => {
            let body = require_body(body)?;
            let search_query = conditional_query(&url)?;
            let response = helper
                .do_update(
                    ctx,
                    rt,
                    None,
                    &body,
                    Some(search_query),
                    headers::header_str(headers, "if-match"),
                    headers::if_none_match(headers),
                )
                .await?;
            Ok(rest_response(ctx, response, false))
        }
        (Method::PUT, [rt, id]) => {
            let body = require_body(body)?;
            let response = helper
                .do_update(
                    ctx,
                    rt,
                    Some(*id),
                    &body,
                    None,
                    headers::header_str(headers, "if-match"),
                    headers::if_none_match(headers),
                )
                .await?;
            Ok(rest_response(ctx, response, false))
        }
        (Method::PATCH, [rt]) => {
            let patch = parse_patch(headers, body)?;
            let search_query = conditional_query(&url)?;
            let response = helper
                .do_patch(
                    ctx,
                    rt,
                    None,
                    &patch,
                    Some(search_query),
                    headers::header_str(headers, "if-match"),
                )
                .await?;
            Ok(rest_response(ctx, response, false))
        }
        (Method::PATCH, [rt, id]) => {
            let patch = parse_patch(headers, body)?;
            let response = helper
                .do_patch(
                    ctx,
                    rt,
                    Some(*id),
                    &patch,
                    None,
                    headers::header_str(headers, "if-match"),
                )
                .await?;
            Ok(rest_response(ctx, response, false))
        }
        (Method::DELETE, [rt]) => {
            let search_query = conditional_query(&url)?;
            let response = helper.do_delete(ctx, rt, None, Some(search_query)).await?;
            Ok(rest_response(ctx, response, false))
        }
        (Method::DELETE, [rt, id]) => {
            let response = helper.do_delete(ctx, rt, Some(*id), None).await?;
            Ok(rest_response(ctx, response, false))
        }
        (Method::GET | Method::HEAD, _) => Err(Error::NotFound(format!(
            "Unrecognized path in request URL: {}",
            url.path()
        ))),
        _ => Err(unsupported_method(method, &url)),
    }
}

fn unsupported_method(method: &Method, url: &UrlParser) -> Error {
    Error::NotSupported(format!(
        "Method {} is not supported for path '{}'",
        method,
        url.path()
    ))
}

fn absolute_uri(base_url: &str, relative: &str) -> String {
    if relative.is_empty() || relative.starts_with('?') {
        format!("{}{}", base_url, relative)
    } else {
        format!("{}/{}", base_url, relative)
    }
}

fn operation_context(tokens: &[&str]) -> Result<OperationContext> {
    match tokens {
        [_] => Ok(OperationContext::System),
        [rt, _] => Ok(OperationContext::Type(rt.to_string())),
        [rt, id, _] => Ok(OperationContext::Instance(rt.to_string(), id.to_string())),
        _ => Err(Error::NotFound(
            "Operations are invoked at system, type or instance level".to_string(),
        )),
    }
}

/// Query of a conditional update, patch or delete.
fn conditional_query(url: &UrlParser) -> Result<&str> {
    url.query().filter(|q| !q.is_empty()).ok_or_else(|| {
        Error::InvalidRequest(
            "A conditional request without an id requires search parameters".to_string(),
        )
    })
}

fn parse_body(body: &Bytes) -> Result<Option<JsonValue>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| Error::InvalidRequest(format!("Request body is not valid JSON: {}", e)))
}

fn require_body(body: &Bytes) -> Result<JsonValue> {
    parse_body(body)?
        .ok_or_else(|| Error::InvalidRequest("A request body is required".to_string()))
}

/// `application/json-patch+json` is a JSON Patch; anything else must be a
/// FHIRPath Patch `Parameters` resource.
fn parse_patch(headers: &HeaderMap, body: &Bytes) -> Result<FhirPatch> {
    let body = require_body(body)?;
    let content_type = headers::header_str(headers, header::CONTENT_TYPE.as_str()).unwrap_or("");
    if content_type.starts_with("application/json-patch+json") {
        FhirPatch::from_json_patch(&body)
    } else {
        FhirPatch::from_resource(&body)
    }
}

/// POST `_search` carries its parameters form-encoded in the body.
fn with_form_body(mut query: Vec<(String, String)>, body: &Bytes) -> Result<Vec<(String, String)>> {
    let form = std::str::from_utf8(body)
        .map_err(|_| Error::InvalidRequest("Search body must be UTF-8".to_string()))?;
    for (name, values) in parse_query_string(form.trim()) {
        query.extend(values.into_iter().map(|v| (name.clone(), v)));
    }
    Ok(query)
}

fn bundle_response(bundle: &Bundle, head: bool) -> Result<Response> {
    let value = bundle.to_value()?;
    Ok(json_response(StatusCode::OK, HeaderMap::new(), (!head).then_some(value)))
}

/// A read answers `304` when `If-None-Match` names the current version.
fn read_response(
    ctx: &RequestContext,
    response: RestOperationResponse,
    request_headers: &HeaderMap,
    head: bool,
) -> Response {
    let not_modified = match (
        headers::header_str(request_headers, "if-none-match"),
        response.etag.as_deref(),
    ) {
        (Some(requested), Some(current)) => requested.trim() == current,
        _ => false,
    };
    if not_modified {
        let mut out = StatusCode::NOT_MODIFIED.into_response();
        headers::apply_resource_headers(out.headers_mut(), ctx, &response);
        return out;
    }
    rest_response(ctx, response, head)
}

fn rest_response(ctx: &RequestContext, response: RestOperationResponse, head: bool) -> Response {
    let mut out_headers = HeaderMap::new();
    headers::apply_resource_headers(&mut out_headers, ctx, &response);
    let body = if head || response.status == StatusCode::NOT_MODIFIED {
        None
    } else {
        response.body(ctx.return_preference)
    };
    json_response(response.status, out_headers, body)
}

fn json_response(status: StatusCode, mut headers: HeaderMap, body: Option<JsonValue>) -> Response {
    match body {
        Some(body) => {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(FHIR_JSON));
            (status, headers, body.to_string()).into_response()
        }
        None => (status, headers).into_response(),
    }
}

//! Bundle entry translation
//!
//! Turns the entries of a batch or transaction bundle into [`Interaction`]s,
//! ordered for execution: DELETE, POST, PUT, GET, PATCH, HEAD. PUT and DELETE
//! entries are additionally sorted by URL path so that concurrent bundles
//! touching the same resources acquire them in the same order.

use crate::interaction::{request_description, Interaction, InteractionKind};
use crate::models::{resource, Bundle, BundleEntry, BundleEntryRequest, OperationContext};
use crate::services::patch::FhirPatch;
use crate::services::references::{is_local_reference, LocalReferenceMap};
use crate::url::UrlParser;
use crate::Result;
use axum::http::Method;
use std::collections::HashMap;

/// Execution order of the method groups.
pub const METHOD_ORDER: [Method; 6] = [
    Method::DELETE,
    Method::POST,
    Method::PUT,
    Method::GET,
    Method::PATCH,
    Method::HEAD,
];

#[derive(Debug, Clone)]
pub struct TranslateOptions<'a> {
    /// Abort on the first failing entry instead of recording an issue.
    pub fail_fast: bool,
    pub correlation_id: Option<&'a str>,
    pub skippable_updates: bool,
    /// Base used to build absolute request URIs for search and history.
    pub base_url: &'a str,
}

/// True for a validation response that lets the entry proceed.
pub fn is_accepted(response: &BundleEntry) -> bool {
    response
        .response
        .as_ref()
        .is_some_and(|r| r.status.starts_with("202"))
}

fn is_rejected(validation_responses: &HashMap<usize, BundleEntry>, index: usize) -> bool {
    validation_responses
        .get(&index)
        .is_some_and(|r| !is_accepted(r))
}

pub fn parse_method(method: &str) -> Result<Method> {
    match method.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "HEAD" => Ok(Method::HEAD),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        other => Err(crate::Error::InvalidRequest(format!(
            "Bundle.Entry.request contains unsupported HTTP method: {}",
            other
        ))),
    }
}

fn entry_request(entry: &BundleEntry) -> Result<(&BundleEntryRequest, Method)> {
    let request = entry.request.as_ref().ok_or_else(|| {
        crate::Error::InvalidRequest("Bundle.Entry.request is required for bundle entries.".to_string())
    })?;
    Ok((request, parse_method(&request.method)?))
}

/// The entry's `fullUrl` if it is a local identifier.
pub fn local_identifier(entry: &BundleEntry) -> Option<&str> {
    entry.full_url.as_deref().filter(|u| is_local_reference(u))
}

pub fn check_resource_type(resource_type: &str) -> Result<()> {
    if resource::is_known_resource_type(resource_type) {
        Ok(())
    } else {
        Err(crate::Error::NotSupported(format!(
            "'{}' is not a valid resource type.",
            resource_type
        )))
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

/// Reserve server ids for entries whose id can be known before execution:
/// plain creates with a local identifier get a generated id, updates with a
/// local identifier map to the id they carry.
pub fn reserve_local_identifiers(
    bundle: &Bundle,
    validation_responses: &HashMap<usize, BundleEntry>,
    generate_id: impl Fn() -> String,
    local_refs: &mut LocalReferenceMap,
) -> Result<()> {
    for (index, entry) in bundle.entries().iter().enumerate() {
        if is_rejected(validation_responses, index) {
            continue;
        }
        let (Some(local), Some(body)) = (local_identifier(entry), entry.resource.as_ref()) else {
            continue;
        };
        let Ok((request, method)) = entry_request(entry) else {
            continue;
        };
        let Ok(url) = UrlParser::parse(&request.url) else {
            continue;
        };
        let tokens = url.path_tokens();

        if method == Method::POST
            && tokens.len() == 1
            && !tokens[0].starts_with('$')
            && non_empty(request.if_none_exist.as_deref()).is_none()
        {
            let resource_type = resource::resource_type(body).unwrap_or(&tokens[0]);
            local_refs.register(local, format!("{}/{}", resource_type, generate_id()))?;
        } else if method == Method::PUT {
            if let (Some(rt), Some(id)) = (resource::resource_type(body), resource::resource_id(body)) {
                local_refs.register(local, format!("{}/{}", rt, id))?;
            }
        }
    }
    Ok(())
}

/// Translate every entry of `bundle` into an interaction, in execution order.
#[tracing::instrument(skip_all, fields(entries = bundle.entry_count()))]
pub fn translate(
    bundle: &Bundle,
    validation_responses: &HashMap<usize, BundleEntry>,
    local_refs: &LocalReferenceMap,
    options: &TranslateOptions<'_>,
) -> Result<Vec<Interaction>> {
    let entries = bundle.entries();
    let mut result = Vec::with_capacity(entries.len());
    let mut groups: Vec<(Method, Vec<usize>)> =
        METHOD_ORDER.iter().map(|m| (m.clone(), Vec::new())).collect();

    for (index, entry) in entries.iter().enumerate() {
        if let Some(response) = validation_responses.get(&index).filter(|r| !is_accepted(r)) {
            let method = entry_request(entry).map(|(_, m)| m).unwrap_or(Method::GET);
            let description = describe(index, entry, options);
            result.push(Interaction::new(
                index,
                method,
                description,
                InteractionKind::ValidationOutcome {
                    response: response.clone(),
                },
            ));
            continue;
        }

        match entry_request(entry) {
            Ok((_, method)) => {
                if let Some((_, indices)) = groups.iter_mut().find(|(m, _)| *m == method) {
                    indices.push(index);
                }
            }
            Err(err) => {
                result.push(entry_failure(index, Method::GET, describe(index, entry, options), err, options)?);
            }
        }
    }

    tracing::debug!(
        delete = ?groups[0].1,
        post = ?groups[1].1,
        put = ?groups[2].1,
        get = ?groups[3].1,
        patch = ?groups[4].1,
        head = ?groups[5].1,
        "Bundle request indices to be processed"
    );

    for (method, mut indices) in groups {
        if method == Method::PUT || method == Method::DELETE {
            indices.sort_by(|a, b| url_path(&entries[*a]).cmp(&url_path(&entries[*b])));
        }

        for index in indices {
            let entry = &entries[index];
            let description = describe(index, entry, options);
            match translate_entry(entry, &method, local_refs, options) {
                Ok(kind) => result.push(
                    Interaction::new(index, method.clone(), description, kind)
                        .with_local_identifier(local_identifier(entry).map(str::to_string)),
                ),
                Err(err) => result.push(entry_failure(index, method.clone(), description, err, options)?),
            }
        }
    }

    Ok(result)
}

fn describe(index: usize, entry: &BundleEntry, options: &TranslateOptions<'_>) -> String {
    let (method, url) = entry
        .request
        .as_ref()
        .map(|r| (r.method.as_str(), r.url.as_str()))
        .unwrap_or(("", ""));
    request_description(index, options.correlation_id, method, url)
}

fn entry_failure(
    index: usize,
    method: Method,
    description: String,
    err: crate::Error,
    options: &TranslateOptions<'_>,
) -> Result<Interaction> {
    if options.fail_fast {
        return Err(err.with_entry_context(index, description));
    }
    tracing::debug!(entry_index = index, error = %err, "Bundle entry rejected during translation");
    Ok(Interaction::new(
        index,
        method,
        description,
        InteractionKind::Issue {
            status: err.status(),
            outcome: err.to_operation_outcome(),
        },
    ))
}

/// Path of the entry's request URL; entries without one sort first.
fn url_path(entry: &BundleEntry) -> Option<String> {
    let request = entry.request.as_ref()?;
    UrlParser::parse(&request.url)
        .ok()
        .map(|u| u.path().to_string())
}

fn absolute_uri(base_url: &str, relative: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        relative.trim_start_matches('/')
    )
}

fn translate_entry(
    entry: &BundleEntry,
    method: &Method,
    local_refs: &LocalReferenceMap,
    options: &TranslateOptions<'_>,
) -> Result<InteractionKind> {
    let (request, _) = entry_request(entry)?;
    let url = UrlParser::parse(&request.url)?;
    let request_uri = absolute_uri(options.base_url, &request.url);

    if *method == Method::GET || *method == Method::HEAD {
        translate_get(&url, request_uri, *method == Method::HEAD)
    } else if *method == Method::POST {
        translate_post(entry, request, &url, request_uri, local_refs)
    } else if *method == Method::PUT {
        translate_put(entry, request, &url, options.skippable_updates)
    } else if *method == Method::PATCH {
        translate_patch(entry, request, &url, options.skippable_updates)
    } else if *method == Method::DELETE {
        translate_delete(&url)
    } else {
        Err(crate::Error::Internal(format!(
            "unexpected bundle method {}",
            method
        )))
    }
}

fn translate_invoke(
    url: &UrlParser,
    operation_name: &str,
    method: Method,
    resource: Option<serde_json::Value>,
    request_uri: String,
) -> Result<InteractionKind> {
    let tokens = url.path_tokens();
    let context = match tokens.len() {
        1 => OperationContext::System,
        2 => {
            check_resource_type(&tokens[0])?;
            OperationContext::Type(tokens[0].clone())
        }
        3 => {
            check_resource_type(&tokens[0])?;
            OperationContext::Instance(tokens[0].clone(), tokens[1].clone())
        }
        _ => {
            return Err(crate::Error::NotFound(format!(
                "Invalid URL for custom operation '${}'",
                operation_name
            )))
        }
    };
    Ok(InteractionKind::Invoke {
        operation_name: operation_name.to_string(),
        context,
        method,
        resource,
        query: url.query_pairs(),
        request_uri,
    })
}

fn translate_get(url: &UrlParser, request_uri: String, head: bool) -> Result<InteractionKind> {
    if let Some(operation_name) = url.operation_name() {
        return translate_invoke(url, operation_name, Method::GET, None, request_uri);
    }

    let tokens = url.path_tokens();
    let query = url.query_pairs();
    match tokens {
        [only] if only == "_search" => Ok(InteractionKind::Search {
            resource_type: None,
            compartment: None,
            query,
            request_uri,
            head,
        }),
        [only] if only == "_history" => Ok(InteractionKind::History {
            resource_type: None,
            id: None,
            query,
            request_uri,
            head,
        }),
        [rt] => {
            check_resource_type(rt)?;
            Ok(InteractionKind::Search {
                resource_type: Some(rt.clone()),
                compartment: None,
                query,
                request_uri,
                head,
            })
        }
        [rt, history] if history == "_history" => {
            check_resource_type(rt)?;
            Ok(InteractionKind::History {
                resource_type: Some(rt.clone()),
                id: None,
                query,
                request_uri,
                head,
            })
        }
        [rt, id] => {
            check_resource_type(rt)?;
            Ok(InteractionKind::Read {
                resource_type: rt.clone(),
                id: id.clone(),
                head,
            })
        }
        [rt, id, history] if history == "_history" => {
            check_resource_type(rt)?;
            Ok(InteractionKind::History {
                resource_type: Some(rt.clone()),
                id: Some(id.clone()),
                query,
                request_uri,
                head,
            })
        }
        [compartment, compartment_id, rt] => {
            check_resource_type(compartment)?;
            check_resource_type(rt)?;
            Ok(InteractionKind::Search {
                resource_type: Some(rt.clone()),
                compartment: Some((compartment.clone(), compartment_id.clone())),
                query,
                request_uri,
                head,
            })
        }
        [rt, id, history, version] if history == "_history" => {
            check_resource_type(rt)?;
            Ok(InteractionKind::VRead {
                resource_type: rt.clone(),
                id: id.clone(),
                version_id: version.clone(),
                head,
            })
        }
        _ => Err(crate::Error::NotFound(format!(
            "Unrecognized path in request URL: {}",
            url.path()
        ))),
    }
}

fn translate_post(
    entry: &BundleEntry,
    request: &BundleEntryRequest,
    url: &UrlParser,
    request_uri: String,
    local_refs: &LocalReferenceMap,
) -> Result<InteractionKind> {
    if let Some(operation_name) = url.operation_name() {
        return translate_invoke(
            url,
            operation_name,
            Method::POST,
            entry.resource.clone(),
            request_uri,
        );
    }

    let tokens = url.path_tokens();
    match tokens {
        [rt, search] if search == "_search" => {
            check_resource_type(rt)?;
            Ok(InteractionKind::Search {
                resource_type: Some(rt.clone()),
                compartment: None,
                query: url.query_pairs(),
                request_uri,
                head: false,
            })
        }
        [rt] => {
            check_resource_type(rt)?;
            let resource = entry.resource.as_ref().ok_or_else(|| {
                crate::Error::NotFound("Bundle entry resource is required".to_string())
            })?;
            let if_none_exist = non_empty(request.if_none_exist.as_deref());
            let reserved = local_identifier(entry).and_then(|l| local_refs.reserved_id(l, rt));

            match (if_none_exist, reserved) {
                (None, Some(id)) => Ok(InteractionKind::Update {
                    resource_type: rt.clone(),
                    id: Some(id.to_string()),
                    resource: resource.clone(),
                    search_query: None,
                    if_match: None,
                    if_none_match: None,
                    skippable: false,
                }),
                (if_none_exist, _) => Ok(InteractionKind::Create {
                    resource_type: rt.clone(),
                    resource: resource.clone(),
                    if_none_exist,
                }),
            }
        }
        _ => Err(crate::Error::NotFound(
            "Request URL for bundled create requests should have a path with exactly one token (<resourceType>)."
                .to_string(),
        )),
    }
}

/// `If-None-Match: *` becomes `Some(0)`; other values are ignored.
pub fn parse_if_none_match(value: Option<&str>) -> Option<i32> {
    match value.map(str::trim) {
        Some("*") => Some(0),
        _ => None,
    }
}

fn translate_put(
    entry: &BundleEntry,
    request: &BundleEntryRequest,
    url: &UrlParser,
    skippable: bool,
) -> Result<InteractionKind> {
    let tokens = url.path_tokens();
    let (resource_type, id) = match tokens {
        [rt] => {
            if !url.has_query() {
                return Err(crate::Error::InvalidRequest(
                    "A search query string is required for a conditional update operation."
                        .to_string(),
                ));
            }
            (rt.clone(), None)
        }
        [rt, id] => (rt.clone(), Some(id.clone())),
        _ => {
            return Err(crate::Error::InvalidRequest(
                "Request URL for bundled PUT request should have path part with either one or two tokens (<resourceType> or <resourceType>/<id>)."
                    .to_string(),
            ))
        }
    };
    check_resource_type(&resource_type)?;

    let resource = entry.resource.clone().ok_or_else(|| {
        crate::Error::NotFound(
            "BundleEntry.resource is required for bundled update requests.".to_string(),
        )
    })?;

    Ok(InteractionKind::Update {
        search_query: if id.is_none() {
            url.query().map(str::to_string)
        } else {
            None
        },
        resource_type,
        id,
        resource,
        if_match: non_empty(request.if_match.as_deref()),
        if_none_match: parse_if_none_match(request.if_none_match.as_deref()),
        skippable,
    })
}

fn translate_patch(
    entry: &BundleEntry,
    request: &BundleEntryRequest,
    url: &UrlParser,
    skippable: bool,
) -> Result<InteractionKind> {
    let (resource_type, id) = match url.path_tokens() {
        [_] => {
            return Err(crate::Error::NotSupported(
                "Conditional update operation is not supported for PATCH requests.".to_string(),
            ))
        }
        [rt, id] => (rt.clone(), id.clone()),
        _ => {
            return Err(crate::Error::InvalidRequest(
                "Request URL for bundled PATCH request should have path part with two tokens (<resourceType>/<id>)."
                    .to_string(),
            ))
        }
    };
    check_resource_type(&resource_type)?;

    let body = entry.resource.as_ref().ok_or_else(|| {
        crate::Error::InvalidRequest(
            "Request resource type for PATCH request must be type 'Parameters'".to_string(),
        )
    })?;
    Ok(InteractionKind::Patch {
        resource_type,
        id,
        patch: FhirPatch::from_resource(body)?,
        if_match: non_empty(request.if_match.as_deref()),
        skippable,
    })
}

fn translate_delete(url: &UrlParser) -> Result<InteractionKind> {
    let (resource_type, id) = match url.path_tokens() {
        [rt] => {
            if !url.has_query() {
                return Err(crate::Error::InvalidRequest(
                    "A search query string is required for a conditional delete operation."
                        .to_string(),
                ));
            }
            (rt.clone(), None)
        }
        [rt, id] => (rt.clone(), Some(id.clone())),
        _ => {
            return Err(crate::Error::InvalidRequest(
                "Request URL for bundled DELETE request should have path part with one or two tokens (<resourceType> or <resourceType>/<id>)."
                    .to_string(),
            ))
        }
    };
    check_resource_type(&resource_type)?;
    Ok(InteractionKind::Delete {
        search_query: if id.is_none() {
            url.query().map(str::to_string)
        } else {
            None
        },
        resource_type,
        id,
    })
}

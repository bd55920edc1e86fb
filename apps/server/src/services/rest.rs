//! REST interaction façade
//!
//! [`RestHelper`] implements every FHIR REST interaction against a
//! [`Persistence`]. The public `do_*` methods each run in their own
//! persistence session; the crate-internal `*_in` and `prepare_*` methods run
//! inside a session owned by the caller and are shared with the bundle
//! executor.
//!
//! Writes are split in two steps so that bundles can assign ids before any
//! resource is stored: [`RestHelper::prepare_create`] and
//! [`RestHelper::prepare_update`] resolve the target and produce a
//! [`PreparedWrite`]; [`RestHelper::persist_write`] stores it.

use crate::config::{FhirConfig, RetryConfig};
use crate::models::{
    resource, Bundle, BundleEntry, BundleEntryResponse, BundleType, Issue, IssueType,
    OperationContext, OperationOutcome, OperationRequest, OperationResult, Parameters, Resource,
};
use crate::persistence::{
    ChangeOrder, ChangesQuery, EraseRequest, EraseResult, HistoryQuery, Persistence,
    PersistenceSession, ReindexRequest, ReindexResult, SearchResult,
};
use crate::registry::{InMemoryProfileRegistry, ProfileRegistry};
use crate::search::{DefaultSearchParser, SearchParser};
use crate::services::assembler::{self, HistoryItem};
use crate::services::executor;
use crate::services::fingerprint::same_content;
use crate::services::interceptor::{InterceptorEvent, InterceptorManager};
use crate::services::operation::OperationRegistry;
use crate::services::patch::FhirPatch;
use crate::services::references::{FrozenReferenceMap, LocalReferenceMap};
use crate::services::retry::RetryPolicy;
use crate::services::translator::{
    self, check_resource_type, parse_method, reserve_local_identifiers, TranslateOptions,
};
use crate::url::parse_query_string;
use crate::validation::{validate_resource, StructuralValidator, Validator};
use crate::Result;
use axum::http::{Method, StatusCode};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Body returned for writes, from the `Prefer: return=` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnPreference {
    Minimal,
    #[default]
    Representation,
    OperationOutcome,
}

impl ReturnPreference {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "minimal" => Some(Self::Minimal),
            "representation" => Some(Self::Representation),
            "operationoutcome" => Some(Self::OperationOutcome),
            _ => None,
        }
    }
}

/// Per-request settings shared by every interaction of one HTTP request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Service base, e.g. `http://localhost:8080/fhir`.
    pub base_url: String,
    pub return_preference: ReturnPreference,
    /// `Prefer: handling=` override of the configured search leniency.
    pub lenient: Option<bool>,
    pub correlation_id: Option<String>,
}

impl RequestContext {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            return_preference: ReturnPreference::default(),
            lenient: None,
            correlation_id: None,
        }
    }

    pub fn with_return_preference(mut self, preference: ReturnPreference) -> Self {
        self.return_preference = preference;
        self
    }

    /// Apply a `Prefer` header such as `return=minimal; handling=strict`.
    pub fn with_prefer_header(mut self, header: Option<&str>) -> Self {
        let Some(header) = header else {
            return self;
        };
        for part in header.split([';', ',']).map(str::trim) {
            if let Some(value) = part.strip_prefix("return=") {
                if let Some(preference) = ReturnPreference::parse(value) {
                    self.return_preference = preference;
                }
            } else if let Some(value) = part.strip_prefix("handling=") {
                match value.trim() {
                    "strict" => self.lenient = Some(false),
                    "lenient" => self.lenient = Some(true),
                    _ => {}
                }
            }
        }
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

/// Result of one REST interaction.
#[derive(Debug, Clone)]
pub struct RestOperationResponse {
    pub status: StatusCode,
    pub resource: Option<JsonValue>,
    /// The version an update or patch replaced.
    pub prev_resource: Option<JsonValue>,
    /// Relative `Type/id/_history/version`.
    pub location: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub outcome: Option<OperationOutcome>,
    /// Answered during the meta phase; nothing left to persist.
    pub completed: bool,
    /// The body follows the return preference.
    pub is_write: bool,
}

impl RestOperationResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            resource: None,
            prev_resource: None,
            location: None,
            etag: None,
            last_modified: None,
            outcome: None,
            completed: false,
            is_write: false,
        }
    }

    pub fn for_resource(status: StatusCode, stored: &Resource) -> Self {
        let mut response = Self::new(status).located(stored);
        response.resource = Some(stored.resource.clone());
        response
    }

    pub fn for_bundle(bundle: &Bundle) -> Result<Self> {
        let mut response = Self::new(StatusCode::OK);
        response.resource = Some(bundle.to_value()?);
        Ok(response)
    }

    /// Location, ETag and Last-Modified of `stored`, without its body.
    pub fn located(mut self, stored: &Resource) -> Self {
        self.location = Some(stored.location());
        self.etag = Some(resource::etag(stored.version_id));
        self.last_modified = Some(stored.last_updated);
        self
    }

    pub fn with_prev(mut self, prev: Option<&Resource>) -> Self {
        self.prev_resource = prev.map(|p| p.resource.clone());
        self
    }

    pub fn with_outcome(mut self, issues: Vec<Issue>) -> Self {
        self.outcome = OperationOutcome::from_warnings(issues);
        self
    }

    pub fn write(mut self) -> Self {
        self.is_write = true;
        self
    }

    pub fn completed(mut self) -> Self {
        self.completed = true;
        self
    }

    /// `Type/id` taken from the location.
    pub fn reference(&self) -> Option<String> {
        let location = self.location.as_deref()?;
        let mut parts = location.splitn(3, '/');
        match (parts.next(), parts.next()) {
            (Some(rt), Some(id)) if !rt.is_empty() && !id.is_empty() => {
                Some(format!("{}/{}", rt, id))
            }
            _ => None,
        }
    }

    /// Body to send for `preference`. Reads, searches and operations always
    /// return their resource.
    pub fn body(&self, preference: ReturnPreference) -> Option<JsonValue> {
        let outcome = || self.outcome.as_ref().map(OperationOutcome::to_value);
        if !self.is_write {
            return self.resource.clone().or_else(outcome);
        }
        match preference {
            ReturnPreference::Minimal => None,
            ReturnPreference::Representation => self.resource.clone().or_else(outcome),
            ReturnPreference::OperationOutcome => Some(outcome().unwrap_or_else(|| {
                OperationOutcome::new(vec![Issue::information("All OK")]).to_value()
            })),
        }
    }

    /// Response entry of a batch or transaction.
    pub fn into_entry(self, ctx: &RequestContext) -> BundleEntry {
        let body = self.body(ctx.return_preference);
        let full_url = self
            .reference()
            .and_then(|r| r.split_once('/').map(|(rt, id)| assembler::full_url(&ctx.base_url, rt, id)));
        BundleEntry {
            full_url,
            resource: body,
            response: Some(BundleEntryResponse {
                status: self.status.as_u16().to_string(),
                location: self.location,
                etag: self.etag,
                last_modified: self.last_modified.map(resource::format_instant),
                outcome: self.outcome.as_ref().map(OperationOutcome::to_value),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// A write whose target and new content are known but not yet stored.
#[derive(Debug, Clone)]
pub struct PreparedWrite {
    /// `create`, `update` or `patch`, for interceptors and logs.
    pub interaction: &'static str,
    pub resource_type: String,
    pub id: String,
    /// New version with `id` and `meta` already set.
    pub resource: JsonValue,
    /// Current version, deleted or not; `None` stores a new resource.
    pub prev: Option<Resource>,
    pub if_none_match: bool,
    pub status: StatusCode,
    pub warnings: Vec<Issue>,
}

/// Outcome of the meta phase of a write.
#[derive(Debug, Clone)]
pub enum MetaOutcome {
    Write(PreparedWrite),
    /// Nothing to store: a conditional create matched, an update was a
    /// no-op, or `If-None-Match` answered 304.
    Completed(RestOperationResponse),
}

#[derive(Debug, Clone, Copy)]
pub enum UpdateBody<'a> {
    Resource(&'a JsonValue),
    Patch(&'a FhirPatch),
}

/// Update or patch of one resource, by id or by search.
#[derive(Debug, Clone, Copy)]
pub struct UpdateRequest<'a> {
    pub resource_type: &'a str,
    pub id: Option<&'a str>,
    pub body: UpdateBody<'a>,
    pub search_query: Option<&'a str>,
    pub if_match: Option<&'a str>,
    pub if_none_match: bool,
    pub skippable: bool,
    /// Bundle POST entry whose id was reserved up front. Checked against the
    /// `create` allow-list and created even with update-create disabled.
    pub force_create: bool,
}

impl<'a> UpdateRequest<'a> {
    pub fn update(resource_type: &'a str, id: Option<&'a str>, resource: &'a JsonValue) -> Self {
        Self {
            resource_type,
            id,
            body: UpdateBody::Resource(resource),
            search_query: None,
            if_match: None,
            if_none_match: false,
            skippable: false,
            force_create: false,
        }
    }

    pub fn patch(resource_type: &'a str, id: Option<&'a str>, patch: &'a FhirPatch) -> Self {
        Self {
            resource_type,
            id,
            body: UpdateBody::Patch(patch),
            search_query: None,
            if_match: None,
            if_none_match: false,
            skippable: false,
            force_create: false,
        }
    }

    pub fn search_query(mut self, query: Option<&'a str>) -> Self {
        self.search_query = query.filter(|q| !q.is_empty());
        self
    }

    pub fn if_match(mut self, if_match: Option<&'a str>) -> Self {
        self.if_match = if_match.filter(|v| !v.trim().is_empty());
        self
    }

    pub fn if_none_match(mut self, if_none_match: bool) -> Self {
        self.if_none_match = if_none_match;
        self
    }

    pub fn skippable(mut self, skippable: bool) -> Self {
        self.skippable = skippable;
        self
    }

    pub fn force_create(mut self, force_create: bool) -> Self {
        self.force_create = force_create;
        self
    }

    fn is_patch(&self) -> bool {
        matches!(self.body, UpdateBody::Patch(_))
    }
}

/// Commit on success, roll back on failure.
pub(crate) async fn finish<T>(session: Box<dyn PersistenceSession>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            session.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = session.rollback().await {
                tracing::warn!(error = %rollback_err, "Rollback failed");
            }
            Err(err)
        }
    }
}

fn check_if_match(if_match: &str, current: &Resource) -> Result<()> {
    let expected = resource::version_from_etag(if_match.trim()).ok_or_else(|| {
        crate::Error::Processing(format!("Invalid ETag value specified in request: {}", if_match))
    })?;
    let actual = current.version_id.to_string();
    if expected != actual {
        return Err(crate::Error::VersionConflict { expected, actual });
    }
    Ok(())
}

/// RFC 3339 instant, or a bare date taken as midnight UTC.
fn parse_instant(name: &str, value: &str) -> Result<DateTime<Utc>> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return Ok(instant.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| {
            crate::Error::InvalidRequest(format!("Invalid value '{}' for parameter '{}'", value, name))
        })
}

fn parse_count(value: &str, max_count: usize) -> Result<usize> {
    value
        .parse::<usize>()
        .map(|c| c.min(max_count))
        .map_err(|_| crate::Error::InvalidRequest(format!("Invalid value '{}' for parameter '_count'", value)))
}

fn operation_response(result: OperationResult) -> Result<RestOperationResponse> {
    let mut response = RestOperationResponse::new(StatusCode::OK);
    match result {
        OperationResult::Resource(value) => response.resource = Some(value),
        OperationResult::Parameters(params) => {
            response.resource = Some(match params.single_resource_output() {
                Some(single) => single.clone(),
                None => params.to_value()?,
            });
        }
        OperationResult::NoContent => response.status = StatusCode::NO_CONTENT,
    }
    Ok(response)
}

/// Engine entry point for every REST interaction.
#[derive(Clone)]
pub struct RestHelper {
    persistence: Arc<dyn Persistence>,
    validator: Arc<dyn Validator>,
    registry: Arc<dyn ProfileRegistry>,
    search_parser: Arc<dyn SearchParser>,
    operations: Arc<OperationRegistry>,
    interceptors: InterceptorManager,
    config: Arc<FhirConfig>,
    retry: RetryPolicy,
    reindex_window: usize,
}

impl RestHelper {
    pub fn new(persistence: Arc<dyn Persistence>, config: FhirConfig) -> Self {
        let search_parser = Arc::new(DefaultSearchParser::new(
            config.search.default_count,
            config.search.max_count,
        ));
        let retry = RetryConfig::default();
        Self {
            persistence,
            validator: Arc::new(StructuralValidator),
            registry: Arc::new(InMemoryProfileRegistry::new()),
            search_parser,
            operations: Arc::new(OperationRegistry::with_builtins()),
            interceptors: InterceptorManager::new(),
            config: Arc::new(config),
            retry: RetryPolicy::from_config(&retry),
            reindex_window: retry.reindex_window,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn ProfileRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_search_parser(mut self, search_parser: Arc<dyn SearchParser>) -> Self {
        self.search_parser = search_parser;
        self
    }

    pub fn with_operations(mut self, operations: OperationRegistry) -> Self {
        self.operations = Arc::new(operations);
        self
    }

    pub fn with_interceptors(mut self, interceptors: InterceptorManager) -> Self {
        self.interceptors = interceptors;
        self
    }

    pub fn with_retry(mut self, retry: &RetryConfig) -> Self {
        self.retry = RetryPolicy::from_config(retry);
        self.reindex_window = retry.reindex_window.max(1);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &FhirConfig {
        &self.config
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Resources per reindex call.
    pub fn reindex_window(&self) -> usize {
        self.reindex_window
    }

    fn check_interaction(&self, interaction: &str, resource_type: &str) -> Result<()> {
        check_resource_type(resource_type)?;
        self.config.check_interaction(interaction, resource_type)
    }

    /// Erase needs the type to allow deletes and persistence to support them.
    pub fn check_erase_allowed(&self, resource_type: &str) -> Result<()> {
        self.check_interaction("delete", resource_type)?;
        if !self.persistence.is_delete_supported() {
            return Err(crate::Error::NotSupported(format!(
                "Resource deletion of type '{}' is not supported.",
                resource_type
            )));
        }
        Ok(())
    }

    async fn validate(&self, resource_type: &str, candidate: &JsonValue) -> Result<Vec<Issue>> {
        validate_resource(
            self.validator.as_ref(),
            self.registry.as_ref(),
            self.config.profile_policy(resource_type),
            candidate,
        )
        .await
    }

    /// Strict search used to resolve conditional interactions.
    async fn conditional_search(
        &self,
        session: &mut dyn PersistenceSession,
        resource_type: &str,
        query: &str,
        page_size: usize,
    ) -> Result<SearchResult> {
        let pairs: Vec<(String, String)> = parse_query_string(query)
            .into_iter()
            .flat_map(|(name, values)| values.into_iter().map(move |v| (name.clone(), v)))
            .collect();
        if pairs.is_empty() {
            return Err(crate::Error::InvalidRequest(
                "A search query string is required for a conditional interaction.".to_string(),
            ));
        }
        let mut search = self.search_parser.parse(Some(resource_type), None, &pairs, false)?;
        search.page_number = 1;
        search.page_size = page_size.max(1);
        session.search(&search).await
    }

    // ---- session-level interactions ----

    #[tracing::instrument(skip_all, fields(resource_type = %resource_type))]
    pub(crate) async fn prepare_create(
        &self,
        session: &mut dyn PersistenceSession,
        resource_type: &str,
        body: &JsonValue,
        if_none_exist: Option<&str>,
    ) -> Result<MetaOutcome> {
        self.check_interaction("create", resource_type)?;
        let body_type = resource::resource_type(body).unwrap_or_default();
        if body_type != resource_type {
            return Err(crate::Error::InvalidRequest(format!(
                "Resource type '{}' does not match type specified in request URI: {}",
                body_type, resource_type
            )));
        }

        if let Some(query) = if_none_exist.filter(|q| !q.is_empty()) {
            let found = self.conditional_search(session, resource_type, query, 2).await?;
            match found.total {
                0 => {}
                1 => {
                    let matched = found.matches.into_iter().next().ok_or_else(|| {
                        crate::Error::Internal("conditional create hit has no resource".to_string())
                    })?;
                    tracing::debug!(reference = %matched.reference(), "Conditional create matched");
                    return Ok(MetaOutcome::Completed(
                        RestOperationResponse::for_resource(StatusCode::OK, &matched)
                            .with_outcome(vec![Issue::information(
                                "Found a single match; check the Location header",
                            )])
                            .write()
                            .completed(),
                    ));
                }
                _ => {
                    return Err(crate::Error::MultipleMatches(
                        "The search criteria specified for a conditional create operation returned multiple matches."
                            .to_string(),
                    ))
                }
            }
        }

        let mut warnings = self.validate(resource_type, body).await?;
        if let Some(supplied) = resource::resource_id(body) {
            warnings.push(Issue::information(format!(
                "The create request resource included id: '{}'; this id has been replaced",
                supplied
            )));
        }

        let id = self.persistence.generate_resource_id();
        Ok(MetaOutcome::Write(PreparedWrite {
            interaction: "create",
            resource_type: resource_type.to_string(),
            resource: resource::with_meta(body, &id, 1, Utc::now()),
            id,
            prev: None,
            if_none_match: false,
            status: StatusCode::CREATED,
            warnings,
        }))
    }

    /// Resolve the target of an update or patch and build the new version.
    ///
    /// `local_refs` is the current view of bundle-local references; it is
    /// only used to compare a skippable update against the stored version.
    #[tracing::instrument(skip_all, fields(resource_type = %request.resource_type, id = ?request.id))]
    pub(crate) async fn prepare_update(
        &self,
        session: &mut dyn PersistenceSession,
        request: &UpdateRequest<'_>,
        local_refs: Option<&FrozenReferenceMap>,
    ) -> Result<MetaOutcome> {
        let resource_type = request.resource_type;
        let interaction = match (request.is_patch(), request.force_create) {
            (true, _) => "patch",
            (false, true) => "create",
            (false, false) => "update",
        };
        self.check_interaction(interaction, resource_type)?;

        let supplied_id = match request.body {
            UpdateBody::Resource(body) => {
                let body_type = resource::resource_type(body).unwrap_or_default();
                if body_type != resource_type {
                    return Err(crate::Error::InvalidRequest(format!(
                        "Resource type '{}' does not match type specified in request URI: {}",
                        body_type, resource_type
                    )));
                }
                resource::resource_id(body)
            }
            UpdateBody::Patch(_) => None,
        };

        let (id, prev) = match request.search_query {
            Some(query) => {
                let found = self.conditional_search(session, resource_type, query, 2).await?;
                match found.total {
                    0 if request.is_patch() => {
                        return Err(crate::Error::NotFound(
                            "The search criteria specified for a conditional patch operation did not return any results."
                                .to_string(),
                        ))
                    }
                    0 => {
                        let id = supplied_id
                            .map(str::to_string)
                            .unwrap_or_else(|| self.persistence.generate_resource_id());
                        (id, None)
                    }
                    1 => {
                        let matched = found.matches.into_iter().next().ok_or_else(|| {
                            crate::Error::Internal("conditional update hit has no resource".to_string())
                        })?;
                        if supplied_id.is_some_and(|s| s != matched.id) {
                            return Err(crate::Error::InvalidValue(
                                "Input resource 'id' attribute must match the id of the search result resource."
                                    .to_string(),
                            ));
                        }
                        (matched.id.clone(), Some(matched))
                    }
                    _ => {
                        return Err(crate::Error::MultipleMatches(
                            "The search criteria specified for a conditional update/patch operation returned multiple matches."
                                .to_string(),
                        ))
                    }
                }
            }
            None => {
                let id = request.id.ok_or_else(|| {
                    crate::Error::RequiredFieldMissing(
                        "The 'id' parameter is required for an update/patch operation.".to_string(),
                    )
                })?;
                if !request.is_patch() && !request.force_create {
                    match supplied_id {
                        None => {
                            return Err(crate::Error::InvalidRequest(
                                "Input resource must contain an 'id' attribute.".to_string(),
                            ))
                        }
                        Some(supplied) if supplied != id => {
                            return Err(crate::Error::InvalidValue(
                                "Input resource 'id' attribute must match 'id' parameter.".to_string(),
                            ))
                        }
                        Some(_) => {}
                    }
                }
                (id.to_string(), session.read(resource_type, id).await?)
            }
        };

        let candidate = match (request.body, &prev) {
            (UpdateBody::Resource(body), _) => resource::with_id(body, &id),
            (UpdateBody::Patch(patch), Some(current)) if !current.deleted => {
                patch.apply(&current.resource)?
            }
            (UpdateBody::Patch(_), Some(current)) => {
                return Err(crate::Error::ResourceDeleted {
                    resource_type: resource_type.to_string(),
                    id,
                    version_id: Some(current.version_id),
                })
            }
            (UpdateBody::Patch(_), None) => {
                return Err(crate::Error::ResourceNotFound {
                    resource_type: resource_type.to_string(),
                    id,
                })
            }
        };

        let mut warnings = self.validate(resource_type, &candidate).await?;
        if let Some(supplied) = supplied_id.filter(|s| request.force_create && *s != id) {
            warnings.push(Issue::information(format!(
                "The create request resource included id: '{}'; this id has been replaced",
                supplied
            )));
        }

        if let (Some(if_match), Some(current)) = (request.if_match, &prev) {
            check_if_match(if_match, current)?;
        }

        if request.if_none_match {
            if let Some(current) = prev.as_ref().filter(|p| !p.deleted) {
                if self.config.if_none_match_returns_not_modified {
                    return Ok(MetaOutcome::Completed(
                        RestOperationResponse::new(StatusCode::NOT_MODIFIED)
                            .located(current)
                            .write()
                            .completed(),
                    ));
                }
                return Err(crate::Error::PreconditionFailed(format!(
                    "IfNoneMatch precondition failed. Resource '{}' already exists.",
                    current.reference()
                )));
            }
        }

        if let Some(current) = prev.as_ref().filter(|p| request.skippable && !p.deleted) {
            let comparable = match local_refs {
                Some(refs) => refs.rewrite(&candidate).ok(),
                None => Some(candidate.clone()),
            };
            if comparable.is_some_and(|c| same_content(&c, &current.resource)) {
                tracing::debug!(reference = %current.reference(), "Skipping update with unchanged content");
                return Ok(MetaOutcome::Completed(
                    RestOperationResponse::for_resource(StatusCode::OK, current)
                        .with_prev(Some(current))
                        .write()
                        .completed(),
                ));
            }
        }

        if prev.is_none()
            && !request.force_create
            && !(self.config.allow_update_create && self.persistence.is_update_create_enabled())
        {
            return Err(crate::Error::NotSupported(format!(
                "Resource '{}/{}' does not exist and update-create is not enabled.",
                resource_type, id
            )));
        }

        let version = prev.as_ref().map_or(1, |p| p.version_id + 1);
        let status = match &prev {
            Some(current) if !current.deleted => StatusCode::OK,
            _ => StatusCode::CREATED,
        };
        Ok(MetaOutcome::Write(PreparedWrite {
            interaction: if prev.is_none() { "create" } else { interaction },
            resource_type: resource_type.to_string(),
            resource: resource::with_meta(&candidate, &id, version, Utc::now()),
            id,
            prev,
            if_none_match: request.if_none_match,
            status,
            warnings,
        }))
    }

    /// Store a prepared write, firing interceptors around it.
    pub(crate) async fn persist_write(
        &self,
        session: &mut dyn PersistenceSession,
        write: PreparedWrite,
    ) -> Result<RestOperationResponse> {
        let PreparedWrite {
            interaction,
            resource_type,
            id,
            resource: body,
            prev,
            if_none_match,
            status,
            warnings,
        } = write;
        let prev_body = prev.as_ref().map(|p| &p.resource);

        self.interceptors
            .fire_before(
                &InterceptorEvent::new(interaction)
                    .target(&resource_type, Some(&id))
                    .resource(Some(&body))
                    .prev_resource(prev_body),
            )
            .await?;

        let candidate = Resource::from_document(body, false)?;
        let stored = if prev.is_none() {
            session.create(&candidate).await
        } else {
            session.update(&candidate).await
        };
        let stored = match stored {
            Ok(stored) => stored,
            // Created by someone else since the meta phase.
            Err(crate::Error::Conflict(_)) if if_none_match && prev.is_none() => {
                if self.config.if_none_match_returns_not_modified {
                    return Ok(RestOperationResponse::new(StatusCode::NOT_MODIFIED).write());
                }
                return Err(crate::Error::PreconditionFailed(format!(
                    "IfNoneMatch precondition failed. Resource '{}/{}' already exists.",
                    resource_type, id
                )));
            }
            Err(err) => return Err(err),
        };

        self.interceptors
            .fire_after(
                &InterceptorEvent::new(interaction)
                    .target(&resource_type, Some(&id))
                    .resource(Some(&stored.resource))
                    .prev_resource(prev_body),
            )
            .await?;

        tracing::debug!(
            interaction,
            location = %stored.location(),
            status = status.as_u16(),
            "Stored resource"
        );
        Ok(RestOperationResponse::for_resource(status, &stored)
            .with_prev(prev.as_ref())
            .with_outcome(warnings)
            .write())
    }

    async fn write_in(
        &self,
        session: &mut dyn PersistenceSession,
        meta: MetaOutcome,
    ) -> Result<RestOperationResponse> {
        match meta {
            MetaOutcome::Write(write) => self.persist_write(session, write).await,
            MetaOutcome::Completed(response) => Ok(response),
        }
    }

    #[tracing::instrument(skip_all, fields(resource_type = %resource_type, id = ?id))]
    pub(crate) async fn delete_in(
        &self,
        session: &mut dyn PersistenceSession,
        resource_type: &str,
        id: Option<&str>,
        search_query: Option<&str>,
    ) -> Result<RestOperationResponse> {
        self.check_interaction("delete", resource_type)?;
        if !self.persistence.is_delete_supported() {
            return Err(crate::Error::NotSupported(format!(
                "Resource deletion of type '{}' is not supported.",
                resource_type
            )));
        }

        let mut response = RestOperationResponse::new(StatusCode::NO_CONTENT).write();
        let mut warnings = Vec::new();
        let targets = match (search_query.filter(|q| !q.is_empty()), id) {
            (Some(query), _) => {
                let max = self.config.conditional_delete_max_number;
                let found = self.conditional_search(session, resource_type, query, max).await?;
                if found.total == 0 {
                    response.status = StatusCode::OK;
                    return Ok(response.with_outcome(vec![Issue::warning(
                        IssueType::NotFound,
                        "Search criteria for a conditional delete operation yielded no matches.",
                    )]));
                }
                if found.total > max {
                    return Err(crate::Error::MultipleMatches(format!(
                        "The search criteria specified for a conditional delete operation returned too many matches ( > {} ).",
                        max
                    )));
                }
                found.matches
            }
            (None, Some(id)) => match session.read(resource_type, id).await? {
                None => {
                    warnings.push(Issue::warning(
                        IssueType::NotFound,
                        format!("Cannot find {} with id '{}'.", resource_type, id),
                    ));
                    Vec::new()
                }
                Some(current) if current.deleted => {
                    response = response.located(&current);
                    warnings.push(Issue::warning(
                        IssueType::Deleted,
                        format!(
                            "Resource of type '{}' with id '{}' is already deleted.",
                            resource_type, id
                        ),
                    ));
                    Vec::new()
                }
                Some(current) => vec![current],
            },
            (None, None) => {
                return Err(crate::Error::RequiredFieldMissing(
                    "The 'id' parameter is required for a delete operation.".to_string(),
                ))
            }
        };

        let mut deleted_ids = Vec::with_capacity(targets.len());
        for target in &targets {
            self.interceptors
                .fire_before(
                    &InterceptorEvent::new("delete")
                        .target(resource_type, Some(&target.id))
                        .prev_resource(Some(&target.resource)),
                )
                .await?;
            let marker = session.delete(resource_type, &target.id, Utc::now()).await?;
            self.interceptors
                .fire_after(
                    &InterceptorEvent::new("delete")
                        .target(resource_type, Some(&target.id))
                        .resource(Some(&marker.resource))
                        .prev_resource(Some(&target.resource)),
                )
                .await?;
            if targets.len() == 1 {
                response = response.located(&marker).with_prev(Some(target));
            }
            deleted_ids.push(target.id.as_str());
        }

        if !deleted_ids.is_empty() {
            tracing::debug!(resource_type, count = deleted_ids.len(), "Deleted resources");
            warnings.push(Issue::information(format!(
                "Deleted {} {} resource(s) with the following id(s): {}",
                deleted_ids.len(),
                resource_type,
                deleted_ids.join(",")
            )));
        }
        if !warnings.is_empty() {
            response.status = StatusCode::OK;
            response = response.with_outcome(warnings);
        }
        Ok(response)
    }

    pub(crate) async fn read_in(
        &self,
        session: &mut dyn PersistenceSession,
        resource_type: &str,
        id: &str,
    ) -> Result<Resource> {
        self.check_interaction("read", resource_type)?;
        self.interceptors
            .fire_before(&InterceptorEvent::new("read").target(resource_type, Some(id)))
            .await?;

        let current = session
            .read(resource_type, id)
            .await?
            .ok_or_else(|| crate::Error::ResourceNotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            })?;
        if current.deleted {
            return Err(crate::Error::ResourceDeleted {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
                version_id: Some(current.version_id),
            });
        }

        self.interceptors
            .fire_after(
                &InterceptorEvent::new("read")
                    .target(resource_type, Some(id))
                    .resource(Some(&current.resource)),
            )
            .await?;
        Ok(current)
    }

    pub(crate) async fn vread_in(
        &self,
        session: &mut dyn PersistenceSession,
        resource_type: &str,
        id: &str,
        version_id: &str,
    ) -> Result<Resource> {
        self.check_interaction("vread", resource_type)?;
        let version: i32 = version_id.parse().map_err(|_| {
            crate::Error::InvalidRequest(format!("Invalid version id '{}'", version_id))
        })?;
        self.interceptors
            .fire_before(&InterceptorEvent::new("vread").target(resource_type, Some(id)))
            .await?;

        let found = session
            .vread(resource_type, id, version)
            .await?
            .ok_or_else(|| crate::Error::VersionNotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
                version_id: version_id.to_string(),
            })?;
        if found.deleted {
            return Err(crate::Error::ResourceDeleted {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
                version_id: Some(found.version_id),
            });
        }

        self.interceptors
            .fire_after(
                &InterceptorEvent::new("vread")
                    .target(resource_type, Some(id))
                    .resource(Some(&found.resource)),
            )
            .await?;
        Ok(found)
    }

    #[tracing::instrument(skip_all, fields(resource_type = ?resource_type))]
    pub(crate) async fn search_in(
        &self,
        session: &mut dyn PersistenceSession,
        ctx: &RequestContext,
        resource_type: Option<&str>,
        compartment: Option<(&str, &str)>,
        query: &[(String, String)],
        request_uri: &str,
    ) -> Result<Bundle> {
        if let Some(rt) = resource_type {
            self.check_interaction("search", rt)?;
        }
        if let Some((compartment_type, _)) = compartment {
            check_resource_type(compartment_type)?;
        }

        let lenient = ctx.lenient.unwrap_or(self.config.search.lenient);
        let mut search = self.search_parser.parse(resource_type, compartment, query, lenient)?;

        let event = match resource_type {
            Some(rt) => InterceptorEvent::new("search").target(rt, None),
            None => InterceptorEvent::new("search"),
        };
        self.interceptors.fire_before(&event).await?;

        let result = session.search(&search).await?;
        search.set_totals(result.total, result.matches.len());
        let bundle = assembler::search_bundle(
            &search,
            &result,
            &ctx.base_url,
            request_uri,
            self.config.search.max_includes,
        )?;

        self.interceptors.fire_after(&event).await?;
        tracing::debug!(total = result.total, page = search.page_number, "Search complete");
        Ok(bundle)
    }

    fn history_query(&self, query: &[(String, String)]) -> Result<HistoryQuery> {
        let search = &self.config.search;
        let mut history = HistoryQuery {
            count: search.default_count,
            ..Default::default()
        };
        for (name, value) in query {
            match name.as_str() {
                "_count" => history.count = parse_count(value, search.max_count)?,
                "_page" => {
                    history.page = value.parse::<usize>().ok().filter(|p| *p > 0).ok_or_else(|| {
                        crate::Error::InvalidRequest(format!("Invalid value '{}' for parameter '_page'", value))
                    })?
                }
                "_since" => history.since = Some(parse_instant(name, value)?),
                "_at" => history.at = Some(parse_instant(name, value)?),
                "_sort" => {
                    history.sort_ascending = match value.as_str() {
                        "_lastUpdated" => true,
                        "-_lastUpdated" => false,
                        other => {
                            return Err(crate::Error::InvalidRequest(format!(
                                "Invalid value '{}' for parameter '_sort'",
                                other
                            )))
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(history)
    }

    #[tracing::instrument(skip_all, fields(resource_type = ?resource_type, id = ?id))]
    pub(crate) async fn history_in(
        &self,
        session: &mut dyn PersistenceSession,
        ctx: &RequestContext,
        resource_type: Option<&str>,
        id: Option<&str>,
        query: &[(String, String)],
        request_uri: &str,
    ) -> Result<Bundle> {
        let Some(resource_type) = resource_type else {
            return self.system_history_in(session, ctx, query, request_uri).await;
        };
        self.check_interaction("history", resource_type)?;
        let history = self.history_query(query)?;

        let event = InterceptorEvent::new("history").target(resource_type, id);
        self.interceptors.fire_before(&event).await?;
        let page = session.history(Some(resource_type), id, &history).await?;
        self.interceptors.fire_after(&event).await?;

        let items = page.entries.iter().map(HistoryItem::from_resource).collect();
        let mut bundle = assembler::history_bundle(items, Some(page.total), &ctx.base_url);
        let last_page = if history.count == 0 {
            1
        } else {
            page.total.div_ceil(history.count).max(1)
        };
        assembler::add_paging_links(&mut bundle, request_uri, history.page, last_page, history.count == 0);
        Ok(bundle)
    }

    fn changes_query(&self, query: &[(String, String)]) -> Result<ChangesQuery> {
        let search = &self.config.search;
        let mut changes = ChangesQuery {
            count: search.default_count,
            ..Default::default()
        };
        for (name, value) in query {
            match name.as_str() {
                "_count" => changes.count = parse_count(value, search.max_count)?,
                "_since" => changes.since = Some(parse_instant(name, value)?),
                "_before" => changes.before = Some(parse_instant(name, value)?),
                "_changeIdMarker" => {
                    changes.change_id_marker = Some(value.parse::<i64>().map_err(|_| {
                        crate::Error::InvalidRequest(format!(
                            "Invalid value '{}' for parameter '_changeIdMarker'",
                            value
                        ))
                    })?)
                }
                "_sort" => {
                    changes.order = match value.as_str() {
                        "none" | "" => ChangeOrder::ChangeId,
                        "_lastUpdated" => ChangeOrder::LastUpdatedAsc,
                        "-_lastUpdated" => ChangeOrder::LastUpdatedDesc,
                        other => {
                            return Err(crate::Error::InvalidRequest(format!(
                                "Invalid value '{}' for parameter '_sort'",
                                other
                            )))
                        }
                    }
                }
                "_type" => {
                    for resource_type in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                        self.check_interaction("history", resource_type)?;
                        changes.resource_types.push(resource_type.to_string());
                    }
                }
                _ => {}
            }
        }
        Ok(changes)
    }

    /// Link to the page after `last` in the order of `changes`.
    fn next_changes_url(&self, ctx: &RequestContext, changes: &ChangesQuery, last: &crate::models::ChangeRecord) -> String {
        let mut params = vec![("_count".to_string(), changes.count.to_string())];
        if !changes.resource_types.is_empty() {
            params.push(("_type".to_string(), changes.resource_types.join(",")));
        }
        let since = changes.since.map(resource::format_instant);
        let before = changes.before.map(resource::format_instant);
        let last_at = resource::format_instant(last.changed_at);
        match changes.order {
            ChangeOrder::ChangeId => {
                params.extend(since.map(|s| ("_since".to_string(), s)));
                params.extend(before.map(|b| ("_before".to_string(), b)));
            }
            ChangeOrder::LastUpdatedAsc => {
                params.push(("_sort".to_string(), "_lastUpdated".to_string()));
                params.push(("_since".to_string(), last_at));
                params.extend(before.map(|b| ("_before".to_string(), b)));
            }
            ChangeOrder::LastUpdatedDesc => {
                params.push(("_sort".to_string(), "-_lastUpdated".to_string()));
                params.push(("_before".to_string(), last_at));
                params.extend(since.map(|s| ("_since".to_string(), s)));
            }
        }
        params.push(("_changeIdMarker".to_string(), last.change_id.to_string()));

        let query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect();
        format!("{}/_history?{}", ctx.base_url, query.join("&"))
    }

    /// Whole-system history: a cursor over the change log.
    #[tracing::instrument(skip_all)]
    pub(crate) async fn system_history_in(
        &self,
        session: &mut dyn PersistenceSession,
        ctx: &RequestContext,
        query: &[(String, String)],
        request_uri: &str,
    ) -> Result<Bundle> {
        let changes = self.changes_query(query)?;

        let event = InterceptorEvent::new("history");
        self.interceptors.fire_before(&event).await?;
        let records = session.changes(&changes).await?;
        let total = session.changes_total(&changes.resource_types).await?;

        let mut items = Vec::with_capacity(records.len());
        for record in &records {
            let version = match record.change_type {
                crate::models::ChangeType::Delete => None,
                _ => {
                    session
                        .vread(&record.resource_type, &record.logical_id, record.version_id)
                        .await?
                }
            };
            items.push(HistoryItem::from_change(record, version.as_ref()));
        }
        self.interceptors.fire_after(&event).await?;

        let mut bundle = assembler::history_bundle(items, Some(total), &ctx.base_url);
        bundle.add_link("self", request_uri);
        if changes.count > 0 && records.len() == changes.count {
            if let Some(last) = records.last() {
                bundle.add_link("next", self.next_changes_url(ctx, &changes, last));
            }
        }
        Ok(bundle)
    }

    fn operation_request(
        &self,
        operation_name: &str,
        context: &OperationContext,
        body: Option<&JsonValue>,
        query: &[(String, String)],
    ) -> Result<OperationRequest> {
        let parameters = match body {
            Some(body) if resource::resource_type(body) == Some("Parameters") => {
                Parameters::from_value(body)?
            }
            Some(body) => {
                let mut params = Parameters::new();
                params.add_resource("resource".to_string(), body.clone());
                params
            }
            None => Parameters::from_query(query),
        };
        Ok(OperationRequest {
            operation_name: operation_name.to_string(),
            context: context.clone(),
            version_id: None,
            parameters,
        })
    }

    #[tracing::instrument(skip_all, fields(operation = %operation_name))]
    pub(crate) async fn invoke_in(
        &self,
        session: &mut dyn PersistenceSession,
        ctx: &RequestContext,
        operation_name: &str,
        context: &OperationContext,
        body: Option<&JsonValue>,
        query: &[(String, String)],
    ) -> Result<RestOperationResponse> {
        if let Some(rt) = context.resource_type() {
            check_resource_type(rt)?;
        }
        let operation = self.operations.find(operation_name, context)?;
        let request = self.operation_request(operation_name, context, body, query)?;

        let event = match context {
            OperationContext::System => InterceptorEvent::new("operation"),
            OperationContext::Type(rt) => InterceptorEvent::new("operation").target(rt, None),
            OperationContext::Instance(rt, id) => {
                InterceptorEvent::new("operation").target(rt, Some(id))
            }
        };
        self.interceptors.fire_before(&event).await?;
        let result = operation.invoke(self, session, ctx, &request).await?;
        self.interceptors.fire_after(&event).await?;
        operation_response(result)
    }

    // ---- public façade: one session per call ----

    pub async fn do_create(
        &self,
        ctx: &RequestContext,
        resource_type: &str,
        body: &JsonValue,
        if_none_exist: Option<&str>,
    ) -> Result<RestOperationResponse> {
        tracing::debug!(correlation_id = ?ctx.correlation_id, resource_type, "create");
        let mut session = self.persistence.begin().await?;
        let result = async {
            let meta = self
                .prepare_create(session.as_mut(), resource_type, body, if_none_exist)
                .await?;
            self.write_in(session.as_mut(), meta).await
        }
        .await;
        finish(session, result).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn do_update(
        &self,
        ctx: &RequestContext,
        resource_type: &str,
        id: Option<&str>,
        body: &JsonValue,
        search_query: Option<&str>,
        if_match: Option<&str>,
        if_none_match: bool,
    ) -> Result<RestOperationResponse> {
        let request = UpdateRequest::update(resource_type, id, body)
            .search_query(search_query)
            .if_match(if_match)
            .if_none_match(if_none_match)
            .skippable(self.config.skippable_updates);
        self.do_patch_or_update(ctx, &request).await
    }

    pub async fn do_patch(
        &self,
        ctx: &RequestContext,
        resource_type: &str,
        id: Option<&str>,
        patch: &FhirPatch,
        search_query: Option<&str>,
        if_match: Option<&str>,
    ) -> Result<RestOperationResponse> {
        let request = UpdateRequest::patch(resource_type, id, patch)
            .search_query(search_query)
            .if_match(if_match)
            .skippable(self.config.skippable_updates);
        self.do_patch_or_update(ctx, &request).await
    }

    pub async fn do_patch_or_update(
        &self,
        ctx: &RequestContext,
        request: &UpdateRequest<'_>,
    ) -> Result<RestOperationResponse> {
        tracing::debug!(
            correlation_id = ?ctx.correlation_id,
            resource_type = request.resource_type,
            id = ?request.id,
            patch = request.is_patch(),
            "update"
        );
        let mut session = self.persistence.begin().await?;
        let result = async {
            let meta = self.prepare_update(session.as_mut(), request, None).await?;
            self.write_in(session.as_mut(), meta).await
        }
        .await;
        finish(session, result).await
    }

    pub async fn do_delete(
        &self,
        ctx: &RequestContext,
        resource_type: &str,
        id: Option<&str>,
        search_query: Option<&str>,
    ) -> Result<RestOperationResponse> {
        tracing::debug!(correlation_id = ?ctx.correlation_id, resource_type, id = ?id, "delete");
        let mut session = self.persistence.begin().await?;
        let result = self
            .delete_in(session.as_mut(), resource_type, id, search_query)
            .await;
        finish(session, result).await
    }

    pub async fn do_read(
        &self,
        ctx: &RequestContext,
        resource_type: &str,
        id: &str,
    ) -> Result<RestOperationResponse> {
        tracing::trace!(correlation_id = ?ctx.correlation_id, resource_type, id, "read");
        let mut session = self.persistence.begin().await?;
        let result = self.read_in(session.as_mut(), resource_type, id).await;
        let current = finish(session, result).await?;
        Ok(RestOperationResponse::for_resource(StatusCode::OK, &current))
    }

    pub async fn do_vread(
        &self,
        ctx: &RequestContext,
        resource_type: &str,
        id: &str,
        version_id: &str,
    ) -> Result<RestOperationResponse> {
        tracing::trace!(correlation_id = ?ctx.correlation_id, resource_type, id, version_id, "vread");
        let mut session = self.persistence.begin().await?;
        let result = self
            .vread_in(session.as_mut(), resource_type, id, version_id)
            .await;
        let found = finish(session, result).await?;
        Ok(RestOperationResponse::for_resource(StatusCode::OK, &found))
    }

    pub async fn do_search(
        &self,
        ctx: &RequestContext,
        resource_type: Option<&str>,
        compartment: Option<(&str, &str)>,
        query: &[(String, String)],
        request_uri: &str,
    ) -> Result<Bundle> {
        let mut session = self.persistence.begin().await?;
        let result = self
            .search_in(session.as_mut(), ctx, resource_type, compartment, query, request_uri)
            .await;
        finish(session, result).await
    }

    /// Type or instance history.
    pub async fn do_history(
        &self,
        ctx: &RequestContext,
        resource_type: &str,
        id: Option<&str>,
        query: &[(String, String)],
        request_uri: &str,
    ) -> Result<Bundle> {
        let mut session = self.persistence.begin().await?;
        let result = self
            .history_in(session.as_mut(), ctx, Some(resource_type), id, query, request_uri)
            .await;
        finish(session, result).await
    }

    pub async fn do_system_history(
        &self,
        ctx: &RequestContext,
        query: &[(String, String)],
        request_uri: &str,
    ) -> Result<Bundle> {
        let mut session = self.persistence.begin().await?;
        let result = self
            .system_history_in(session.as_mut(), ctx, query, request_uri)
            .await;
        finish(session, result).await
    }

    pub async fn do_invoke(
        &self,
        ctx: &RequestContext,
        operation_name: &str,
        context: &OperationContext,
        body: Option<&JsonValue>,
        query: &[(String, String)],
    ) -> Result<RestOperationResponse> {
        if let Some(rt) = context.resource_type() {
            check_resource_type(rt)?;
        }
        let operation = self.operations.find(operation_name, context)?;

        if operation.manages_sessions() {
            let request = self.operation_request(operation_name, context, body, query)?;
            let result = operation.invoke_standalone(self, ctx, &request).await?;
            return operation_response(result);
        }

        let attempt = |_: u32| async move {
            let mut session = self.persistence.begin().await?;
            let result = self
                .invoke_in(session.as_mut(), ctx, operation_name, context, body, query)
                .await;
            finish(session, result).await
        };
        if operation.retryable() {
            self.retry
                .run(&format!("${}", operation_name), attempt)
                .await
        } else {
            attempt(1).await
        }
    }

    /// Reindex in fresh sessions, retrying lock conflicts. An explicit list
    /// of references is processed in windows.
    pub async fn do_reindex(
        &self,
        ctx: &RequestContext,
        request: &ReindexRequest,
    ) -> Result<ReindexResult> {
        if let Some(rt) = &request.resource_type {
            check_resource_type(rt)?;
        }
        tracing::info!(
            correlation_id = ?ctx.correlation_id,
            resource_type = ?request.resource_type,
            references = request.references.len(),
            "Reindex requested"
        );

        if request.references.is_empty() {
            return self
                .retry
                .run("reindex", |_| async move {
                    let mut session = self.persistence.begin().await?;
                    let result = session.reindex(request).await;
                    finish(session, result).await
                })
                .await;
        }

        let results = self
            .retry
            .run_windowed("reindex", &request.references, self.reindex_window, |chunk| async move {
                let window = ReindexRequest {
                    references: chunk,
                    ..request.clone()
                };
                let mut session = self.persistence.begin().await?;
                let result = session.reindex(&window).await;
                finish(session, result).await
            })
            .await?;

        Ok(results.into_iter().fold(ReindexResult::default(), |mut acc, r| {
            acc.processed += r.processed;
            acc.references.extend(r.references);
            acc
        }))
    }

    pub async fn do_erase(
        &self,
        ctx: &RequestContext,
        resource_type: &str,
        id: &str,
        version: Option<i32>,
    ) -> Result<EraseResult> {
        self.check_erase_allowed(resource_type)?;
        tracing::info!(correlation_id = ?ctx.correlation_id, resource_type, id, version = ?version, "Erase requested");
        let request = EraseRequest {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
            version,
        };
        let request = &request;
        self.retry
            .run("erase", |_| async move {
                let mut session = self.persistence.begin().await?;
                let result = session.erase(request).await;
                finish(session, result).await
            })
            .await
    }

    /// Envelope checks for every entry. Rejected entries get their final
    /// response here (batch) or fail the bundle (transaction); accepted ones
    /// get a `202` placeholder.
    fn validate_bundle(&self, bundle: &Bundle, transaction: bool) -> Result<HashMap<usize, BundleEntry>> {
        let mut responses = HashMap::with_capacity(bundle.entry_count());
        let mut full_urls = HashSet::new();

        for (index, entry) in bundle.entries().iter().enumerate() {
            if let Some(full_url) = entry.full_url.as_deref() {
                if !full_urls.insert(full_url) {
                    return Err(crate::Error::InvalidRequest(format!(
                        "Duplicate fullUrl value '{}' in bundle",
                        full_url
                    )));
                }
            }

            match check_entry(entry) {
                Ok(()) => {
                    responses.insert(
                        index,
                        BundleEntry {
                            response: Some(BundleEntryResponse::with_status("202")),
                            ..Default::default()
                        },
                    );
                }
                Err(err) if transaction => {
                    let (method, url) = entry
                        .request
                        .as_ref()
                        .map(|r| (r.method.as_str(), r.url.as_str()))
                        .unwrap_or(("", ""));
                    return Err(err.with_entry_context(
                        index,
                        crate::interaction::request_description(index, None, method, url),
                    ));
                }
                Err(err) => {
                    responses.insert(index, executor::error_entry(&err));
                }
            }
        }
        Ok(responses)
    }

    /// Process a batch or transaction bundle.
    #[tracing::instrument(skip_all, fields(correlation_id = ?ctx.correlation_id))]
    pub async fn do_bundle(&self, ctx: &RequestContext, body: &JsonValue) -> Result<Bundle> {
        if resource::resource_type(body) != Some("Bundle") {
            return Err(crate::Error::InvalidRequest(
                "Request resource type must be 'Bundle'.".to_string(),
            ));
        }
        let bundle = Bundle::from_value(body.clone())?;
        let transaction = match bundle.bundle_type {
            BundleType::Transaction => true,
            BundleType::Batch => false,
            _ => {
                return Err(crate::Error::InvalidRequest(
                    "Bundle.type must be either 'batch' or 'transaction'.".to_string(),
                ))
            }
        };
        if transaction && !self.persistence.is_transactional() {
            return Err(crate::Error::NotSupported(
                "Bundled 'transaction' request cannot be processed because the configured persistence layer does not support transactions."
                    .to_string(),
            ));
        }
        tracing::info!(transaction, entries = bundle.entry_count(), "Processing bundle");

        let validation = self.validate_bundle(&bundle, transaction)?;
        let mut local_refs = LocalReferenceMap::new();
        reserve_local_identifiers(
            &bundle,
            &validation,
            || self.persistence.generate_resource_id(),
            &mut local_refs,
        )?;

        let options = TranslateOptions {
            fail_fast: transaction,
            correlation_id: ctx.correlation_id.as_deref(),
            skippable_updates: self.config.skippable_updates,
            base_url: &ctx.base_url,
        };
        let interactions = translator::translate(&bundle, &validation, &local_refs, &options)?;
        let entries = executor::execute(
            self,
            ctx,
            interactions,
            local_refs,
            transaction,
            bundle.entry_count(),
        )
        .await?;
        Ok(assembler::response_bundle(transaction, entries))
    }
}

fn check_entry(entry: &BundleEntry) -> Result<()> {
    let request = entry.request.as_ref().ok_or_else(|| {
        crate::Error::InvalidRequest("Bundle.Entry.request is required for bundle entries.".to_string())
    })?;
    let method = parse_method(&request.method)?;
    if request.url.trim().is_empty() {
        return Err(crate::Error::InvalidRequest(
            "Bundle.Entry.request.url is required for bundle entries.".to_string(),
        ));
    }
    if let Some(body) = &entry.resource {
        if resource::resource_type(body).is_none() {
            return Err(crate::Error::InvalidRequest(
                "Bundle.Entry.resource must be a resource with a 'resourceType'.".to_string(),
            ));
        }
    } else if method == Method::PATCH {
        return Err(crate::Error::InvalidRequest(
            "Request resource type for PATCH request must be type 'Parameters'".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;
    use serde_json::json;

    fn helper() -> RestHelper {
        RestHelper::new(Arc::new(InMemoryPersistence::new()), FhirConfig::default())
            .with_retry_policy(RetryPolicy::new(3, std::time::Duration::ZERO, std::time::Duration::ZERO))
    }

    fn ctx() -> RequestContext {
        RequestContext::new("http://localhost/fhir")
    }

    fn patient(id: Option<&str>, family: &str) -> JsonValue {
        let mut p = json!({ "resourceType": "Patient", "name": [{ "family": family }] });
        if let Some(id) = id {
            p["id"] = json!(id);
        }
        p
    }

    #[test]
    fn prefer_header_parsing() {
        let ctx = ctx().with_prefer_header(Some("return=minimal; handling=strict"));
        assert_eq!(ctx.return_preference, ReturnPreference::Minimal);
        assert_eq!(ctx.lenient, Some(false));
        let ctx = ctx.with_prefer_header(Some("return=OperationOutcome"));
        assert_eq!(ctx.return_preference, ReturnPreference::OperationOutcome);
    }

    #[test]
    fn body_follows_preference_for_writes_only() {
        let mut response = RestOperationResponse::new(StatusCode::CREATED).write();
        response.resource = Some(json!({ "resourceType": "Patient" }));
        assert!(response.body(ReturnPreference::Minimal).is_none());
        assert_eq!(
            response.body(ReturnPreference::OperationOutcome).unwrap()["issue"][0]["details"]["text"],
            "All OK"
        );

        let read = RestOperationResponse {
            is_write: false,
            ..response
        };
        assert!(read.body(ReturnPreference::Minimal).is_some());
    }

    #[tokio::test]
    async fn create_replaces_client_id() {
        let helper = helper();
        let response = helper
            .do_create(&ctx(), "Patient", &patient(Some("mine"), "Doe"), None)
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
        let body = response.resource.unwrap();
        assert_ne!(body["id"], "mine");
        assert_eq!(body["meta"]["versionId"], "1");
        let outcome = response.outcome.unwrap();
        assert!(outcome.issue[0].message().contains("this id has been replaced"));
    }

    #[tokio::test]
    async fn create_rejects_type_mismatch() {
        let err = helper()
            .do_create(&ctx(), "Observation", &patient(None, "Doe"), None)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Resource type 'Patient' does not match type specified in request URI: Observation"
        );
    }

    #[tokio::test]
    async fn update_versions_and_skips_unchanged() {
        let helper = helper();
        let first = helper
            .do_update(&ctx(), "Patient", Some("p1"), &patient(Some("p1"), "Doe"), None, None, false)
            .await
            .unwrap();
        assert_eq!(first.status, StatusCode::CREATED);

        let same = helper
            .do_update(&ctx(), "Patient", Some("p1"), &patient(Some("p1"), "Doe"), None, None, false)
            .await
            .unwrap();
        assert_eq!(same.status, StatusCode::OK);
        assert!(same.completed);
        assert_eq!(same.etag.as_deref(), Some("W/\"1\""));

        let changed = helper
            .do_update(&ctx(), "Patient", Some("p1"), &patient(Some("p1"), "Roe"), None, None, false)
            .await
            .unwrap();
        assert_eq!(changed.etag.as_deref(), Some("W/\"2\""));
        assert!(changed.prev_resource.is_some());
    }

    #[tokio::test]
    async fn update_id_rules() {
        let helper = helper();
        let err = helper
            .do_update(&ctx(), "Patient", Some("p1"), &patient(None, "Doe"), None, None, false)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Input resource must contain an 'id' attribute.");

        let err = helper
            .do_update(&ctx(), "Patient", Some("p1"), &patient(Some("p2"), "Doe"), None, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::InvalidValue(_)));
    }

    #[tokio::test]
    async fn stale_if_match_is_a_version_conflict() {
        let helper = helper();
        helper
            .do_update(&ctx(), "Patient", Some("p1"), &patient(Some("p1"), "Doe"), None, None, false)
            .await
            .unwrap();
        let err = helper
            .do_update(&ctx(), "Patient", Some("p1"), &patient(Some("p1"), "Roe"), None, Some("W/\"7\""), false)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::PRECONDITION_FAILED);

        let err = helper
            .do_update(&ctx(), "Patient", Some("p1"), &patient(Some("p1"), "Roe"), None, Some("7"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Processing(_)));
    }

    #[tokio::test]
    async fn update_create_can_be_disabled() {
        let config = FhirConfig {
            allow_update_create: false,
            ..Default::default()
        };
        let helper = RestHelper::new(Arc::new(InMemoryPersistence::new()), config);
        let err = helper
            .do_update(&ctx(), "Patient", Some("p1"), &patient(Some("p1"), "Doe"), None, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::NotSupported(_)));
    }

    #[tokio::test]
    async fn delete_reports_missing_and_deleted() {
        let helper = helper();
        let missing = helper.do_delete(&ctx(), "Patient", Some("nope"), None).await.unwrap();
        assert_eq!(missing.status, StatusCode::OK);
        assert_eq!(
            missing.outcome.unwrap().issue[0].message(),
            "Cannot find Patient with id 'nope'."
        );

        helper
            .do_update(&ctx(), "Patient", Some("p1"), &patient(Some("p1"), "Doe"), None, None, false)
            .await
            .unwrap();
        let deleted = helper.do_delete(&ctx(), "Patient", Some("p1"), None).await.unwrap();
        assert_eq!(deleted.status, StatusCode::OK);
        assert_eq!(deleted.etag.as_deref(), Some("W/\"2\""));

        let again = helper.do_delete(&ctx(), "Patient", Some("p1"), None).await.unwrap();
        assert_eq!(again.outcome.unwrap().issue[0].code, IssueType::Deleted);

        let err = helper.do_read(&ctx(), "Patient", "p1").await.unwrap_err();
        assert_eq!(err.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn vread_checks_version() {
        let helper = helper();
        helper
            .do_update(&ctx(), "Patient", Some("p1"), &patient(Some("p1"), "Doe"), None, None, false)
            .await
            .unwrap();
        assert!(helper.do_vread(&ctx(), "Patient", "p1", "1").await.is_ok());
        assert!(matches!(
            helper.do_vread(&ctx(), "Patient", "p1", "2").await.unwrap_err(),
            crate::Error::VersionNotFound { .. }
        ));
        assert!(matches!(
            helper.do_vread(&ctx(), "Patient", "p1", "x").await.unwrap_err(),
            crate::Error::InvalidRequest(_)
        ));
    }

    #[tokio::test]
    async fn bundle_type_must_be_batch_or_transaction() {
        let err = helper()
            .do_bundle(&ctx(), &json!({ "resourceType": "Bundle", "type": "collection" }))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}

//! Shared helpers for the HTTP-level integration tests.

use anyhow::Context as _;
use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, Method, Request, StatusCode},
    Router,
};
use fhir_rest_engine::{
    api::create_router,
    config::Config,
    persistence::{InMemoryPersistence, Persistence},
    state::AppState,
};
use serde_json::{json, Value};
use std::{future::Future, pin::Pin, sync::Arc};
use tower::ServiceExt;

pub mod constants {
    pub const MRN_SYSTEM: &str = "http://example.org/fhir/mrn";
    pub const BASE_URL: &str = "http://localhost:8080/fhir";
}

pub type TestFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

pub struct TestApp {
    pub state: AppState,
    router: Router,
}

impl TestApp {
    pub fn new(config: Config) -> Self {
        Self::with_persistence(config, Arc::new(InMemoryPersistence::new()))
    }

    pub fn with_persistence(config: Config, persistence: Arc<dyn Persistence>) -> Self {
        let state = AppState::with_persistence(config, persistence);
        let router = create_router(state.clone());
        Self { state, router }
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Body>,
    ) -> anyhow::Result<(StatusCode, HeaderMap, Bytes)> {
        self.request_with_headers(method, path, &[], body).await
    }

    pub async fn request_with_headers(
        &self,
        method: Method,
        path: &str,
        headers: &[(&str, &str)],
        body: Option<Body>,
    ) -> anyhow::Result<(StatusCode, HeaderMap, Bytes)> {
        let mut builder = Request::builder().method(method).uri(path);
        let has_content_type = headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("content-type"));
        if body.is_some() && !has_content_type {
            builder = builder.header("content-type", "application/fhir+json");
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder
            .body(body.unwrap_or_else(Body::empty))
            .context("build request")?;

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .context("router call")?;
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .context("read response body")?;
        Ok((status, headers, bytes))
    }

    /// Request with a JSON body, returning the parsed response body
    /// (`Value::Null` when empty).
    pub async fn json(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> anyhow::Result<(StatusCode, HeaderMap, Value)> {
        let body = body.map(to_json_body).transpose()?;
        let (status, headers, bytes) = self.request(method, path, body).await?;
        Ok((status, headers, parse_json(&bytes)?))
    }
}

pub fn test_config() -> Config {
    Config::default()
}

pub async fn with_test_app<F>(f: F) -> anyhow::Result<()>
where
    F: FnOnce(TestApp) -> TestFuture,
{
    with_test_app_with_config(test_config(), f).await
}

pub async fn with_test_app_with_config<F>(config: Config, f: F) -> anyhow::Result<()>
where
    F: FnOnce(TestApp) -> TestFuture,
{
    f(TestApp::new(config)).await
}

pub fn to_json_body(value: &Value) -> anyhow::Result<Body> {
    Ok(Body::from(serde_json::to_vec(value)?))
}

pub fn parse_json(bytes: &[u8]) -> anyhow::Result<Value> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(bytes).context("response body is not JSON")
}

pub fn assert_status(actual: StatusCode, expected: StatusCode, context: &str) {
    assert_eq!(actual, expected, "unexpected status for {context}");
}

/// Leading status code of a bundle entry response, e.g. `201`.
pub fn entry_status(entry: &Value) -> &str {
    entry["response"]["status"]
        .as_str()
        .and_then(|s| s.split_whitespace().next())
        .unwrap_or("")
}

pub fn entry_statuses(bundle: &Value) -> Vec<String> {
    bundle["entry"]
        .as_array()
        .map(|entries| entries.iter().map(|e| entry_status(e).to_string()).collect())
        .unwrap_or_default()
}

pub fn assert_resource_id(resource: &Value, expected: &str) -> anyhow::Result<()> {
    let id = resource["id"].as_str().context("resource has no id")?;
    anyhow::ensure!(id == expected, "expected id {expected}, got {id}");
    Ok(())
}

pub fn assert_version_id(resource: &Value, expected: &str) -> anyhow::Result<()> {
    let version = resource["meta"]["versionId"]
        .as_str()
        .context("resource has no meta.versionId")?;
    anyhow::ensure!(
        version == expected,
        "expected versionId {expected}, got {version}"
    );
    Ok(())
}

pub fn patient_with_mrn(family: &str, mrn: &str) -> Value {
    json!({
        "resourceType": "Patient",
        "identifier": [{ "system": constants::MRN_SYSTEM, "value": mrn }],
        "name": [{ "family": family }]
    })
}

pub async fn create_patient(app: &TestApp, family: &str, mrn: &str) -> anyhow::Result<String> {
    let (status, _headers, body) = app
        .json(Method::POST, "/fhir/Patient", Some(&patient_with_mrn(family, mrn)))
        .await?;
    assert_status(status, StatusCode::CREATED, "create patient");
    Ok(body["id"].as_str().context("created patient has no id")?.to_string())
}

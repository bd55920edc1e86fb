//! Shared application state

use crate::{
    config::Config,
    persistence::{InMemoryPersistence, Persistence},
    services::{RequestContext, RestHelper, ReturnPreference},
};
use axum::http::HeaderMap;
use std::sync::Arc;

/// Shared application state passed to all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub helper: Arc<RestHelper>,
}

impl AppState {
    /// Wire the in-memory persistence and the REST helper.
    pub fn new(config: Config) -> Self {
        let persistence: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
        Self::with_persistence(config, persistence)
    }

    pub fn with_persistence(config: Config, persistence: Arc<dyn Persistence>) -> Self {
        let helper = RestHelper::new(persistence, config.fhir.clone()).with_retry(&config.retry);
        tracing::info!(
            fhir_version = %config.fhir.version,
            transactional = helper.persistence().is_transactional(),
            "Application state initialized"
        );
        Self {
            config: Arc::new(config),
            helper: Arc::new(helper),
        }
    }

    /// Per-request context from the `Prefer` and correlation headers.
    pub fn request_context(&self, headers: &HeaderMap) -> RequestContext {
        let default_preference = ReturnPreference::parse(&self.config.fhir.default_prefer_return)
            .unwrap_or_default();
        let correlation_id = ["x-correlation-id", "x-request-id"]
            .iter()
            .find_map(|name| headers.get(*name))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        RequestContext::new(self.config.server.base_url.as_str())
            .with_return_preference(default_preference)
            .with_prefer_header(headers.get("prefer").and_then(|v| v.to_str().ok()))
            .with_correlation_id(Some(correlation_id))
    }
}

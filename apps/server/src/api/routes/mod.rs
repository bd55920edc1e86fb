pub mod fhir;

use crate::api::{handlers::health, middleware::security_headers_middleware};
use crate::state::AppState;
use axum::{extract::DefaultBodyLimit, middleware, routing::get, Router};
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    let body_limit = state.config.server.max_request_body_size;

    Router::new()
        .route("/health", get(health::health))
        .merge(fhir::fhir_routes())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

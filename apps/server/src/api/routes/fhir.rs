use crate::api::handlers::fhir;
use crate::state::AppState;
use axum::{routing::any, Router};

/// REST interactions, bundles and operations.
pub fn fhir_routes() -> Router<AppState> {
    Router::new()
        .route("/fhir", any(fhir::fhir_root))
        .route("/fhir/*path", any(fhir::fhir_path))
}

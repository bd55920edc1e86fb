//! Liveness endpoint

use crate::state::AppState;
use axum::{extract::State, Json};
use serde_json::{json, Value};

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "fhirVersion": state.config.fhir.version,
        "transactional": state.helper.persistence().is_transactional(),
    }))
}

//! HTTP surface
//!
//! A thin axum layer: requests are mapped onto [`crate::services::RestHelper`]
//! calls and the results rendered as FHIR JSON.

pub mod handlers;
pub mod headers;
pub mod middleware;
pub mod routes;

pub use routes::create_router;

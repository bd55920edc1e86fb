//! FHIR REST interaction engine
//!
//! Processes single REST interactions and batch/transaction bundles against a
//! pluggable persistence layer. [`services::RestHelper`] is the entry point;
//! [`api`] exposes it over HTTP.

pub mod api;
pub mod config;
pub mod error;
pub mod interaction;
pub mod logging;
pub mod models;
pub mod persistence;
pub mod registry;
pub mod search;
pub mod services;
pub mod state;
pub mod url;
pub mod validation;

pub use error::{Error, Result};

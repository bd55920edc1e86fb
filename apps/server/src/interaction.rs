//! Typed descriptors for the sub-requests of a bundle
//!
//! Every bundle entry is translated into exactly one [`Interaction`]. The
//! executor dispatches on [`InteractionKind`]; there is no open class
//! hierarchy to extend.

use crate::models::{BundleEntry, OperationContext, OperationOutcome};
use crate::services::patch::FhirPatch;
use axum::http::{Method, StatusCode};
use serde_json::Value as JsonValue;
use std::time::Instant;

/// One translated bundle entry.
#[derive(Debug, Clone)]
pub struct Interaction {
    /// Position of the entry in the request bundle and of its response slot.
    pub entry_index: usize,
    /// Method of the bundle entry; selects the processing group.
    pub method: Method,
    /// `entryIndex:[i] correlationId:[c] method:[M] uri:[u]`
    pub request_description: String,
    pub initial_time: Instant,
    /// The entry's `fullUrl` when it is a local (`urn:`) identifier.
    pub local_identifier: Option<String>,
    pub kind: InteractionKind,
}

#[derive(Debug, Clone)]
pub enum InteractionKind {
    Create {
        resource_type: String,
        resource: JsonValue,
        if_none_exist: Option<String>,
    },
    Read {
        resource_type: String,
        id: String,
        head: bool,
    },
    VRead {
        resource_type: String,
        id: String,
        version_id: String,
        head: bool,
    },
    Update {
        resource_type: String,
        /// `None` for a conditional update.
        id: Option<String>,
        resource: JsonValue,
        search_query: Option<String>,
        if_match: Option<String>,
        /// `Some(0)` when `If-None-Match: *` was sent.
        if_none_match: Option<i32>,
        skippable: bool,
    },
    Patch {
        resource_type: String,
        id: String,
        patch: FhirPatch,
        if_match: Option<String>,
        skippable: bool,
    },
    Delete {
        resource_type: String,
        id: Option<String>,
        search_query: Option<String>,
    },
    Search {
        /// `None` for a whole-system search.
        resource_type: Option<String>,
        compartment: Option<(String, String)>,
        query: Vec<(String, String)>,
        request_uri: String,
        head: bool,
    },
    History {
        resource_type: Option<String>,
        id: Option<String>,
        query: Vec<(String, String)>,
        request_uri: String,
        head: bool,
    },
    Invoke {
        operation_name: String,
        context: OperationContext,
        method: Method,
        resource: Option<JsonValue>,
        query: Vec<(String, String)>,
        request_uri: String,
    },
    /// A validation response already produced for this slot.
    ValidationOutcome { response: BundleEntry },
    /// A per-entry failure recorded during translation (batch only).
    Issue {
        status: StatusCode,
        outcome: OperationOutcome,
    },
}

impl Interaction {
    pub fn new(
        entry_index: usize,
        method: Method,
        request_description: String,
        kind: InteractionKind,
    ) -> Self {
        Self {
            entry_index,
            method,
            request_description,
            initial_time: Instant::now(),
            local_identifier: None,
            kind,
        }
    }

    pub fn with_local_identifier(mut self, local_identifier: Option<String>) -> Self {
        self.local_identifier = local_identifier;
        self
    }

    /// Name used in logs and interceptor events.
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn resource_type(&self) -> Option<&str> {
        match &self.kind {
            InteractionKind::Create { resource_type, .. }
            | InteractionKind::Read { resource_type, .. }
            | InteractionKind::VRead { resource_type, .. }
            | InteractionKind::Update { resource_type, .. }
            | InteractionKind::Patch { resource_type, .. }
            | InteractionKind::Delete { resource_type, .. } => Some(resource_type),
            InteractionKind::Search { resource_type, .. }
            | InteractionKind::History { resource_type, .. } => resource_type.as_deref(),
            InteractionKind::Invoke { context, .. } => context.resource_type(),
            InteractionKind::ValidationOutcome { .. } | InteractionKind::Issue { .. } => None,
        }
    }

    /// True if the interaction may change stored state.
    pub fn is_write(&self) -> bool {
        matches!(
            self.kind,
            InteractionKind::Create { .. }
                | InteractionKind::Update { .. }
                | InteractionKind::Patch { .. }
                | InteractionKind::Delete { .. }
        )
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.initial_time.elapsed().as_millis()
    }
}

impl InteractionKind {
    pub fn name(&self) -> &'static str {
        match self {
            InteractionKind::Create { .. } => "create",
            InteractionKind::Read { .. } => "read",
            InteractionKind::VRead { .. } => "vread",
            InteractionKind::Update { .. } => "update",
            InteractionKind::Patch { .. } => "patch",
            InteractionKind::Delete { .. } => "delete",
            InteractionKind::Search { .. } => "search",
            InteractionKind::History { .. } => "history",
            InteractionKind::Invoke { .. } => "operation",
            InteractionKind::ValidationOutcome { .. } => "validation",
            InteractionKind::Issue { .. } => "issue",
        }
    }
}

/// Build the description attached to each interaction for logs and errors.
pub fn request_description(
    entry_index: usize,
    correlation_id: Option<&str>,
    method: &str,
    url: &str,
) -> String {
    format!(
        "entryIndex:[{}] correlationId:[{}] method:[{}] uri:[{}]",
        entry_index,
        correlation_id.unwrap_or(""),
        method,
        url
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_format() {
        assert_eq!(
            request_description(2, Some("abc"), "PUT", "Patient/1"),
            "entryIndex:[2] correlationId:[abc] method:[PUT] uri:[Patient/1]"
        );
    }

    #[test]
    fn write_detection() {
        let read = Interaction::new(
            0,
            Method::GET,
            String::new(),
            InteractionKind::Read {
                resource_type: "Patient".into(),
                id: "1".into(),
                head: false,
            },
        );
        assert!(!read.is_write());
        assert_eq!(read.resource_type(), Some("Patient"));
        assert_eq!(read.name(), "read");
    }
}

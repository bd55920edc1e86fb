//! Error taxonomy for the REST interaction engine
//!
//! Each variant maps to a FHIR issue type, and the issue type maps to an HTTP
//! status (see [`crate::models::IssueType::http_status`]).

use crate::models::{Issue, IssueSeverity, IssueType, OperationOutcome};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed URL, path or method combination
    #[error("{0}")]
    InvalidRequest(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    RequiredFieldMissing(String),

    /// Attribute values that disagree (e.g. resource id vs URL id)
    #[error("{0}")]
    InvalidValue(String),

    /// Unsupported resource type, conditional patch, or disabled interaction
    #[error("{0}")]
    NotSupported(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Resource '{resource_type}/{id}' not found.")]
    ResourceNotFound { resource_type: String, id: String },

    #[error("Resource '{resource_type}/{id}' version {version_id} not found.")]
    VersionNotFound {
        resource_type: String,
        id: String,
        version_id: String,
    },

    #[error("Resource '{resource_type}/{id}' is deleted.")]
    ResourceDeleted {
        resource_type: String,
        id: String,
        version_id: Option<i32>,
    },

    #[error("{0}")]
    MultipleMatches(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    PreconditionFailed(String),

    /// If-Match version disagrees with the current version
    #[error("If-Match version '{expected}' does not match current latest version of resource: {actual}")]
    VersionConflict { expected: String, actual: String },

    #[error("{0}")]
    BusinessRule(String),

    /// ETag or other request data that could not be processed
    #[error("{0}")]
    Processing(String),

    #[error("{message}")]
    Validation { message: String, issues: Vec<Issue> },

    /// Persistence failure. `retryable` is set for lock/deadlock detection.
    #[error("Data access error: {message}")]
    DataAccess { message: String, retryable: bool },

    /// Failure carrying a ready-made OperationOutcome
    #[error("{message}")]
    Operation {
        message: String,
        outcome: OperationOutcome,
    },

    /// Failure raised while processing one entry of a bundle
    #[error("{description}: {source}")]
    BundleEntry {
        index: usize,
        description: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn issue_type(&self) -> IssueType {
        match self {
            Error::InvalidRequest(_) | Error::InvalidArgument(_) => IssueType::Invalid,
            Error::RequiredFieldMissing(_) => IssueType::Required,
            Error::InvalidValue(_) => IssueType::Value,
            Error::NotSupported(_) => IssueType::NotSupported,
            Error::NotFound(_)
            | Error::ResourceNotFound { .. }
            | Error::VersionNotFound { .. } => IssueType::NotFound,
            Error::ResourceDeleted { .. } => IssueType::Deleted,
            Error::MultipleMatches(_) => IssueType::MultipleMatches,
            Error::Conflict(_) | Error::PreconditionFailed(_) | Error::VersionConflict { .. } => {
                IssueType::Conflict
            }
            Error::BusinessRule(_) => IssueType::BusinessRule,
            Error::Processing(_) => IssueType::Processing,
            Error::Validation { issues, .. } => issues
                .iter()
                .find(|i| i.severity.is_failure())
                .map(|i| i.code)
                .unwrap_or(IssueType::Invalid),
            Error::DataAccess { retryable, .. } => {
                if *retryable {
                    IssueType::LockError
                } else {
                    IssueType::Exception
                }
            }
            Error::Operation { outcome, .. } => outcome
                .issue
                .first()
                .map(|i| i.code)
                .unwrap_or(IssueType::Exception),
            Error::BundleEntry { source, .. } => source.issue_type(),
            Error::Internal(_) => IssueType::Exception,
            Error::Json(_) => IssueType::Structure,
        }
    }

    /// True for the precondition-failed flavour of `conflict` (412 instead of 409).
    fn precondition_failed(&self) -> bool {
        match self {
            Error::PreconditionFailed(_) | Error::VersionConflict { .. } => true,
            Error::Operation { outcome, .. } => {
                outcome.issue.first().map(Issue::is_failed_precondition) == Some(true)
            }
            Error::BundleEntry { source, .. } => source.precondition_failed(),
            _ => false,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.issue_type().http_status(self.precondition_failed())
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Error::DataAccess { retryable, .. } => *retryable,
            Error::BundleEntry { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Issues describing this error.
    pub fn issues(&self) -> Vec<Issue> {
        match self {
            Error::Validation { issues, .. } if !issues.is_empty() => issues.clone(),
            Error::Operation { outcome, .. } => outcome.issue.clone(),
            Error::BundleEntry { source, .. } => source.issues(),
            other => {
                let mut issue = Issue::new(IssueSeverity::Fatal, other.issue_type(), other.to_string());
                if other.precondition_failed() {
                    issue = issue.with_failed_precondition("If-Match");
                }
                vec![issue]
            }
        }
    }

    pub fn to_operation_outcome(&self) -> OperationOutcome {
        OperationOutcome::new(self.issues())
    }

    /// Wrap an error with the bundle entry it was raised for.
    pub fn with_entry_context(self, index: usize, description: impl Into<String>) -> Self {
        match self {
            already @ Error::BundleEntry { .. } => already,
            other => Error::BundleEntry {
                index,
                description: description.into(),
                source: Box::new(other),
            },
        }
    }

    /// Strip any bundle-entry wrapper.
    pub fn into_root(self) -> Self {
        match self {
            Error::BundleEntry { source, .. } => source.into_root(),
            other => other,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }
        (status, Json(self.to_operation_outcome().to_value())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_conflict_is_precondition_failed() {
        let err = Error::VersionConflict {
            expected: "3".to_string(),
            actual: "4".to_string(),
        };
        assert_eq!(err.status(), StatusCode::PRECONDITION_FAILED);
        let outcome = err.to_operation_outcome();
        assert_eq!(outcome.issue[0].code, IssueType::Conflict);
        assert!(outcome.issue[0].is_failed_precondition());
    }

    #[test]
    fn entry_context_keeps_status_of_source() {
        let err = Error::MultipleMatches("two hits".to_string())
            .with_entry_context(3, "entryIndex:[3]");
        assert_eq!(err.status(), StatusCode::PRECONDITION_FAILED);
        assert!(matches!(err.into_root(), Error::MultipleMatches(_)));
    }

    #[test]
    fn deleted_maps_to_gone() {
        let err = Error::ResourceDeleted {
            resource_type: "Patient".to_string(),
            id: "1".to_string(),
            version_id: Some(2),
        };
        assert_eq!(err.status(), StatusCode::GONE);
    }

    #[test]
    fn retryable_data_access_is_detected_through_wrapper() {
        let err = Error::DataAccess {
            message: "deadlock".to_string(),
            retryable: true,
        }
        .with_entry_context(0, "reindex");
        assert!(err.is_retryable());
    }
}

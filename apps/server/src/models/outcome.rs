//! OperationOutcome model
//!
//! Every error that leaves the engine is rendered as an OperationOutcome. The
//! issue type drives the HTTP status through [`IssueType::http_status`].

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

/// Extension url marking a `conflict` issue as an HTTP precondition failure (412).
pub const HTTP_FAILED_PRECONDITION_URL: &str =
    "http://zunder.thalamiq.io/fhir/extension/http-failed-precondition";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Fatal,
    Error,
    Warning,
    Information,
}

impl IssueSeverity {
    pub fn is_failure(self) -> bool {
        matches!(self, IssueSeverity::Fatal | IssueSeverity::Error)
    }
}

/// Issue type codes (http://hl7.org/fhir/issue-type)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueType {
    Invalid,
    Structure,
    Required,
    Value,
    Invariant,
    Security,
    Login,
    Unknown,
    Expired,
    Forbidden,
    Suppressed,
    Processing,
    NotSupported,
    Duplicate,
    MultipleMatches,
    NotFound,
    Deleted,
    TooLong,
    CodeInvalid,
    Extension,
    TooCostly,
    BusinessRule,
    Conflict,
    Transient,
    LockError,
    NoStore,
    Exception,
    Timeout,
    Incomplete,
    Throttled,
    Informational,
}

impl IssueType {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueType::Invalid => "invalid",
            IssueType::Structure => "structure",
            IssueType::Required => "required",
            IssueType::Value => "value",
            IssueType::Invariant => "invariant",
            IssueType::Security => "security",
            IssueType::Login => "login",
            IssueType::Unknown => "unknown",
            IssueType::Expired => "expired",
            IssueType::Forbidden => "forbidden",
            IssueType::Suppressed => "suppressed",
            IssueType::Processing => "processing",
            IssueType::NotSupported => "not-supported",
            IssueType::Duplicate => "duplicate",
            IssueType::MultipleMatches => "multiple-matches",
            IssueType::NotFound => "not-found",
            IssueType::Deleted => "deleted",
            IssueType::TooLong => "too-long",
            IssueType::CodeInvalid => "code-invalid",
            IssueType::Extension => "extension",
            IssueType::TooCostly => "too-costly",
            IssueType::BusinessRule => "business-rule",
            IssueType::Conflict => "conflict",
            IssueType::Transient => "transient",
            IssueType::LockError => "lock-error",
            IssueType::NoStore => "no-store",
            IssueType::Exception => "exception",
            IssueType::Timeout => "timeout",
            IssueType::Incomplete => "incomplete",
            IssueType::Throttled => "throttled",
            IssueType::Informational => "informational",
        }
    }

    /// Conventional HTTP status for an issue of this type.
    ///
    /// `precondition_failed` is only consulted for `conflict`, which maps to 412
    /// instead of 409 when the issue carries the failed-precondition marker.
    pub fn http_status(self, precondition_failed: bool) -> StatusCode {
        match self {
            IssueType::Invalid
            | IssueType::Structure
            | IssueType::Required
            | IssueType::Value
            | IssueType::Invariant
            | IssueType::CodeInvalid
            | IssueType::Extension
            | IssueType::TooLong
            | IssueType::Processing => StatusCode::BAD_REQUEST,
            IssueType::Security | IssueType::Login | IssueType::Unknown | IssueType::Expired => {
                StatusCode::UNAUTHORIZED
            }
            IssueType::Forbidden | IssueType::Suppressed | IssueType::TooCostly => {
                StatusCode::FORBIDDEN
            }
            IssueType::NotSupported | IssueType::NotFound => StatusCode::NOT_FOUND,
            IssueType::Deleted => StatusCode::GONE,
            IssueType::MultipleMatches => StatusCode::PRECONDITION_FAILED,
            IssueType::Conflict if precondition_failed => StatusCode::PRECONDITION_FAILED,
            IssueType::Conflict | IssueType::Duplicate | IssueType::BusinessRule => {
                StatusCode::CONFLICT
            }
            IssueType::LockError | IssueType::Transient | IssueType::NoStore => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            IssueType::Throttled => StatusCode::TOO_MANY_REQUESTS,
            IssueType::Timeout => StatusCode::REQUEST_TIMEOUT,
            IssueType::Incomplete => StatusCode::PARTIAL_CONTENT,
            IssueType::Informational => StatusCode::OK,
            IssueType::Exception => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeableText {
    pub text: String,
}

/// A single OperationOutcome.issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: IssueSeverity,
    pub code: IssueType,
    /// Extensions on the `code` primitive (FHIR JSON `_code`)
    #[serde(rename = "_code", skip_serializing_if = "Option::is_none")]
    pub code_element: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<CodeableText>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<Vec<String>>,
}

impl Issue {
    pub fn new(severity: IssueSeverity, code: IssueType, message: impl Into<String>) -> Self {
        Self {
            severity,
            code,
            code_element: None,
            details: Some(CodeableText {
                text: message.into(),
            }),
            diagnostics: None,
            expression: None,
        }
    }

    pub fn fatal(code: IssueType, message: impl Into<String>) -> Self {
        Self::new(IssueSeverity::Fatal, code, message)
    }

    pub fn warning(code: IssueType, message: impl Into<String>) -> Self {
        Self::new(IssueSeverity::Warning, code, message)
    }

    pub fn information(message: impl Into<String>) -> Self {
        Self::new(IssueSeverity::Information, IssueType::Informational, message)
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression
            .get_or_insert_with(Vec::new)
            .push(expression.into());
        self
    }

    /// Tag a `conflict` issue so that it is reported as 412 Precondition Failed.
    pub fn with_failed_precondition(mut self, header: &str) -> Self {
        self.code_element = Some(json!({
            "extension": [{
                "url": HTTP_FAILED_PRECONDITION_URL,
                "valueString": header
            }]
        }));
        self
    }

    pub fn is_failed_precondition(&self) -> bool {
        self.code_element
            .as_ref()
            .and_then(|c| c.get("extension"))
            .and_then(|e| e.as_array())
            .map(|exts| {
                exts.iter()
                    .any(|e| e.get("url").and_then(|u| u.as_str()) == Some(HTTP_FAILED_PRECONDITION_URL))
            })
            .unwrap_or(false)
    }

    pub fn message(&self) -> &str {
        self.details
            .as_ref()
            .map(|d| d.text.as_str())
            .or(self.diagnostics.as_deref())
            .unwrap_or("")
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status(self.is_failed_precondition())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    #[serde(default = "default_resource_type")]
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub issue: Vec<Issue>,
}

fn default_resource_type() -> String {
    "OperationOutcome".to_string()
}

impl OperationOutcome {
    pub fn new(issue: Vec<Issue>) -> Self {
        Self {
            resource_type: default_resource_type(),
            id: None,
            issue,
        }
    }

    pub fn single(severity: IssueSeverity, code: IssueType, message: impl Into<String>) -> Self {
        Self::new(vec![Issue::new(severity, code, message)])
    }

    /// An empty issue list yields no outcome at all.
    pub fn from_warnings(issues: Vec<Issue>) -> Option<Self> {
        if issues.is_empty() {
            None
        } else {
            Some(Self::new(issues))
        }
    }

    pub fn has_failure(&self) -> bool {
        self.issue.iter().any(|i| i.severity.is_failure())
    }

    /// Status of the first failing issue, falling back to the first issue.
    pub fn http_status(&self) -> StatusCode {
        self.issue
            .iter()
            .find(|i| i.severity.is_failure())
            .or_else(|| self.issue.first())
            .map(Issue::http_status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn to_value(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or_else(|_| {
            json!({ "resourceType": "OperationOutcome", "issue": [] })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_maps_to_409_unless_marked() {
        let plain = Issue::fatal(IssueType::Conflict, "boom");
        assert_eq!(plain.http_status(), StatusCode::CONFLICT);

        let marked = plain.with_failed_precondition("If-Match");
        assert!(marked.is_failed_precondition());
        assert_eq!(marked.http_status(), StatusCode::PRECONDITION_FAILED);
    }

    #[test]
    fn table_covers_core_conditions() {
        assert_eq!(
            IssueType::MultipleMatches.http_status(false),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(IssueType::Deleted.http_status(false), StatusCode::GONE);
        assert_eq!(IssueType::NotFound.http_status(false), StatusCode::NOT_FOUND);
        assert_eq!(IssueType::NotSupported.http_status(false), StatusCode::NOT_FOUND);
        assert_eq!(IssueType::Invalid.http_status(false), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn outcome_serializes_codes_in_kebab_case() {
        let outcome = OperationOutcome::single(
            IssueSeverity::Fatal,
            IssueType::MultipleMatches,
            "too many",
        );
        let json = outcome.to_value();
        assert_eq!(json["resourceType"], "OperationOutcome");
        assert_eq!(json["issue"][0]["code"], "multiple-matches");
        assert_eq!(json["issue"][0]["severity"], "fatal");
        assert_eq!(json["issue"][0]["details"]["text"], "too many");
    }

    #[test]
    fn outcome_status_prefers_failing_issue() {
        let outcome = OperationOutcome::new(vec![
            Issue::warning(IssueType::NotFound, "just a warning"),
            Issue::fatal(IssueType::Deleted, "gone"),
        ]);
        assert_eq!(outcome.http_status(), StatusCode::GONE);
        assert!(outcome.has_failure());
    }
}

//! Resource validation
//!
//! The engine only needs a black box returning issues: error and fatal issues
//! abort the interaction, anything else is reported as a warning. On top of
//! that sits the profile policy, which checks the profiles a resource asserts
//! in `meta.profile` against the configured requirements.

use crate::models::{resource, Issue, IssueSeverity, IssueType};
use crate::registry::{split_canonical, ProfileRegistry};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, resource: &JsonValue) -> Result<Vec<Issue>>;
}

/// Structural checks that hold for every resource type.
#[derive(Debug, Clone, Default)]
pub struct StructuralValidator;

#[async_trait]
impl Validator for StructuralValidator {
    async fn validate(&self, resource: &JsonValue) -> Result<Vec<Issue>> {
        let mut issues = Vec::new();

        let Some(obj) = resource.as_object() else {
            issues.push(Issue::new(
                IssueSeverity::Error,
                IssueType::Structure,
                "Resource must be a JSON object",
            ));
            return Ok(issues);
        };

        match resource::resource_type(resource) {
            None => issues.push(
                Issue::new(
                    IssueSeverity::Error,
                    IssueType::Required,
                    "Resource must have a 'resourceType' field",
                )
                .with_expression("resourceType"),
            ),
            Some(rt) if !resource::is_known_resource_type(rt) => issues.push(
                Issue::new(
                    IssueSeverity::Error,
                    IssueType::NotSupported,
                    format!("'{}' is not a valid resource type.", rt),
                )
                .with_expression("resourceType"),
            ),
            Some(_) => {}
        }

        if let Some(id) = obj.get("id") {
            match id.as_str() {
                Some(id) if is_valid_id(id) => {}
                _ => issues.push(
                    Issue::new(
                        IssueSeverity::Error,
                        IssueType::Value,
                        format!("Invalid resource id {}", id),
                    )
                    .with_expression("id"),
                ),
            }
        }

        if let Some(meta) = obj.get("meta") {
            if !meta.is_object() {
                issues.push(
                    Issue::new(IssueSeverity::Error, IssueType::Structure, "meta must be an object")
                        .with_expression("meta"),
                );
            } else if let Some(profiles) = meta.get("profile") {
                let all_strings = profiles
                    .as_array()
                    .is_some_and(|p| p.iter().all(|v| v.is_string()));
                if !all_strings {
                    issues.push(
                        Issue::new(
                            IssueSeverity::Error,
                            IssueType::Structure,
                            "meta.profile must be an array of canonical URLs",
                        )
                        .with_expression("meta.profile"),
                    );
                }
            }
        }

        if obj.get("text").is_none() && obj.get("resourceType").is_some() {
            issues.push(
                Issue::new(
                    IssueSeverity::Information,
                    IssueType::Informational,
                    "Resource has no narrative",
                )
                .with_expression("text"),
            );
        }

        Ok(issues)
    }
}

/// `[A-Za-z0-9\-\.]{1,64}`
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// Profile requirements for one resource type (or the default for all).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfilePolicy {
    /// The resource must assert at least one of these. A canonical without
    /// `|version` matches any version.
    #[serde(default)]
    pub at_least_one: Vec<String>,
    /// Asserting any of these rejects the resource.
    #[serde(default)]
    pub not_allowed: Vec<String>,
    /// Accept asserted profiles the registry cannot resolve.
    #[serde(default = "default_true")]
    pub allow_unknown: bool,
}

impl Default for ProfilePolicy {
    fn default() -> Self {
        Self {
            at_least_one: Vec::new(),
            not_allowed: Vec::new(),
            allow_unknown: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn canonical_matches(required: &str, asserted: &str) -> bool {
    if required == asserted {
        return true;
    }
    let (required_url, required_version) = split_canonical(required);
    required_version.is_none() && split_canonical(asserted).0 == required_url
}

fn asserted_profiles(resource: &JsonValue) -> Vec<&str> {
    resource
        .get("meta")
        .and_then(|m| m.get("profile"))
        .and_then(|p| p.as_array())
        .map(|p| p.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default()
}

/// Check the profiles asserted by `resource` against `policy`.
pub async fn check_profiles(
    resource: &JsonValue,
    policy: &ProfilePolicy,
    registry: &dyn ProfileRegistry,
) -> Result<()> {
    let resource_type = resource::resource_type(resource).unwrap_or("Resource");
    let asserted = asserted_profiles(resource);

    if !policy.at_least_one.is_empty() {
        let satisfied = policy
            .at_least_one
            .iter()
            .any(|required| asserted.iter().any(|a| canonical_matches(required, a)));
        if !satisfied {
            return Err(crate::Error::BusinessRule(format!(
                "A required profile was not specified. Resources of type '{}' must declare conformance to at least one of the following profiles: [{}]",
                resource_type,
                policy.at_least_one.join(", ")
            )));
        }
    }

    for profile in &asserted {
        if policy
            .not_allowed
            .iter()
            .any(|forbidden| canonical_matches(forbidden, profile))
        {
            return Err(crate::Error::BusinessRule(format!(
                "Profile '{}' is not allowed for resources of type '{}'",
                profile, resource_type
            )));
        }
    }

    if !policy.allow_unknown {
        for profile in asserted {
            if registry.resolve_profile(profile).await?.is_none() {
                return Err(crate::Error::NotSupported(format!(
                    "Profile '{}' is not supported",
                    profile
                )));
            }
        }
    }

    Ok(())
}

/// Run the validator and split its issues: failures become an error,
/// everything else is returned as warnings.
pub async fn validate_resource(
    validator: &dyn Validator,
    registry: &dyn ProfileRegistry,
    policy: Option<&ProfilePolicy>,
    resource: &JsonValue,
) -> Result<Vec<Issue>> {
    let issues = validator.validate(resource).await?;
    if let Some(first) = issues.iter().find(|i| i.severity.is_failure()) {
        tracing::debug!(
            resource_type = resource::resource_type(resource).unwrap_or("unknown"),
            issues = issues.len(),
            "Resource failed validation"
        );
        return Err(crate::Error::Validation {
            message: first.message().to_string(),
            issues,
        });
    }

    if let Some(policy) = policy {
        check_profiles(resource, policy, registry).await?;
    }

    Ok(issues
        .into_iter()
        .filter(|i| i.severity == IssueSeverity::Warning)
        .collect())
}

//! Custom operations (`$name`)
//!
//! Operations are looked up by `name` at system level and by `name:Type` at
//! type and instance level. An operation registered for the type `Resource`
//! applies to every type.

use crate::models::{
    resource, Issue, OperationContext, OperationOutcome, OperationRequest, OperationResult,
    Parameters,
};
use crate::persistence::{EraseRequest, PersistenceSession, ReindexRequest};
use crate::services::rest::{RequestContext, RestHelper};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;

/// Resource type name that makes an operation apply to every type.
pub const ANY_RESOURCE_TYPE: &str = "Resource";

#[async_trait]
pub trait Operation: Send + Sync {
    /// Code without the leading `$`.
    fn name(&self) -> &str;

    fn system(&self) -> bool {
        false
    }

    fn type_level(&self) -> bool {
        false
    }

    fn instance(&self) -> bool {
        false
    }

    /// Types the operation is available on at type/instance level.
    fn resource_types(&self) -> Vec<String> {
        vec![ANY_RESOURCE_TYPE.to_string()]
    }

    /// Retry the whole invocation, in a fresh session, on retryable errors.
    fn retryable(&self) -> bool {
        false
    }

    /// Operations that open their own sessions when invoked directly
    /// (outside a bundle) return true and implement
    /// [`Operation::invoke_standalone`].
    fn manages_sessions(&self) -> bool {
        false
    }

    /// Run inside the caller's session.
    async fn invoke(
        &self,
        helper: &RestHelper,
        session: &mut dyn PersistenceSession,
        ctx: &RequestContext,
        request: &OperationRequest,
    ) -> Result<OperationResult>;

    async fn invoke_standalone(
        &self,
        _helper: &RestHelper,
        _ctx: &RequestContext,
        _request: &OperationRequest,
    ) -> Result<OperationResult> {
        Err(crate::Error::Internal(format!(
            "Operation '${}' does not manage its own sessions",
            self.name()
        )))
    }
}

#[derive(Clone, Default)]
pub struct OperationRegistry {
    operations: HashMap<String, Arc<dyn Operation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding `$reindex` and `$erase`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ReindexOperation));
        registry.register(Arc::new(EraseOperation));
        registry
    }

    pub fn register(&mut self, operation: Arc<dyn Operation>) {
        let name = operation.name().to_string();
        if operation.system() {
            self.operations.insert(name.clone(), operation.clone());
        }
        if operation.type_level() || operation.instance() {
            for resource_type in operation.resource_types() {
                self.operations
                    .insert(format!("{}:{}", name, resource_type), operation.clone());
            }
        }
        tracing::debug!(operation = %name, "Registered operation");
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn find(&self, operation_name: &str, context: &OperationContext) -> Result<Arc<dyn Operation>> {
        let key = context.operation_key(operation_name);
        let found = self.operations.get(&key).or_else(|| match context {
            OperationContext::System => None,
            _ => self
                .operations
                .get(&format!("{}:{}", operation_name, ANY_RESOURCE_TYPE)),
        });
        let operation = found.ok_or_else(|| {
            crate::Error::NotFound(format!(
                "Operation with name '${}' is not supported",
                operation_name
            ))
        })?;

        let (level, allowed) = match context {
            OperationContext::System => ("system", operation.system()),
            OperationContext::Type(_) => ("type", operation.type_level()),
            OperationContext::Instance(..) => ("instance", operation.instance()),
        };
        if !allowed {
            return Err(crate::Error::InvalidRequest(format!(
                "Operation '${}' cannot be invoked at the {} level",
                operation_name, level
            )));
        }
        Ok(operation.clone())
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&String> = self.operations.keys().collect();
        keys.sort();
        f.debug_struct("OperationRegistry").field("operations", &keys).finish()
    }
}

/// Scalar value of the first parameter called `name`, rendered as a string.
fn parameter_string(params: &Parameters, name: &str) -> Option<String> {
    let (_, value) = params.get_parameter(name)?.value_entry()?;
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parameter_usize(params: &Parameters, name: &str) -> Result<Option<usize>> {
    parameter_string(params, name)
        .map(|v| {
            v.parse::<usize>().map_err(|_| {
                crate::Error::InvalidRequest(format!("Invalid value '{}' for parameter '{}'", v, name))
            })
        })
        .transpose()
}

/// `$reindex`: refresh the search index of stored resources.
///
/// Parameters: `resourceCount`, `tstamp` (skip resources reindexed since),
/// `resourceLogicalId` (comma separated `Type/id` list).
#[derive(Debug, Clone, Copy, Default)]
pub struct ReindexOperation;

/// Largest `resourceCount` accepted by `$reindex`.
pub const MAX_REINDEX_COUNT: usize = 1000;

impl ReindexOperation {
    fn request(
        &self,
        context: &OperationContext,
        params: &Parameters,
        default_count: usize,
    ) -> Result<ReindexRequest> {
        let max_resources = parameter_usize(params, "resourceCount")?
            .unwrap_or(default_count)
            .clamp(1, MAX_REINDEX_COUNT);

        let reindex_before = match parameter_string(params, "tstamp") {
            Some(value) => Some(
                DateTime::parse_from_rfc3339(&value)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|_| {
                        crate::Error::InvalidRequest(format!("Invalid tstamp value '{}'", value))
                    })?,
            ),
            None => Some(Utc::now()),
        };

        let mut references: Vec<String> = parameter_string(params, "resourceLogicalId")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let resource_type = match context {
            OperationContext::System => None,
            OperationContext::Type(rt) => Some(rt.clone()),
            OperationContext::Instance(rt, id) => {
                references = vec![format!("{}/{}", rt, id)];
                Some(rt.clone())
            }
        };

        for reference in &references {
            let valid = reference
                .split_once('/')
                .is_some_and(|(rt, id)| resource::is_known_resource_type(rt) && !id.is_empty());
            if !valid {
                return Err(crate::Error::InvalidRequest(format!(
                    "Invalid resourceLogicalId '{}'; expected <resourceType>/<id>",
                    reference
                )));
            }
        }

        Ok(ReindexRequest {
            resource_type,
            references,
            max_resources,
            reindex_before,
        })
    }
}

/// OperationOutcome listing each reindexed reference.
pub fn reindex_outcome(references: &[String]) -> OperationOutcome {
    if references.is_empty() {
        return OperationOutcome::new(vec![Issue::information("Reindex complete")]);
    }
    OperationOutcome::new(
        references
            .iter()
            .map(|r| Issue::information(format!("Processed {}", r)))
            .collect(),
    )
}

#[async_trait]
impl Operation for ReindexOperation {
    fn name(&self) -> &str {
        "reindex"
    }

    fn system(&self) -> bool {
        true
    }

    fn type_level(&self) -> bool {
        true
    }

    fn instance(&self) -> bool {
        true
    }

    fn retryable(&self) -> bool {
        true
    }

    fn manages_sessions(&self) -> bool {
        true
    }

    async fn invoke(
        &self,
        helper: &RestHelper,
        session: &mut dyn PersistenceSession,
        _ctx: &RequestContext,
        request: &OperationRequest,
    ) -> Result<OperationResult> {
        let reindex = self.request(
            &request.context,
            &request.parameters,
            helper.reindex_window(),
        )?;
        let result = session.reindex(&reindex).await?;
        Ok(OperationResult::Resource(
            reindex_outcome(&result.references).to_value(),
        ))
    }

    async fn invoke_standalone(
        &self,
        helper: &RestHelper,
        ctx: &RequestContext,
        request: &OperationRequest,
    ) -> Result<OperationResult> {
        let reindex = self.request(
            &request.context,
            &request.parameters,
            helper.reindex_window(),
        )?;
        let result = helper.do_reindex(ctx, &reindex).await?;
        Ok(OperationResult::Resource(
            reindex_outcome(&result.references).to_value(),
        ))
    }
}

/// `$erase`: physically remove a resource, or one version with `version`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EraseOperation;

impl EraseOperation {
    fn request(&self, context: &OperationContext, params: &Parameters) -> Result<EraseRequest> {
        let OperationContext::Instance(resource_type, id) = context else {
            return Err(crate::Error::InvalidRequest(
                "Operation '$erase' must be invoked on a resource instance".to_string(),
            ));
        };
        let version = parameter_usize(params, "version")?
            .map(|v| {
                i32::try_from(v).map_err(|_| {
                    crate::Error::InvalidRequest(format!("Invalid version '{}'", v))
                })
            })
            .transpose()?;
        Ok(EraseRequest {
            resource_type: resource_type.clone(),
            id: id.clone(),
            version,
        })
    }
}

/// Parameters describing an erase result.
pub fn erase_output(result: &crate::persistence::EraseResult) -> Parameters {
    let mut output = Parameters::new();
    output.add_value_string(
        "resource".to_string(),
        format!("{}/{}", result.resource_type, result.id),
    );
    output.add_value(
        "versionsErased".to_string(),
        "valueInteger",
        json!(result.versions_erased),
    );
    output.add_value("partial".to_string(), "valueBoolean", json!(result.partial));
    output
}

#[async_trait]
impl Operation for EraseOperation {
    fn name(&self) -> &str {
        "erase"
    }

    fn instance(&self) -> bool {
        true
    }

    fn retryable(&self) -> bool {
        true
    }

    async fn invoke(
        &self,
        helper: &RestHelper,
        session: &mut dyn PersistenceSession,
        _ctx: &RequestContext,
        request: &OperationRequest,
    ) -> Result<OperationResult> {
        let erase = self.request(&request.context, &request.parameters)?;
        helper.check_erase_allowed(&erase.resource_type)?;
        if let Some(reason) = parameter_string(&request.parameters, "reason") {
            tracing::info!(
                resource_type = %erase.resource_type,
                id = %erase.id,
                reason = %reason,
                "Erasing resource"
            );
        }
        let result = session.erase(&erase).await?;
        Ok(OperationResult::Parameters(erase_output(&result)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_resolve_by_level() {
        let registry = OperationRegistry::with_builtins();
        assert!(registry.find("reindex", &OperationContext::System).is_ok());
        assert!(registry
            .find("reindex", &OperationContext::Type("Patient".into()))
            .is_ok());
        assert!(registry
            .find("erase", &OperationContext::Instance("Patient".into(), "1".into()))
            .is_ok());

        let err = registry
            .find("erase", &OperationContext::Type("Patient".into()))
            .err()
            .unwrap();
        assert!(matches!(err, crate::Error::InvalidRequest(_)));

        let err = registry.find("everything", &OperationContext::System).err().unwrap();
        assert_eq!(err.to_string(), "Operation with name '$everything' is not supported");
    }

    #[test]
    fn reindex_parameters() {
        let mut params = Parameters::new();
        params.add_value("resourceCount".to_string(), "valueInteger", json!(5000));
        params.add_value_string(
            "resourceLogicalId".to_string(),
            "Patient/1, Observation/2".to_string(),
        );
        let request = ReindexOperation
            .request(&OperationContext::System, &params, 10)
            .unwrap();
        assert_eq!(request.max_resources, MAX_REINDEX_COUNT);
        assert_eq!(request.references, vec!["Patient/1", "Observation/2"]);
        assert!(request.reindex_before.is_some());

        let instance = ReindexOperation
            .request(
                &OperationContext::Instance("Patient".into(), "9".into()),
                &Parameters::new(),
                10,
            )
            .unwrap();
        assert_eq!(instance.references, vec!["Patient/9"]);
        assert_eq!(instance.max_resources, 10);
    }

    #[test]
    fn reindex_rejects_bad_references() {
        let mut params = Parameters::new();
        params.add_value_string("resourceLogicalId".to_string(), "Nope/1".to_string());
        assert!(ReindexOperation
            .request(&OperationContext::System, &params, 10)
            .is_err());
    }

    #[test]
    fn erase_reads_version() {
        let mut params = Parameters::new();
        params.add_value("version".to_string(), "valueInteger", json!(2));
        let request = EraseOperation
            .request(&OperationContext::Instance("Patient".into(), "1".into()), &params)
            .unwrap();
        assert_eq!(request.version, Some(2));
    }
}

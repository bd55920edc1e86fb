//! FHIRPath Patch and JSON Patch support
//!
//! A FHIRPath Patch arrives as a `Parameters` resource. Its operations are
//! parsed up front (so a malformed body fails during bundle translation) and
//! lowered to RFC 6902 operations against the concrete target resource when
//! applied. Paths are restricted to element navigation with optional list
//! indexes (`Patient.name[0].given`); function calls are rejected.

use crate::models::{Parameter, Parameters};
use crate::Result;
use json_patch::PatchErrorKind;
use serde_json::{json, Value as JsonValue};

#[derive(Debug, Clone)]
pub enum FhirPatch {
    FhirPath(FhirPathPatch),
    Json(json_patch::Patch),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FhirPathPatch {
    operations: Vec<PatchOp>,
}

#[derive(Debug, Clone, PartialEq)]
enum PatchOp {
    Add {
        path: Vec<Segment>,
        name: String,
        value: JsonValue,
    },
    Insert {
        path: Vec<Segment>,
        index: usize,
        value: JsonValue,
    },
    Delete {
        path: Vec<Segment>,
    },
    Replace {
        path: Vec<Segment>,
        value: JsonValue,
    },
    Move {
        path: Vec<Segment>,
        source: usize,
        destination: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct Segment {
    name: String,
    index: Option<usize>,
}

impl FhirPatch {
    /// Parse a request body into a patch. Only `Parameters` bodies are accepted.
    pub fn from_resource(body: &JsonValue) -> Result<Self> {
        if crate::models::resource::resource_type(body) != Some("Parameters") {
            return Err(crate::Error::InvalidRequest(
                "Request resource type for PATCH request must be type 'Parameters'".to_string(),
            ));
        }
        let params = Parameters::from_value(body)?;
        Ok(FhirPatch::FhirPath(FhirPathPatch::from_parameters(&params)?))
    }

    pub fn from_json_patch(body: &JsonValue) -> Result<Self> {
        let patch: json_patch::Patch = serde_json::from_value(body.clone()).map_err(|e| {
            crate::Error::InvalidRequest(format!("Invalid JSON Patch document: {}", e))
        })?;
        Ok(FhirPatch::Json(patch))
    }

    /// Apply to a copy of `resource`. The input is never modified.
    pub fn apply(&self, resource: &JsonValue) -> Result<JsonValue> {
        let operations = match self {
            FhirPatch::FhirPath(p) => p.to_json_patch(resource)?,
            FhirPatch::Json(p) => p.clone(),
        };
        guard_protected_paths(&operations)?;

        let mut patched = resource.clone();
        json_patch::patch(&mut patched, &operations.0).map_err(|e| match e.kind {
            PatchErrorKind::TestFailed => crate::Error::Conflict(e.to_string()),
            _ => crate::Error::Processing(format!("Patch operation failed: {}", e)),
        })?;
        Ok(patched)
    }
}

impl FhirPathPatch {
    pub fn from_parameters(params: &Parameters) -> Result<Self> {
        let mut operations = Vec::new();
        for param in params.all_parameters() {
            if param.name != "operation" {
                return Err(crate::Error::InvalidRequest(format!(
                    "Unexpected FHIRPath Patch parameter '{}'",
                    param.name
                )));
            }
            operations.push(parse_operation(param)?);
        }
        if operations.is_empty() {
            return Err(crate::Error::InvalidRequest(
                "FHIRPath Patch contains no operations".to_string(),
            ));
        }
        Ok(Self { operations })
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Lower to JSON Patch. `add` and `delete` depend on the current content.
    fn to_json_patch(&self, resource: &JsonValue) -> Result<json_patch::Patch> {
        let mut ops = Vec::new();
        // Later operations see the effect of earlier ones.
        let mut current = resource.clone();
        for op in &self.operations {
            let lowered = match op {
                PatchOp::Add { path, name, value } => {
                    let target = pointer(path);
                    let child = format!("{}/{}", target, escape(name));
                    match current.pointer(&child) {
                        Some(JsonValue::Array(_)) => {
                            vec![json!({"op": "add", "path": format!("{}/-", child), "value": value})]
                        }
                        _ => vec![json!({"op": "add", "path": child, "value": value})],
                    }
                }
                PatchOp::Insert { path, index, value } => {
                    let target = pointer(path);
                    if !matches!(current.pointer(&target), Some(JsonValue::Array(_))) {
                        return Err(crate::Error::Processing(format!(
                            "insert requires '{}' to be a list",
                            display(path)
                        )));
                    }
                    vec![json!({"op": "add", "path": format!("{}/{}", target, index), "value": value})]
                }
                PatchOp::Delete { path } => {
                    let target = pointer(path);
                    if current.pointer(&target).is_some() {
                        vec![json!({"op": "remove", "path": target})]
                    } else {
                        Vec::new()
                    }
                }
                PatchOp::Replace { path, value } => {
                    let target = pointer(path);
                    if current.pointer(&target).is_none() {
                        return Err(crate::Error::Processing(format!(
                            "replace target '{}' does not exist",
                            display(path)
                        )));
                    }
                    vec![json!({"op": "replace", "path": target, "value": value})]
                }
                PatchOp::Move {
                    path,
                    source,
                    destination,
                } => {
                    let target = pointer(path);
                    vec![json!({
                        "op": "move",
                        "from": format!("{}/{}", target, source),
                        "path": format!("{}/{}", target, destination)
                    })]
                }
            };

            let step: json_patch::Patch = serde_json::from_value(JsonValue::Array(lowered))?;
            json_patch::patch(&mut current, &step.0)
                .map_err(|e| crate::Error::Processing(format!("Patch operation failed: {}", e)))?;
            ops.extend(step.0);
        }
        Ok(json_patch::Patch(ops))
    }
}

fn parse_operation(param: &Parameter) -> Result<PatchOp> {
    let op_type = part_string(param, "type")
        .ok_or_else(|| invalid("Missing 'type' in FHIRPath Patch operation"))?;
    let path_expr = part_string(param, "path")
        .ok_or_else(|| invalid("Missing 'path' in FHIRPath Patch operation"))?;
    let path = parse_path(&path_expr)?;

    match op_type.as_str() {
        "add" => Ok(PatchOp::Add {
            path,
            name: part_string(param, "name")
                .ok_or_else(|| invalid("'add' operation requires 'name'"))?,
            value: part_value(param).ok_or_else(|| invalid("'add' operation requires 'value'"))?,
        }),
        "insert" => Ok(PatchOp::Insert {
            path,
            index: part_index(param, "index")?,
            value: part_value(param)
                .ok_or_else(|| invalid("'insert' operation requires 'value'"))?,
        }),
        "delete" => Ok(PatchOp::Delete { path }),
        "replace" => Ok(PatchOp::Replace {
            path,
            value: part_value(param)
                .ok_or_else(|| invalid("'replace' operation requires 'value'"))?,
        }),
        "move" => Ok(PatchOp::Move {
            path,
            source: part_index(param, "source")?,
            destination: part_index(param, "destination")?,
        }),
        other => Err(invalid(&format!(
            "Unknown FHIRPath Patch operation type: {}",
            other
        ))),
    }
}

fn invalid(message: &str) -> crate::Error {
    crate::Error::InvalidRequest(message.to_string())
}

fn part_string(param: &Parameter, name: &str) -> Option<String> {
    let (_, value) = param.part(name)?.value_entry()?;
    value.as_str().map(str::to_string)
}

fn part_index(param: &Parameter, name: &str) -> Result<usize> {
    param
        .part(name)
        .and_then(|p| p.value_entry())
        .and_then(|(_, v)| v.as_u64())
        .map(|v| v as usize)
        .ok_or_else(|| invalid(&format!("FHIRPath Patch operation requires '{}'", name)))
}

fn part_value(param: &Parameter) -> Option<JsonValue> {
    let part = param.part("value")?;
    if let Some((_, value)) = part.value_entry() {
        return Some(value.clone());
    }
    // Complex values given as nested parts become an object.
    let nested = part.parts();
    if nested.is_empty() {
        return None;
    }
    let mut object = serde_json::Map::new();
    for p in nested {
        if let Some((_, v)) = p.value_entry() {
            object.insert(p.name.clone(), v.clone());
        }
    }
    Some(JsonValue::Object(object))
}

fn parse_path(expr: &str) -> Result<Vec<Segment>> {
    let unsupported = || {
        crate::Error::NotSupported(format!(
            "FHIRPath expression '{}' is not supported in patch paths",
            expr
        ))
    };

    let mut tokens: Vec<&str> = expr.split('.').collect();
    if tokens.iter().any(|t| t.is_empty()) {
        return Err(unsupported());
    }
    // Leading resource type name.
    if tokens
        .first()
        .is_some_and(|t| t.chars().next().is_some_and(|c| c.is_ascii_uppercase()))
    {
        tokens.remove(0);
    }

    tokens
        .into_iter()
        .map(|token| {
            let (name, index) = match token.split_once('[') {
                Some((name, rest)) => {
                    let idx = rest
                        .strip_suffix(']')
                        .and_then(|i| i.parse::<usize>().ok())
                        .ok_or_else(unsupported)?;
                    (name, Some(idx))
                }
                None => (token, None),
            };
            if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(unsupported());
            }
            Ok(Segment {
                name: name.to_string(),
                index,
            })
        })
        .collect()
}

fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn pointer(path: &[Segment]) -> String {
    let mut out = String::new();
    for seg in path {
        out.push('/');
        out.push_str(&escape(&seg.name));
        if let Some(i) = seg.index {
            out.push_str(&format!("/{}", i));
        }
    }
    out
}

fn display(path: &[Segment]) -> String {
    path.iter()
        .map(|s| match s.index {
            Some(i) => format!("{}[{}]", s.name, i),
            None => s.name.clone(),
        })
        .collect::<Vec<_>>()
        .join(".")
}

fn guard_protected_paths(patch: &json_patch::Patch) -> Result<()> {
    for op in &patch.0 {
        let value = serde_json::to_value(op)?;
        let path = value.get("path").and_then(|p| p.as_str()).unwrap_or("");
        for protected in ["/resourceType", "/id"] {
            if path == protected || path.starts_with(&format!("{}/", protected)) {
                return Err(crate::Error::Processing(format!(
                    "Patch may not modify '{}'",
                    &protected[1..]
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch_of(ops: JsonValue) -> FhirPatch {
        FhirPatch::from_resource(&json!({
            "resourceType": "Parameters",
            "parameter": ops
        }))
        .unwrap()
    }

    fn patient() -> JsonValue {
        json!({
            "resourceType": "Patient",
            "id": "p1",
            "active": true,
            "name": [{ "family": "Doe", "given": ["Jane"] }]
        })
    }

    #[test]
    fn replace_and_add() {
        let patch = patch_of(json!([
            { "name": "operation", "part": [
                { "name": "type", "valueCode": "replace" },
                { "name": "path", "valueString": "Patient.active" },
                { "name": "value", "valueBoolean": false }
            ]},
            { "name": "operation", "part": [
                { "name": "type", "valueCode": "add" },
                { "name": "path", "valueString": "Patient.name[0]" },
                { "name": "name", "valueString": "given" },
                { "name": "value", "valueString": "Ann" }
            ]}
        ]));

        let original = patient();
        let patched = patch.apply(&original).unwrap();
        assert_eq!(patched["active"], false);
        assert_eq!(patched["name"][0]["given"], json!(["Jane", "Ann"]));
        assert_eq!(original["active"], true);
    }

    #[test]
    fn delete_missing_is_noop() {
        let patch = patch_of(json!([
            { "name": "operation", "part": [
                { "name": "type", "valueCode": "delete" },
                { "name": "path", "valueString": "Patient.birthDate" }
            ]}
        ]));
        assert_eq!(patch.apply(&patient()).unwrap(), patient());
    }

    #[test]
    fn insert_and_move() {
        let patch = patch_of(json!([
            { "name": "operation", "part": [
                { "name": "type", "valueCode": "insert" },
                { "name": "path", "valueString": "Patient.name[0].given" },
                { "name": "index", "valueInteger": 0 },
                { "name": "value", "valueString": "Ann" }
            ]},
            { "name": "operation", "part": [
                { "name": "type", "valueCode": "move" },
                { "name": "path", "valueString": "Patient.name[0].given" },
                { "name": "source", "valueInteger": 0 },
                { "name": "destination", "valueInteger": 1 }
            ]}
        ]));
        let patched = patch.apply(&patient()).unwrap();
        assert_eq!(patched["name"][0]["given"], json!(["Jane", "Ann"]));
    }

    #[test]
    fn non_parameters_body_rejected() {
        let err = FhirPatch::from_resource(&patient()).unwrap_err();
        assert!(err
            .to_string()
            .contains("must be type 'Parameters'"));
    }

    #[test]
    fn function_paths_rejected() {
        let err = FhirPatch::from_resource(&json!({
            "resourceType": "Parameters",
            "parameter": [{ "name": "operation", "part": [
                { "name": "type", "valueCode": "delete" },
                { "name": "path", "valueString": "Patient.name.where(use='old')" }
            ]}]
        }))
        .unwrap_err();
        assert!(matches!(err, crate::Error::NotSupported(_)));
    }

    #[test]
    fn id_is_protected() {
        let patch = FhirPatch::from_json_patch(&json!([
            { "op": "replace", "path": "/id", "value": "other" }
        ]))
        .unwrap();
        assert!(patch.apply(&patient()).is_err());
    }
}

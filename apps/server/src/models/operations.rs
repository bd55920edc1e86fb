use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Where a custom operation is invoked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationContext {
    System,
    Type(String),
    Instance(String, String),
}

impl OperationContext {
    pub fn resource_type(&self) -> Option<&str> {
        match self {
            OperationContext::System => None,
            OperationContext::Type(rt) | OperationContext::Instance(rt, _) => Some(rt),
        }
    }

    pub fn logical_id(&self) -> Option<&str> {
        match self {
            OperationContext::Instance(_, id) => Some(id),
            _ => None,
        }
    }

    /// Registry key: `name` at system level, `name:Type` otherwise.
    pub fn operation_key(&self, operation_name: &str) -> String {
        match self.resource_type() {
            None => operation_name.to_string(),
            Some(rt) => format!("{}:{}", operation_name, rt),
        }
    }
}

/// Operation invocation request
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub operation_name: String,
    pub context: OperationContext,
    pub version_id: Option<String>,
    pub parameters: Parameters,
}

/// FHIR Parameters resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter: Option<Vec<Parameter>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(flatten)]
    pub value: ParameterValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Resource {
        resource: JsonValue,
    },
    Parts {
        part: Vec<Parameter>,
    },
    /// FHIR JSON "value[x]" parameter content, e.g. `{ "valueString": "..." }`
    Value(HashMap<String, JsonValue>),
}

impl Parameters {
    pub fn new() -> Self {
        Self {
            resource_type: "Parameters".to_string(),
            id: None,
            parameter: None,
        }
    }

    pub fn from_value(value: &JsonValue) -> crate::Result<Self> {
        let params: Self = serde_json::from_value(value.clone()).map_err(|e| {
            crate::Error::InvalidRequest(format!("Invalid Parameters resource: {}", e))
        })?;
        if params.resource_type != "Parameters" {
            return Err(crate::Error::InvalidRequest(format!(
                "Expected a Parameters resource, got '{}'",
                params.resource_type
            )));
        }
        Ok(params)
    }

    /// Build input parameters from query parameters (GET invocation).
    pub fn from_query(query: &[(String, String)]) -> Self {
        let mut params = Self::new();
        for (name, value) in query {
            params.add_value_string(name.clone(), value.clone());
        }
        params
    }

    pub fn add_value_string(&mut self, name: String, value: String) {
        self.add_value(name, "valueString", JsonValue::String(value));
    }

    pub fn add_value(&mut self, name: String, value_key: &str, value: JsonValue) {
        let param = Parameter {
            name,
            value: ParameterValue::Value(HashMap::from([(value_key.to_string(), value)])),
        };
        self.parameter.get_or_insert_with(Vec::new).push(param);
    }

    pub fn add_resource(&mut self, name: String, resource: JsonValue) {
        let param = Parameter {
            name,
            value: ParameterValue::Resource { resource },
        };
        self.parameter.get_or_insert_with(Vec::new).push(param);
    }

    pub fn get_parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameter.as_ref()?.iter().find(|p| p.name == name)
    }

    pub fn get_resource(&self, name: &str) -> Option<&JsonValue> {
        match &self.get_parameter(name)?.value {
            ParameterValue::Resource { resource } => Some(resource),
            _ => None,
        }
    }

    pub fn all_parameters(&self) -> impl Iterator<Item = &Parameter> {
        self.parameter.as_deref().unwrap_or(&[]).iter()
    }

    /// The single resource of an output with exactly one `resource` parameter.
    pub fn single_resource_output(&self) -> Option<&JsonValue> {
        match self.parameter.as_deref() {
            Some([only]) => match &only.value {
                ParameterValue::Resource { resource } => Some(resource),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn to_value(&self) -> crate::Result<JsonValue> {
        Ok(serde_json::to_value(self)?)
    }
}

impl Parameter {
    /// The `value[x]` of this parameter together with its JSON key.
    pub fn value_entry(&self) -> Option<(&str, &JsonValue)> {
        match &self.value {
            ParameterValue::Value(map) => map
                .iter()
                .find(|(k, _)| k.starts_with("value"))
                .map(|(k, v)| (k.as_str(), v)),
            _ => None,
        }
    }

    pub fn parts(&self) -> &[Parameter] {
        match &self.value {
            ParameterValue::Parts { part } => part,
            _ => &[],
        }
    }

    pub fn part(&self, name: &str) -> Option<&Parameter> {
        self.parts().iter().find(|p| p.name == name)
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self::new()
    }
}

/// Operation execution result
#[derive(Debug, Clone)]
pub enum OperationResult {
    Resource(JsonValue),
    Parameters(Parameters),
    NoContent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_fhirpath_patch_parameters() {
        let params = Parameters::from_value(&json!({
            "resourceType": "Parameters",
            "parameter": [{
                "name": "operation",
                "part": [
                    { "name": "type", "valueCode": "replace" },
                    { "name": "path", "valueString": "Patient.active" },
                    { "name": "value", "valueBoolean": false }
                ]
            }]
        }))
        .unwrap();

        let op = params.get_parameter("operation").unwrap();
        assert_eq!(op.parts().len(), 3);
        let (key, value) = op.part("value").unwrap().value_entry().unwrap();
        assert_eq!(key, "valueBoolean");
        assert_eq!(value, &json!(false));
    }

    #[test]
    fn non_parameters_rejected() {
        assert!(Parameters::from_value(&json!({ "resourceType": "Patient" })).is_err());
    }

    #[test]
    fn single_resource_output_detected() {
        let mut params = Parameters::new();
        params.add_resource("return".to_string(), json!({ "resourceType": "Patient" }));
        assert!(params.single_resource_output().is_some());
        params.add_value_string("extra".to_string(), "x".to_string());
        assert!(params.single_resource_output().is_none());
    }

    #[test]
    fn operation_key_includes_type() {
        assert_eq!(OperationContext::System.operation_key("reindex"), "reindex");
        assert_eq!(
            OperationContext::Instance("Patient".into(), "1".into()).operation_key("everything"),
            "everything:Patient"
        );
    }
}

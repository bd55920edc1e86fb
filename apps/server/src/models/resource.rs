//! Resource documents and their server-managed metadata
//!
//! Resources travel through the engine as `serde_json::Value`. The helpers here
//! never mutate a document in place: assigning identity or metadata returns a
//! new value.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

/// A stored resource version as returned by persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub resource_type: String,
    pub version_id: i32,
    pub resource: JsonValue,
    pub last_updated: DateTime<Utc>,
    pub deleted: bool,
}

impl Resource {
    /// Build from a document that already carries `id` and `meta`.
    pub fn from_document(resource: JsonValue, deleted: bool) -> crate::Result<Self> {
        let resource_type = resource_type(&resource)
            .ok_or_else(|| crate::Error::RequiredFieldMissing("Missing resourceType field".to_string()))?
            .to_string();
        let id = resource_id(&resource)
            .ok_or_else(|| crate::Error::RequiredFieldMissing("Resource must have an id".to_string()))?
            .to_string();
        let version_id = version_id(&resource).ok_or_else(|| {
            crate::Error::Internal(format!("{}/{} has no meta.versionId", resource_type, id))
        })?;
        let last_updated = last_updated(&resource).unwrap_or_else(Utc::now);
        Ok(Self {
            id,
            resource_type,
            version_id,
            resource,
            last_updated,
            deleted,
        })
    }

    pub fn reference(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }

    pub fn location(&self) -> String {
        location(&self.resource_type, &self.id, self.version_id)
    }
}

/// Kind of change recorded in the persistence change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

/// One entry of the persistence change log (whole-system history).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub change_id: i64,
    pub changed_at: DateTime<Utc>,
    pub resource_type: String,
    pub logical_id: String,
    pub version_id: i32,
    pub change_type: ChangeType,
}

pub fn resource_type(resource: &JsonValue) -> Option<&str> {
    resource.get("resourceType").and_then(|v| v.as_str())
}

pub fn resource_id(resource: &JsonValue) -> Option<&str> {
    resource.get("id").and_then(|v| v.as_str())
}

pub fn version_id(resource: &JsonValue) -> Option<i32> {
    resource
        .get("meta")
        .and_then(|m| m.get("versionId"))
        .and_then(|v| v.as_str())
        .and_then(|v| v.parse().ok())
}

pub fn last_updated(resource: &JsonValue) -> Option<DateTime<Utc>> {
    resource
        .get("meta")
        .and_then(|m| m.get("lastUpdated"))
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Copy of `resource` with `id` replaced.
pub fn with_id(resource: &JsonValue, id: &str) -> JsonValue {
    let mut copy = resource.clone();
    if let Some(obj) = copy.as_object_mut() {
        obj.insert("id".to_string(), json!(id));
    }
    copy
}

/// Copy of `resource` with id, `meta.versionId` and `meta.lastUpdated` set.
///
/// Client-supplied `versionId`/`lastUpdated` are always overwritten.
pub fn with_meta(
    resource: &JsonValue,
    id: &str,
    version_id: i32,
    last_updated: DateTime<Utc>,
) -> JsonValue {
    let mut copy = with_id(resource, id);
    if let Some(obj) = copy.as_object_mut() {
        let meta = obj.entry("meta".to_string()).or_insert_with(|| json!({}));
        if !meta.is_object() {
            *meta = json!({});
        }
        if let Some(meta_obj) = meta.as_object_mut() {
            meta_obj.insert("versionId".to_string(), json!(version_id.to_string()));
            meta_obj.insert(
                "lastUpdated".to_string(),
                json!(format_instant(truncate_to_micros(last_updated))),
            );
        }
    }
    copy
}

/// Stored timestamps carry microsecond precision.
pub fn truncate_to_micros(instant: DateTime<Utc>) -> DateTime<Utc> {
    let us = (instant.timestamp_subsec_nanos() / 1_000) * 1_000;
    DateTime::from_timestamp(instant.timestamp(), us).unwrap_or(instant)
}

pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn location(resource_type: &str, id: &str, version_id: i32) -> String {
    format!("{}/{}/_history/{}", resource_type, id, version_id)
}

pub fn etag(version_id: i32) -> String {
    format!("W/\"{}\"", version_id)
}

/// Extract the version from a weak ETag of the form `W/"<version>"`.
pub fn version_from_etag(value: &str) -> Option<String> {
    let quoted = value.strip_prefix("W/")?;
    let inner = quoted.strip_prefix('"')?.strip_suffix('"')?;
    if inner.is_empty() {
        None
    } else {
        Some(inner.to_string())
    }
}

pub fn is_known_resource_type(name: &str) -> bool {
    RESOURCE_TYPES.binary_search(&name).is_ok()
}

/// FHIR R4 resource type names, sorted.
const RESOURCE_TYPES: &[&str] = &[
    "Account",
    "ActivityDefinition",
    "AdverseEvent",
    "AllergyIntolerance",
    "Appointment",
    "AppointmentResponse",
    "AuditEvent",
    "Basic",
    "Binary",
    "BiologicallyDerivedProduct",
    "BodyStructure",
    "Bundle",
    "CapabilityStatement",
    "CarePlan",
    "CareTeam",
    "CatalogEntry",
    "ChargeItem",
    "ChargeItemDefinition",
    "Claim",
    "ClaimResponse",
    "ClinicalImpression",
    "CodeSystem",
    "Communication",
    "CommunicationRequest",
    "CompartmentDefinition",
    "Composition",
    "ConceptMap",
    "Condition",
    "Consent",
    "Contract",
    "Coverage",
    "CoverageEligibilityRequest",
    "CoverageEligibilityResponse",
    "DetectedIssue",
    "Device",
    "DeviceDefinition",
    "DeviceMetric",
    "DeviceRequest",
    "DeviceUseStatement",
    "DiagnosticReport",
    "DocumentManifest",
    "DocumentReference",
    "EffectEvidenceSynthesis",
    "Encounter",
    "Endpoint",
    "EnrollmentRequest",
    "EnrollmentResponse",
    "EpisodeOfCare",
    "EventDefinition",
    "Evidence",
    "EvidenceVariable",
    "ExampleScenario",
    "ExplanationOfBenefit",
    "FamilyMemberHistory",
    "Flag",
    "Goal",
    "GraphDefinition",
    "Group",
    "GuidanceResponse",
    "HealthcareService",
    "ImagingStudy",
    "Immunization",
    "ImmunizationEvaluation",
    "ImmunizationRecommendation",
    "ImplementationGuide",
    "InsurancePlan",
    "Invoice",
    "Library",
    "Linkage",
    "List",
    "Location",
    "Measure",
    "MeasureReport",
    "Media",
    "Medication",
    "MedicationAdministration",
    "MedicationDispense",
    "MedicationKnowledge",
    "MedicationRequest",
    "MedicationStatement",
    "MedicinalProduct",
    "MedicinalProductAuthorization",
    "MedicinalProductContraindication",
    "MedicinalProductIndication",
    "MedicinalProductIngredient",
    "MedicinalProductInteraction",
    "MedicinalProductManufactured",
    "MedicinalProductPackaged",
    "MedicinalProductPharmaceutical",
    "MedicinalProductUndesirableEffect",
    "MessageDefinition",
    "MessageHeader",
    "MolecularSequence",
    "NamingSystem",
    "NutritionOrder",
    "Observation",
    "ObservationDefinition",
    "OperationDefinition",
    "OperationOutcome",
    "Organization",
    "OrganizationAffiliation",
    "Parameters",
    "Patient",
    "PaymentNotice",
    "PaymentReconciliation",
    "Person",
    "PlanDefinition",
    "Practitioner",
    "PractitionerRole",
    "Procedure",
    "Provenance",
    "Questionnaire",
    "QuestionnaireResponse",
    "RelatedPerson",
    "RequestGroup",
    "ResearchDefinition",
    "ResearchElementDefinition",
    "ResearchStudy",
    "ResearchSubject",
    "RiskAssessment",
    "RiskEvidenceSynthesis",
    "Schedule",
    "SearchParameter",
    "ServiceRequest",
    "Slot",
    "Specimen",
    "SpecimenDefinition",
    "StructureDefinition",
    "StructureMap",
    "Subscription",
    "Substance",
    "SubstanceNucleicAcid",
    "SubstancePolymer",
    "SubstanceProtein",
    "SubstanceReferenceInformation",
    "SubstanceSourceMaterial",
    "SubstanceSpecification",
    "SupplyDelivery",
    "SupplyRequest",
    "Task",
    "TerminologyCapabilities",
    "TestReport",
    "TestScript",
    "ValueSet",
    "VerificationResult",
    "VisionPrescription",
];

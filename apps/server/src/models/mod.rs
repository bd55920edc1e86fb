//! Data models shared across the engine

pub mod bundle;
pub mod operations;
pub mod outcome;
pub mod resource;

pub use bundle::{
    Bundle, BundleEntry, BundleEntryRequest, BundleEntryResponse, BundleEntrySearch,
    BundleEntrySearchMode, BundleLink, BundleType,
};
pub use operations::{
    OperationContext, OperationRequest, OperationResult, Parameter, ParameterValue, Parameters,
};
pub use outcome::{Issue, IssueSeverity, IssueType, OperationOutcome};
pub use resource::{is_known_resource_type, ChangeRecord, ChangeType, Resource};

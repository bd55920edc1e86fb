//! Business logic layer
//!
//! [`RestHelper`] implements the REST interactions; bundles are translated
//! into [`crate::interaction::Interaction`]s and run by the executor.

pub mod assembler;
pub mod executor;
pub mod fingerprint;
pub mod interceptor;
pub mod operation;
pub mod patch;
pub mod references;
pub mod rest;
pub mod retry;
pub mod translator;

pub use interceptor::{Interceptor, InterceptorEvent, InterceptorManager};
pub use operation::{Operation, OperationRegistry};
pub use patch::FhirPatch;
pub use references::{FrozenReferenceMap, LocalReferenceMap};
pub use rest::{RequestContext, RestHelper, RestOperationResponse, ReturnPreference};
pub use retry::RetryPolicy;

pub mod fhir;
pub mod health;

#[allow(unused)]
mod support;

use axum::http::{Method, StatusCode};
use fhir_rest_engine::config::{Config, ResourceConfig};
use serde_json::{json, Value};
use support::{
    assert_resource_id, assert_status, assert_version_id, constants, create_patient,
    entry_status, entry_statuses, patient_with_mrn, test_config, with_test_app,
    with_test_app_with_config,
};

fn identifier_query(mrn: &str) -> String {
    format!("identifier={}|{}", constants::MRN_SYSTEM, mrn)
}

#[tokio::test]
async fn batch_preserves_request_order() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let bundle = json!({
                "resourceType": "Bundle",
                "type": "batch",
                "entry": [
                    {
                        "request": { "method": "GET", "url": "Patient/does-not-exist" }
                    },
                    {
                        "request": { "method": "POST", "url": "Patient" },
                        "resource": patient_with_mrn("Doe", "100")
                    },
                    {
                        "request": { "method": "PUT", "url": "Patient/abc" },
                        "resource": { "resourceType": "Patient", "id": "abc", "active": true }
                    },
                    {
                        "request": { "method": "DELETE", "url": "Patient/missing" }
                    }
                ]
            });

            let (status, _headers, response) =
                app.json(Method::POST, "/fhir", Some(&bundle)).await?;
            assert_status(status, StatusCode::OK, "batch");
            assert_eq!(response["type"], "batch-response");
            assert_eq!(entry_statuses(&response), vec!["404", "201", "201", "200"]);

            let created = &response["entry"][2];
            assert_resource_id(&created["resource"], "abc")?;
            assert_eq!(
                created["fullUrl"],
                format!("{}/Patient/abc", constants::BASE_URL)
            );
            assert_eq!(
                response["entry"][0]["resource"]["resourceType"],
                "OperationOutcome"
            );
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn delete_runs_before_post() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let existing = create_patient(&app, "Doe", "200").await?;

            // The conditional create only misses if the DELETE ran first.
            let bundle = json!({
                "resourceType": "Bundle",
                "type": "transaction",
                "entry": [
                    {
                        "request": {
                            "method": "POST",
                            "url": "Patient",
                            "ifNoneExist": identifier_query("200")
                        },
                        "resource": patient_with_mrn("Roe", "200")
                    },
                    {
                        "request": { "method": "DELETE", "url": format!("Patient/{existing}") }
                    }
                ]
            });

            let (status, _headers, response) =
                app.json(Method::POST, "/fhir", Some(&bundle)).await?;
            assert_status(status, StatusCode::OK, "transaction");
            assert_eq!(response["type"], "transaction-response");
            assert_eq!(entry_statuses(&response), vec!["201", "200"]);
            assert_ne!(response["entry"][0]["resource"]["id"], json!(existing));

            let (status, _headers, _body) = app
                .json(Method::GET, &format!("/fhir/Patient/{existing}"), None)
                .await?;
            assert_status(status, StatusCode::GONE, "read deleted");
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn transaction_is_all_or_nothing() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let bundle = json!({
                "resourceType": "Bundle",
                "type": "transaction",
                "entry": [
                    {
                        "request": { "method": "POST", "url": "Patient" },
                        "resource": patient_with_mrn("Doe", "300")
                    },
                    {
                        "request": { "method": "PUT", "url": "Patient/one" },
                        "resource": { "resourceType": "Patient", "id": "two" }
                    }
                ]
            });

            let (status, _headers, outcome) =
                app.json(Method::POST, "/fhir", Some(&bundle)).await?;
            assert_status(status, StatusCode::BAD_REQUEST, "failing transaction");
            assert_eq!(outcome["resourceType"], "OperationOutcome");

            let (status, _headers, search) = app
                .json(
                    Method::GET,
                    &format!("/fhir/Patient?{}", identifier_query("300").replace('|', "%7C")),
                    None,
                )
                .await?;
            assert_status(status, StatusCode::OK, "search");
            assert_eq!(search["total"], 0);
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn transaction_resolves_local_references() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let patient_url = "urn:uuid:61ebe359-bfdc-4613-8bf2-c5e300945f0a";
            let bundle = json!({
                "resourceType": "Bundle",
                "type": "transaction",
                "entry": [
                    {
                        "fullUrl": "urn:uuid:88f151c0-a954-468a-88ef-ba1fce5a5fd2",
                        "request": { "method": "POST", "url": "Observation" },
                        "resource": {
                            "resourceType": "Observation",
                            "status": "final",
                            "code": { "text": "weight" },
                            "subject": { "reference": patient_url }
                        }
                    },
                    {
                        "fullUrl": patient_url,
                        "request": { "method": "POST", "url": "Patient" },
                        "resource": patient_with_mrn("Doe", "400")
                    }
                ]
            });

            let (status, _headers, response) =
                app.json(Method::POST, "/fhir", Some(&bundle)).await?;
            assert_status(status, StatusCode::OK, "transaction");
            assert_eq!(entry_statuses(&response), vec!["201", "201"]);

            let patient_id = response["entry"][1]["resource"]["id"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            assert!(!patient_id.is_empty());
            assert_eq!(
                response["entry"][0]["resource"]["subject"]["reference"],
                format!("Patient/{patient_id}")
            );

            let observation_id = response["entry"][0]["resource"]["id"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let (_status, _headers, stored) = app
                .json(Method::GET, &format!("/fhir/Observation/{observation_id}"), None)
                .await?;
            assert_eq!(
                stored["subject"]["reference"],
                format!("Patient/{patient_id}")
            );
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn conditional_create_depends_on_match_count() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let one = create_patient(&app, "Doe", "500").await?;
            create_patient(&app, "Twin", "501").await?;
            create_patient(&app, "Twin", "501").await?;

            let conditional = |mrn: &str| -> Value {
                json!({
                    "request": {
                        "method": "POST",
                        "url": "Patient",
                        "ifNoneExist": identifier_query(mrn)
                    },
                    "resource": patient_with_mrn("New", mrn)
                })
            };
            let bundle = json!({
                "resourceType": "Bundle",
                "type": "batch",
                "entry": [conditional("599"), conditional("500"), conditional("501")]
            });

            let (status, _headers, response) =
                app.json(Method::POST, "/fhir", Some(&bundle)).await?;
            assert_status(status, StatusCode::OK, "batch");
            assert_eq!(entry_statuses(&response), vec!["201", "200", "412"]);

            let matched = &response["entry"][1]["resource"];
            assert_resource_id(matched, &one)?;
            assert_version_id(matched, "1")?;
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn conditional_put_with_id_creates_that_id() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let bundle = json!({
                "resourceType": "Bundle",
                "type": "transaction",
                "entry": [{
                    "request": {
                        "method": "PUT",
                        "url": format!("Patient?{}", identifier_query("600"))
                    },
                    "resource": {
                        "resourceType": "Patient",
                        "id": "chosen-id",
                        "identifier": [{ "system": constants::MRN_SYSTEM, "value": "600" }]
                    }
                }]
            });

            let (status, _headers, response) =
                app.json(Method::POST, "/fhir", Some(&bundle)).await?;
            assert_status(status, StatusCode::OK, "transaction");
            let entry = &response["entry"][0];
            assert_eq!(entry_status(entry), "201");
            assert_resource_id(&entry["resource"], "chosen-id")?;
            assert_version_id(&entry["resource"], "1")?;
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn bundle_of_other_type_is_rejected() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let bundle = json!({ "resourceType": "Bundle", "type": "collection", "entry": [] });
            let (status, _headers, outcome) =
                app.json(Method::POST, "/fhir", Some(&bundle)).await?;
            assert_status(status, StatusCode::BAD_REQUEST, "collection bundle");
            assert_eq!(outcome["resourceType"], "OperationOutcome");
            Ok(())
        })
    })
    .await
}

fn allow(config: &mut Config, resource_type: &str, interactions: &[&str]) {
    config.fhir.resources.insert(
        resource_type.to_string(),
        ResourceConfig {
            interactions: Some(interactions.iter().map(|i| i.to_string()).collect()),
            profiles: None,
        },
    );
}

#[tokio::test]
async fn bundled_create_with_local_id_checks_create_permission() -> anyhow::Result<()> {
    let mut config = test_config();
    allow(&mut config, "Patient", &["create", "read"]);
    allow(&mut config, "Observation", &["update", "read"]);

    with_test_app_with_config(config, |app| {
        Box::pin(async move {
            let mut supplied = patient_with_mrn("Doe", "700");
            supplied["id"] = json!("client-id");
            let bundle = json!({
                "resourceType": "Bundle",
                "type": "batch",
                "entry": [
                    {
                        "fullUrl": "urn:uuid:0b7c5a7e-8d52-4d2b-9a57-3f4e1c2b9d10",
                        "request": { "method": "POST", "url": "Patient" },
                        "resource": supplied
                    },
                    {
                        "request": { "method": "POST", "url": "Patient" },
                        "resource": patient_with_mrn("Roe", "701")
                    },
                    {
                        "fullUrl": "urn:uuid:5d0f2c8b-3e6a-4f51-b7c9-1a2d3e4f5a6b",
                        "request": { "method": "POST", "url": "Observation" },
                        "resource": {
                            "resourceType": "Observation",
                            "status": "final",
                            "code": { "text": "pulse" }
                        }
                    }
                ]
            });

            let (status, _headers, response) =
                app.json(Method::POST, "/fhir", Some(&bundle)).await?;
            assert_status(status, StatusCode::OK, "batch");
            assert_eq!(entry_statuses(&response), vec!["201", "201", "409"]);

            let created = &response["entry"][0];
            assert_ne!(created["resource"]["id"], "client-id");
            assert_version_id(&created["resource"], "1")?;
            let note = created["response"]["outcome"]["issue"][0]["details"]["text"]
                .as_str()
                .unwrap_or_default();
            assert!(note.contains("client-id"), "missing replaced-id note: {note}");
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn unresolved_local_reference_fails_only_its_batch_entry() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let bundle = json!({
                "resourceType": "Bundle",
                "type": "batch",
                "entry": [
                    {
                        "request": { "method": "POST", "url": "Patient" },
                        "resource": patient_with_mrn("Doe", "800")
                    },
                    {
                        "request": { "method": "POST", "url": "Observation" },
                        "resource": {
                            "resourceType": "Observation",
                            "status": "final",
                            "code": { "text": "pulse" },
                            "subject": { "reference": "urn:uuid:not-in-this-bundle" }
                        }
                    },
                    {
                        "request": { "method": "POST", "url": "Patient" },
                        "resource": patient_with_mrn("Roe", "801")
                    }
                ]
            });

            let (status, _headers, response) =
                app.json(Method::POST, "/fhir", Some(&bundle)).await?;
            assert_status(status, StatusCode::OK, "batch");
            assert_eq!(entry_statuses(&response), vec!["201", "400", "201"]);
            let message = response["entry"][1]["resource"]["issue"][0]["details"]["text"]
                .as_str()
                .unwrap_or_default();
            assert!(message.contains("urn:uuid:not-in-this-bundle"));
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn unresolved_local_reference_aborts_transaction() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let bundle = json!({
                "resourceType": "Bundle",
                "type": "transaction",
                "entry": [
                    {
                        "request": { "method": "POST", "url": "Patient" },
                        "resource": patient_with_mrn("Doe", "900")
                    },
                    {
                        "request": { "method": "POST", "url": "Observation" },
                        "resource": {
                            "resourceType": "Observation",
                            "status": "final",
                            "code": { "text": "pulse" },
                            "subject": { "reference": "urn:uuid:not-in-this-bundle" }
                        }
                    }
                ]
            });

            let (status, _headers, outcome) =
                app.json(Method::POST, "/fhir", Some(&bundle)).await?;
            assert_status(status, StatusCode::BAD_REQUEST, "transaction");
            assert_eq!(outcome["resourceType"], "OperationOutcome");

            for path in [
                format!("/fhir/Patient?{}", identifier_query("900").replace('|', "%7C")),
                "/fhir/Observation".to_string(),
            ] {
                let (status, _headers, search) = app.json(Method::GET, &path, None).await?;
                assert_status(status, StatusCode::OK, "search");
                assert_eq!(search["total"], 0, "{path}");
            }
            Ok(())
        })
    })
    .await
}

#[allow(unused)]
mod support;

use axum::{
    body::Body,
    http::{Method, StatusCode},
};
use serde_json::json;
use support::{assert_status, create_patient, parse_json, with_test_app};

#[tokio::test]
async fn search_by_identifier_and_paging() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            for _ in 0..3 {
                create_patient(&app, "Doe", "s1").await?;
            }
            create_patient(&app, "Other", "s2").await?;

            let (status, _headers, bundle) = app
                .json(
                    Method::GET,
                    "/fhir/Patient?identifier=http://example.org/fhir/mrn%7Cs1&_count=2",
                    None,
                )
                .await?;
            assert_status(status, StatusCode::OK, "search");
            assert_eq!(bundle["type"], "searchset");
            assert_eq!(bundle["total"], 3);
            assert_eq!(bundle["entry"].as_array().map(Vec::len), Some(2));

            let relations: Vec<&str> = bundle["link"]
                .as_array()
                .map(|links| links.iter().filter_map(|l| l["relation"].as_str()).collect())
                .unwrap_or_default();
            assert!(relations.contains(&"self"));
            assert!(relations.contains(&"next"));
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn post_search_reads_form_body() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            create_patient(&app, "Doe", "s3").await?;
            create_patient(&app, "Roe", "s4").await?;

            let (status, _headers, body) = app
                .request_with_headers(
                    Method::POST,
                    "/fhir/Patient/_search",
                    &[("content-type", "application/x-www-form-urlencoded")],
                    Some(Body::from("identifier=http%3A%2F%2Fexample.org%2Ffhir%2Fmrn%7Cs4")),
                )
                .await?;
            assert_status(status, StatusCode::OK, "post search");
            let bundle = parse_json(&body)?;
            assert_eq!(bundle["total"], 1);
            assert_eq!(bundle["entry"][0]["resource"]["name"][0]["family"], "Roe");
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn compartment_search_follows_references() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let patient = create_patient(&app, "Doe", "s5").await?;
            let other = create_patient(&app, "Roe", "s6").await?;
            for subject in [&patient, &patient, &other] {
                let observation = json!({
                    "resourceType": "Observation",
                    "status": "final",
                    "code": { "text": "pulse" },
                    "subject": { "reference": format!("Patient/{subject}") }
                });
                let (status, _headers, _body) = app
                    .json(Method::POST, "/fhir/Observation", Some(&observation))
                    .await?;
                assert_status(status, StatusCode::CREATED, "create observation");
            }

            let (status, _headers, bundle) = app
                .json(
                    Method::GET,
                    &format!("/fhir/Patient/{patient}/Observation"),
                    None,
                )
                .await?;
            assert_status(status, StatusCode::OK, "compartment search");
            assert_eq!(bundle["total"], 2);
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn strict_handling_rejects_unknown_parameters() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let (status, _headers, _body) = app
                .request_with_headers(
                    Method::GET,
                    "/fhir/Patient?_bogus=1",
                    &[("prefer", "handling=strict")],
                    None,
                )
                .await?;
            assert_status(status, StatusCode::BAD_REQUEST, "strict search");

            let (status, _headers, _body) = app
                .request_with_headers(
                    Method::GET,
                    "/fhir/Patient?_bogus=1",
                    &[("prefer", "handling=lenient")],
                    None,
                )
                .await?;
            assert_status(status, StatusCode::OK, "lenient search");
            Ok(())
        })
    })
    .await
}

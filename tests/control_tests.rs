//! Control surface over the full regeneration stack

mod support;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use support::{Harness, snapshot};
use vhostgen::control::{ControlState, router};

async fn post_cert(harness: &Harness, body: &str) -> (StatusCode, Value) {
    let app = router(Arc::new(ControlState {
        regenerator: harness.regenerator.clone(),
    }));
    let response = app
        .oneshot(
            Request::post("/cert")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn pushed_secret_brings_a_waiting_host_online() {
    // GIVEN: a container that has a role but never got a secret
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(
        dir.path(),
        vec![snapshot("app", "10.0.0.7", &["SERVICE_FQDN=app.example.com", "PKI_ROLE_ID=role-1"])],
    );
    harness.regenerator.run_cycle(false).await.unwrap();
    assert!(!harness.conf().contains("upstream app.example.com {"));

    // WHEN: a secret is pushed for its hostname
    let (status, json) = post_cert(&harness, r#"{"secret_id": "pushed-1", "domain": "app.example.com"}"#).await;

    // THEN: the certificate was issued with it and the host is live
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["updated"], "app.example.com");
    assert_eq!(json["regen"], true);
    assert_eq!(
        harness.store.logins.lock().unwrap().clone(),
        vec![("role-1".to_string(), "pushed-1".to_string())]
    );
    assert!(harness.conf().contains("upstream app.example.com {"));
    assert_eq!(harness.reload.count(), 2);
}

#[tokio::test]
async fn same_secret_pushed_twice_is_refused_the_second_time() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(
        dir.path(),
        vec![snapshot("app", "10.0.0.7", &["SERVICE_FQDN=app.example.com", "PKI_ROLE_ID=role-1"])],
    );
    let body = r#"{"secret_id": "pushed-1", "image": "registry.example.com/app:1.0"}"#;

    let (first, _) = post_cert(&harness, body).await;
    let (second, json) = post_cert(&harness, body).await;

    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);
    assert_eq!(json["admitted"], 0);
    assert_eq!(harness.store.logins.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn pushed_secret_is_not_lost_to_a_concurrent_cycle() {
    // GIVEN: a host waiting for a secret
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(
        dir.path(),
        vec![snapshot("app", "10.0.0.7", &["SERVICE_FQDN=app.example.com", "PKI_ROLE_ID=role-1"])],
    );

    // WHEN: a debounced cycle and a push run at the same time
    let (cycle, (status, json)) = tokio::join!(
        harness.regenerator.run_cycle(false),
        post_cert(&harness, r#"{"secret_id": "pushed-1", "domain": "app.example.com"}"#),
    );

    // THEN: the push reports the issuance it caused, and it happened once
    cycle.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["admitted"], 1);
    assert_eq!(
        harness.store.logins.lock().unwrap().clone(),
        vec![("role-1".to_string(), "pushed-1".to_string())]
    );
    assert!(harness.conf().contains("upstream app.example.com {"));
}

#[tokio::test]
async fn ping_is_always_available() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(dir.path(), Vec::new());
    let app = router(Arc::new(ControlState {
        regenerator: harness.regenerator.clone(),
    }));

    let response = app
        .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"PONG!\n");
}

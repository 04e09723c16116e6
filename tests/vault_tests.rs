//! Vault client against a mock HTTP server

use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;

use vhostgen::config::VaultConfig;
use vhostgen::pki::{IssuanceError, IssueRequest, SecretStore, VaultClient};

fn client(server: &MockServer, token: Option<&str>) -> VaultClient {
    VaultClient::new(&VaultConfig {
        addr: Some(server.base_url()),
        token: token.map(String::from),
        ..VaultConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn login_exchanges_role_and_secret_for_a_token() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/auth/approle/login")
            .json_body(json!({ "role_id": "role-1", "secret_id": "secret-1" }));
        then.status(200)
            .json_body(json!({ "auth": { "client_token": "s.client" } }));
    });

    let token = client(&server, None).login("role-1", "secret-1").await.unwrap();

    assert_eq!(token, "s.client");
    mock.assert();
}

#[tokio::test]
async fn authority_errors_become_login_failures() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v1/auth/approle/login");
        then.status(400)
            .json_body(json!({ "errors": ["invalid secret id"] }));
    });

    let err = client(&server, None).login("role-1", "used").await.unwrap_err();

    match err {
        IssuanceError::Login(message) => assert!(message.contains("invalid secret id")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn static_token_skips_login() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/v1/auth/approle/login");
        then.status(200)
            .json_body(json!({ "auth": { "client_token": "unused" } }));
    });

    let token = client(&server, Some("s.static")).login("role-1", "secret-1").await.unwrap();

    assert_eq!(token, "s.static");
    mock.assert_hits(0);
}

#[tokio::test]
async fn issue_sends_names_and_ttl() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/pki/issue/app.example.com")
            .header("X-Vault-Token", "s.client")
            .json_body(json!({
                "common_name": "app.example.com",
                "ttl": "3600",
                "alt_names": "app,www.example.com",
            }));
        then.status(200).json_body(json!({
            "data": { "certificate": "CERT", "private_key": "KEY", "serial_number": "01" }
        }));
    });

    let issued = client(&server, None)
        .issue(
            "s.client",
            &IssueRequest {
                role: "app.example.com".to_string(),
                common_name: "app.example.com".to_string(),
                ttl: Duration::from_secs(3600),
                alt_names: vec!["app".to_string(), "www.example.com".to_string()],
            },
        )
        .await
        .unwrap();

    mock.assert();
    assert_eq!(issued.certificate, "CERT");
    assert_eq!(issued.private_key, "KEY");
}

#[tokio::test]
async fn issue_without_alt_names_omits_the_field() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/pki/issue/web")
            .json_body(json!({ "common_name": "web.example.com", "ttl": "60" }));
        then.status(200)
            .json_body(json!({ "data": { "certificate": "C", "private_key": "K" } }));
    });

    client(&server, None)
        .issue(
            "t",
            &IssueRequest {
                role: "web".to_string(),
                common_name: "web.example.com".to_string(),
                ttl: Duration::from_secs(60),
                alt_names: Vec::new(),
            },
        )
        .await
        .unwrap();

    mock.assert();
}

#[tokio::test]
async fn issue_response_without_key_is_rejected() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v1/pki/issue/web");
        then.status(200)
            .json_body(json!({ "data": { "certificate": "C" } }));
    });

    let err = client(&server, None)
        .issue(
            "t",
            &IssueRequest {
                role: "web".to_string(),
                common_name: "web.example.com".to_string(),
                ttl: Duration::from_secs(60),
                alt_names: Vec::new(),
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, IssuanceError::Transport(_)));
}

#[tokio::test]
async fn unwrap_reads_the_wrapped_secret_id() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/sys/wrapping/unwrap")
            .header("X-Vault-Token", "s.wrappingtoken0000000000");
        then.status(200)
            .json_body(json!({ "data": { "secret_id": "real-secret", "secret_id_accessor": "acc" } }));
    });

    let secret = client(&server, None)
        .unwrap("s.wrappingtoken0000000000")
        .await
        .unwrap();

    assert_eq!(secret, "real-secret");
    mock.assert();
}

#[tokio::test]
async fn missing_address_fails_without_network() {
    let client = VaultClient::new(&VaultConfig::default()).unwrap();

    let err = client.login("role", "secret").await.unwrap_err();

    assert!(matches!(err, IssuanceError::Login(_)));
}

//! End-to-end generation over an in-memory runtime and secret store

mod support;

use std::fs;

use pretty_assertions::assert_eq;
use support::{Harness, paths, seed_cert, snapshot};

#[tokio::test]
async fn existing_certificate_publishes_without_contacting_the_store() {
    // GIVEN: a container whose certificate pair is already on disk
    let dir = tempfile::tempdir().unwrap();
    seed_cert(dir.path(), "app.example.com");
    let harness = Harness::new(
        dir.path(),
        vec![snapshot("app", "10.0.0.7", &["SERVICE_FQDN=app.example.com"])],
    );

    // WHEN: one cycle runs
    let outcome = harness.regenerator.run_cycle(false).await.unwrap();

    // THEN: the host is published and the store was never asked
    assert!(outcome.rewritten);
    assert!(outcome.reloaded);
    assert_eq!(harness.store.calls(), 0);

    let conf = harness.conf();
    assert!(conf.contains("upstream app.example.com {"));
    assert!(conf.contains("server 10.0.0.7:8080 ;"));
    assert!(conf.contains("server_name app.example.com;"));
}

#[tokio::test]
async fn unchanged_configuration_does_not_reload() {
    let dir = tempfile::tempdir().unwrap();
    seed_cert(dir.path(), "app.example.com");
    let harness = Harness::new(
        dir.path(),
        vec![snapshot("app", "10.0.0.7", &["SERVICE_FQDN=app.example.com"])],
    );

    harness.regenerator.run_cycle(false).await.unwrap();
    let second = harness.regenerator.run_cycle(false).await.unwrap();

    assert!(!second.rewritten);
    assert!(!second.reloaded);
    assert_eq!(harness.reload.count(), 1);
}

#[tokio::test]
async fn forced_cycle_reloads_unchanged_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(dir.path(), Vec::new());

    harness.regenerator.run_cycle(false).await.unwrap();
    let forced = harness.regenerator.run_cycle(true).await.unwrap();

    assert!(!forced.rewritten);
    assert!(forced.reloaded);
    assert_eq!(harness.reload.count(), 2);
}

#[tokio::test]
async fn missing_certificate_is_issued_once_and_secret_burned() {
    // GIVEN: a container with credentials and no certificate
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(
        dir.path(),
        vec![snapshot(
            "app",
            "10.0.0.7",
            &[
                "SERVICE_FQDN=app.example.com",
                "OTHER_DNS_NAMES=www.example.com",
                "PKI_ROLE_ID=role-1",
                "PKI_SECRET_ID=secret-1",
            ],
        )],
    );

    // WHEN: the first cycle runs
    harness.regenerator.run_cycle(false).await.unwrap();

    // THEN: exactly one issuance with the expected request
    let issued = harness.store.issued.lock().unwrap().clone();
    assert_eq!(issued.len(), 1);
    assert_eq!(issued[0].common_name, "app.example.com");
    assert_eq!(issued[0].role, "app.example.com");
    assert!(issued[0].alt_names.contains(&"www.example.com".to_string()));
    assert!(issued[0].alt_names.contains(&"app".to_string()));
    assert!(!issued[0].alt_names.contains(&"app.example.com".to_string()));
    assert!(harness.conf().contains("upstream app.example.com {"));

    // WHEN: the pair disappears and the cycle runs again with the same secret
    let cert_dir = paths(dir.path()).cert_dir;
    fs::remove_file(cert_dir.join("app.example.com.crt")).unwrap();
    harness.regenerator.run_cycle(false).await.unwrap();

    // THEN: the burned secret is not presented again and the host is dropped
    assert_eq!(harness.store.logins.lock().unwrap().len(), 1);
    assert!(!harness.conf().contains("upstream app.example.com {"));
}

#[tokio::test]
async fn secret_shared_by_two_containers_is_used_once() {
    // GIVEN: two unrelated hosts presenting the same one-time secret
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(
        dir.path(),
        vec![
            snapshot(
                "app",
                "10.0.0.7",
                &["SERVICE_FQDN=app.example.com", "PKI_ROLE_ID=role-1", "PKI_SECRET_ID=shared"],
            ),
            snapshot(
                "api",
                "10.0.0.8",
                &["SERVICE_FQDN=api.example.com", "PKI_ROLE_ID=role-2", "PKI_SECRET_ID=shared"],
            ),
        ],
    );

    // WHEN: two cycles run
    harness.regenerator.run_cycle(false).await.unwrap();
    harness.regenerator.run_cycle(false).await.unwrap();

    // THEN: the secret reached the store once and only that host is live
    assert_eq!(harness.store.logins.lock().unwrap().len(), 1);
    assert_eq!(harness.store.issued.lock().unwrap().len(), 1);
    let conf = harness.conf();
    let live = ["app.example.com", "api.example.com"]
        .iter()
        .filter(|fqdn| conf.contains(&format!("upstream {fqdn} {{")))
        .count();
    assert_eq!(live, 1);
}

#[tokio::test]
async fn aliases_publish_alongside_the_base_host() {
    let dir = tempfile::tempdir().unwrap();
    seed_cert(dir.path(), "app.example.com");
    seed_cert(dir.path(), "api.example.com");
    let harness = Harness::new(
        dir.path(),
        vec![snapshot(
            "app",
            "10.0.0.7",
            &[
                "SERVICE_FQDN=app.example.com",
                "SECOND_SERVICE_FQDN=api.example.com",
                "THIRD_SERVICE_FQDN=admin.example.com",
            ],
        )],
    );

    let services = harness.regenerator.confgen().services().await.unwrap();

    // The third alias has no certificate and no credentials, so it is dropped.
    let fqdns: Vec<&str> = services.iter().map(|s| s.fqdn.as_str()).collect();
    assert_eq!(fqdns, vec!["api.example.com", "app.example.com"]);
}

#[tokio::test]
async fn containers_sharing_a_host_share_one_upstream() {
    let dir = tempfile::tempdir().unwrap();
    seed_cert(dir.path(), "app.example.com");
    let harness = Harness::new(
        dir.path(),
        vec![
            snapshot("app-1", "10.0.0.7", &["SERVICE_FQDN=app.example.com"]),
            snapshot("app-2", "10.0.0.8", &["SERVICE_FQDN=app.example.com"]),
            snapshot("sidecar", "10.0.0.9", &["NGINX_PROXY_IGNORE=1", "SERVICE_FQDN=app.example.com"]),
        ],
    );

    harness.regenerator.run_cycle(false).await.unwrap();

    let conf = harness.conf();
    assert_eq!(conf.matches("upstream app.example.com {").count(), 1);
    assert!(conf.contains("server 10.0.0.7:8080 ;"));
    assert!(conf.contains("server 10.0.0.8:8080 ;"));
    assert!(!conf.contains("10.0.0.9"));
}

#[tokio::test]
async fn stopped_container_disappears_on_next_cycle() {
    let dir = tempfile::tempdir().unwrap();
    seed_cert(dir.path(), "app.example.com");
    let harness = Harness::new(
        dir.path(),
        vec![snapshot("app", "10.0.0.7", &["SERVICE_FQDN=app.example.com"])],
    );
    harness.regenerator.run_cycle(false).await.unwrap();

    harness.runtime.set_containers(Vec::new());
    let outcome = harness.regenerator.run_cycle(false).await.unwrap();

    assert!(outcome.rewritten);
    assert!(!harness.conf().contains("app.example.com"));
    assert_eq!(harness.reload.count(), 2);
}

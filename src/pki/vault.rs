//! Vault AppRole + PKI client.

use std::fs;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{IssuanceError, IssueRequest, IssuedCertificate, SecretStore};
use crate::config::VaultConfig;
use crate::{Error, Result};

const TOKEN_HEADER: &str = "X-Vault-Token";

/// [`SecretStore`] speaking the Vault HTTP API
#[derive(Debug, Clone)]
pub struct VaultClient {
    http: Client,
    addr: Option<String>,
    pki: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    errors: Option<Vec<String>>,
    #[serde(default)]
    auth: Option<Auth>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Auth {
    client_token: String,
}

impl VaultClient {
    /// Build a client from the `vault` config section.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the CA bundle cannot be read or parsed.
    pub fn new(config: &VaultConfig) -> Result<Self> {
        let mut builder = Client::builder().timeout(config.timeout);

        if let Some(bundle) = &config.ca_bundle {
            let pem = fs::read(bundle).map_err(|e| {
                Error::Config(format!("Cannot read CA bundle '{}': {e}", bundle.display()))
            })?;
            let certs = reqwest::Certificate::from_pem_bundle(&pem)
                .map_err(|e| Error::Config(format!("Invalid CA bundle: {e}")))?;
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }

        let http = builder
            .build()
            .map_err(|e| Error::Config(format!("Cannot build Vault HTTP client: {e}")))?;

        Ok(Self {
            http,
            addr: config
                .addr
                .as_ref()
                .map(|a| a.trim_end_matches('/').to_string()),
            pki: config.pki.trim_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn url(&self, path: &str) -> std::result::Result<String, IssuanceError> {
        let addr = self
            .addr
            .as_ref()
            .ok_or_else(|| IssuanceError::Login("vault address is not configured".to_string()))?;
        Ok(format!("{addr}/v1/{path}"))
    }

    async fn post(
        &self,
        path: &str,
        token: Option<&str>,
        body: &Value,
    ) -> std::result::Result<Envelope, IssuanceError> {
        let url = self.url(path)?;
        debug!(%url, "vault request");

        let mut request = self.http.post(&url).json(body);
        if let Some(token) = token {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = request.send().await?;
        let status = response.status();
        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| IssuanceError::Transport(format!("{url} answered {status}: {e}")))?;

        match envelope.errors {
            Some(errors) if !errors.is_empty() => Err(IssuanceError::Authority(errors)),
            _ => Ok(envelope),
        }
    }
}

fn data_field(data: Option<&Value>, key: &str) -> Option<String> {
    data?.get(key)?.as_str().map(String::from)
}

#[async_trait]
impl SecretStore for VaultClient {
    async fn unwrap(&self, token: &str) -> std::result::Result<String, IssuanceError> {
        let envelope = self.post("sys/wrapping/unwrap", Some(token), &json!({})).await?;
        data_field(envelope.data.as_ref(), "secret_id").ok_or_else(|| {
            IssuanceError::Transport("unwrap response carried no secret_id".to_string())
        })
    }

    async fn login(&self, role_id: &str, secret_id: &str) -> std::result::Result<String, IssuanceError> {
        if let Some(token) = &self.token {
            return Ok(token.clone());
        }

        let envelope = self
            .post(
                "auth/approle/login",
                None,
                &json!({ "role_id": role_id, "secret_id": secret_id }),
            )
            .await
            .map_err(|err| match err {
                IssuanceError::Authority(errors) => IssuanceError::Login(errors.join("; ")),
                other => other,
            })?;

        envelope
            .auth
            .map(|auth| auth.client_token)
            .ok_or_else(|| IssuanceError::Login("response contains no auth object".to_string()))
    }

    async fn issue(
        &self,
        token: &str,
        request: &IssueRequest,
    ) -> std::result::Result<IssuedCertificate, IssuanceError> {
        let mut body = json!({
            "common_name": request.common_name,
            "ttl": request.ttl.as_secs().to_string(),
        });
        if !request.alt_names.is_empty() {
            body["alt_names"] = Value::String(request.alt_names.join(","));
        }

        let path = format!("{}/issue/{}", self.pki, request.role);
        let envelope = self.post(&path, Some(token), &body).await?;
        let data = envelope.data.as_ref();

        match (data_field(data, "certificate"), data_field(data, "private_key")) {
            (Some(certificate), Some(private_key)) => Ok(IssuedCertificate {
                certificate,
                private_key,
            }),
            _ => Err(IssuanceError::Transport(
                "issue response lacks certificate or private_key".to_string(),
            )),
        }
    }
}

//! Certificate provisioning.
//!
//! - [`SecretStore`]: the authority boundary (unwrap, login, issue)
//! - [`VaultClient`]: `reqwest`-backed [`SecretStore`] for Vault AppRole + PKI
//! - [`CertFiles`]: the `{name}.crt` / `{name}.key` pairs on disk
//! - [`CertificateManager`]: burn set, override map and the issuance flow

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod files;
pub mod lifecycle;
pub mod vault;

pub use files::CertFiles;
pub use lifecycle::{CertState, CertificateManager, ValidityPolicy, san_names, shorten};
pub use vault::VaultClient;

/// Length of a response-wrapping token; such secrets are unwrapped first
pub const WRAPPING_TOKEN_LEN: usize = 26;

/// One leaf certificate request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRequest {
    /// PKI role
    pub role: String,
    /// Certificate CN
    pub common_name: String,
    /// Requested validity
    pub ttl: Duration,
    /// SAN entries besides the CN
    pub alt_names: Vec<String>,
}

/// PEM material returned by the authority
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// Leaf certificate
    pub certificate: String,
    /// Private key
    pub private_key: String,
}

/// The certificate authority and its credential exchange
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Exchange a response-wrapping token for the secret id it wraps
    async fn unwrap(&self, token: &str) -> Result<String, IssuanceError>;

    /// Exchange an AppRole role id and one-time secret id for an access token
    async fn login(&self, role_id: &str, secret_id: &str) -> Result<String, IssuanceError>;

    /// Issue a leaf certificate
    async fn issue(&self, token: &str, request: &IssueRequest) -> Result<IssuedCertificate, IssuanceError>;
}

/// Why a certificate could not be provisioned for one identity
#[derive(Debug, Error)]
pub enum IssuanceError {
    /// No `PKI_ROLE_ID`
    #[error("missing role_id")]
    MissingRoleId,

    /// No `PKI_SECRET_ID` and no override
    #[error("missing secret_id")]
    MissingSecretId,

    /// The one-time secret was already consumed
    #[error("secret_id has been burned")]
    BurnedSecret,

    /// Secret file unreadable, not JSON, or without `secret_id`
    #[error("secret file {path}: {reason}")]
    SecretFile {
        /// File named by the secret
        path: String,
        /// What went wrong
        reason: String,
    },

    /// Login rejected or answered without a token
    #[error("login failed: {0}")]
    Login(String),

    /// Authority answered with an error list
    #[error("authority rejected request: {}", .0.join("; "))]
    Authority(Vec<String>),

    /// Request never got a usable answer
    #[error("transport error: {0}")]
    Transport(String),

    /// The CA expires too soon to issue anything
    #[error("no validity left before the CA expires")]
    ValidityExhausted,

    /// Certificate could not be written
    #[error("failed to persist certificate: {0}")]
    Persist(#[from] std::io::Error),
}

impl From<reqwest::Error> for IssuanceError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

//! Certificate lifecycle: fast path, burn-then-use issuance, validity.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{CertFiles, IssuanceError, IssueRequest, SecretStore, WRAPPING_TOKEN_LEN};
use crate::config::VaultConfig;
use crate::identity::Identity;

/// Where one identity's certificate stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertState {
    /// No pair on disk
    NoCertificate,
    /// Pair on disk
    CertificateValid,
    /// Credential burned, exchange in progress
    IssuancePending,
    /// Exchange or issuance failed
    IssuanceFailed,
}

impl fmt::Display for CertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoCertificate => "no_certificate",
            Self::CertificateValid => "certificate_valid",
            Self::IssuancePending => "issuance_pending",
            Self::IssuanceFailed => "issuance_failed",
        };
        f.write_str(s)
    }
}

/// Leaf validity bounded by the CA's own expiry
#[derive(Debug, Clone, Copy)]
pub struct ValidityPolicy {
    /// Upper bound on any request
    pub max_ttl: Duration,
    /// CA chain expiry, unix seconds
    pub ca_expire: Option<i64>,
    /// Kept between leaf and CA expiry
    pub ca_buffer: Duration,
}

impl ValidityPolicy {
    /// Policy from the `vault` config section
    #[must_use]
    pub fn from_config(config: &VaultConfig) -> Self {
        Self {
            max_ttl: config.max_ttl,
            ca_expire: config.ca_expire,
            ca_buffer: config.ca_buffer,
        }
    }

    /// TTL to request at unix time `now`, clamped to `[0, max_ttl]`.
    ///
    /// # Errors
    ///
    /// `ValidityExhausted` when the clamp lands on zero.
    pub fn ttl(&self, now: i64) -> Result<Duration, IssuanceError> {
        let max = self.max_ttl.as_secs();
        let secs = match self.ca_expire {
            None => max,
            Some(expire) => {
                let buffer = i64::try_from(self.ca_buffer.as_secs()).unwrap_or(i64::MAX);
                let remaining = expire.saturating_sub(now).saturating_sub(buffer);
                u64::try_from(remaining).unwrap_or(0).min(max)
            }
        };
        if secs == 0 {
            return Err(IssuanceError::ValidityExhausted);
        }
        Ok(Duration::from_secs(secs))
    }
}

/// Strip the matching trailing segments of `root` off `domain`.
///
/// Returns what is left, which is empty when `domain` is `root` itself.
#[must_use]
pub fn shorten(domain: &str, root: &str) -> String {
    let mut domain: Vec<&str> = domain.split('.').map(str::trim).collect();
    let mut root: Vec<&str> = root.split('.').map(str::trim).collect();

    while let (Some(d), Some(r)) = (domain.last(), root.last()) {
        if d != r {
            break;
        }
        domain.pop();
        root.pop();
    }
    domain.join(".")
}

fn under_root(name: &str, root: &str) -> bool {
    name == root || name.ends_with(&format!(".{root}"))
}

/// Names to request for `identity`: the fqdn, plus its other names and their
/// shortened forms when the identity opts in.
#[must_use]
pub fn san_names(identity: &Identity, known_roots: &[String]) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    let Some(fqdn) = identity.service_fqdn.as_ref() else {
        return names;
    };
    names.insert(fqdn.clone());

    if !identity.use_other_names {
        debug!(fqdn = %fqdn, "excluding short and other names");
        return names;
    }

    names.extend(identity.other_names.iter().cloned());
    let shortened: Vec<String> = names
        .iter()
        .flat_map(|name| {
            known_roots
                .iter()
                .filter(move |root| under_root(name, root))
                .map(move |root| shorten(name, root))
        })
        .filter(|short| !short.is_empty())
        .collect();
    names.extend(shortened);
    names
}

/// Issues certificates through a [`SecretStore`] and remembers which
/// one-time secrets it has consumed.
pub struct CertificateManager {
    store: Arc<dyn SecretStore>,
    files: CertFiles,
    validity: ValidityPolicy,
    burned: Mutex<HashSet<String>>,
    overrides: DashMap<String, String>,
}

impl CertificateManager {
    /// Create a manager with an empty burn set and no overrides
    pub fn new(store: Arc<dyn SecretStore>, files: CertFiles, validity: ValidityPolicy) -> Self {
        Self {
            store,
            files,
            validity,
            burned: Mutex::new(HashSet::new()),
            overrides: DashMap::new(),
        }
    }

    /// Certificate storage
    #[must_use]
    pub fn files(&self) -> &CertFiles {
        &self.files
    }

    /// Mark `secret` consumed. Returns `false` when it already was.
    pub fn burn(&self, secret: &str) -> bool {
        self.burned.lock().insert(secret.to_string())
    }

    /// Whether `secret` was already consumed
    #[must_use]
    pub fn is_burned(&self, secret: &str) -> bool {
        self.burned.lock().contains(secret)
    }

    /// Use `secret_id` instead of the identity's own for `fqdn`
    pub fn set_override(&self, fqdn: &str, secret_id: &str) {
        self.overrides.insert(fqdn.to_string(), secret_id.to_string());
    }

    /// Override for the identity's fqdn, else its own secret
    #[must_use]
    pub fn effective_secret(&self, identity: &Identity) -> Option<String> {
        identity
            .service_fqdn
            .as_ref()
            .and_then(|fqdn| self.overrides.get(fqdn).map(|s| s.value().clone()))
            .or_else(|| identity.secret_id.clone())
    }

    /// On-disk state of the identity's certificate pair
    #[must_use]
    pub fn state(&self, identity: &Identity) -> CertState {
        match identity.effective_cert_name() {
            Some(name) if self.files.exists(name) => CertState::CertificateValid,
            _ => CertState::NoCertificate,
        }
    }

    /// Make sure a pair exists for `identity`, issuing one when it does not
    /// or when `force` is set.
    ///
    /// # Errors
    ///
    /// Any [`IssuanceError`]. The remaining validity is checked before the
    /// secret is burned; once burned it stays burned whatever the outcome.
    pub async fn ensure(
        &self,
        identity: &Identity,
        san: &BTreeSet<String>,
        force: bool,
    ) -> Result<CertState, IssuanceError> {
        if !force && self.state(identity) == CertState::CertificateValid {
            return Ok(CertState::CertificateValid);
        }

        let role_id = identity.role_id.as_deref().ok_or(IssuanceError::MissingRoleId)?;
        let secret = self
            .effective_secret(identity)
            .ok_or(IssuanceError::MissingSecretId)?;
        let ttl = self.validity.ttl(Utc::now().timestamp())?;
        if !self.burn(&secret) {
            return Err(IssuanceError::BurnedSecret);
        }

        let fqdn = identity.service_fqdn.as_deref().unwrap_or_default();
        info!(
            container = %identity.name,
            fqdn = %fqdn,
            state = %CertState::IssuancePending,
            force,
            "issuing certificate"
        );

        match self.issue(identity, role_id, &secret, san, ttl).await {
            Ok(()) => {
                info!(fqdn = %fqdn, state = %CertState::CertificateValid, "certificate issued");
                Ok(CertState::CertificateValid)
            }
            Err(err) => {
                warn!(
                    container = %identity.name,
                    fqdn = %fqdn,
                    state = %CertState::IssuanceFailed,
                    error = %err,
                    "certificate issuance failed"
                );
                Err(err)
            }
        }
    }

    async fn issue(
        &self,
        identity: &Identity,
        role_id: &str,
        secret: &str,
        san: &BTreeSet<String>,
        ttl: Duration,
    ) -> Result<(), IssuanceError> {
        let fqdn = identity.service_fqdn.clone().unwrap_or_default();
        let cert_name = identity.effective_cert_name().unwrap_or(fqdn.as_str()).to_string();

        let secret = self.resolve_secret(secret).await?;
        let token = self.store.login(role_id, &secret).await?;

        let request = IssueRequest {
            role: identity.pki_role.clone().unwrap_or_else(|| fqdn.clone()),
            alt_names: san.iter().filter(|n| **n != fqdn).cloned().collect(),
            common_name: fqdn,
            ttl,
        };
        debug!(?request, "issue request");

        let issued = self.store.issue(&token, &request).await?;
        self.files.write(&cert_name, &issued)?;

        if !self.files.key_path(&cert_name).is_file() {
            return Err(IssuanceError::Persist(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "key file missing after write",
            )));
        }
        Ok(())
    }

    /// Turn a secret reference into the secret itself: a local JSON file
    /// holding `secret_id`, a wrapping token, or the raw value.
    ///
    /// # Errors
    ///
    /// `SecretFile` when a named file cannot be used.
    pub async fn resolve_secret(&self, secret: &str) -> Result<String, IssuanceError> {
        let path = Path::new(secret);
        if path.is_file() {
            return read_secret_file(path);
        }

        if secret.len() == WRAPPING_TOKEN_LEN {
            match self.store.unwrap(secret).await {
                Ok(unwrapped) => return Ok(unwrapped),
                Err(err) => warn!(error = %err, "unwrap failed, using secret as given"),
            }
        }
        Ok(secret.to_string())
    }
}

fn read_secret_file(path: &Path) -> Result<String, IssuanceError> {
    let file_error = |reason: String| IssuanceError::SecretFile {
        path: path.display().to_string(),
        reason,
    };

    let content = std::fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
    let payload: serde_json::Value =
        serde_json::from_str(&content).map_err(|e| file_error(format!("not JSON: {e}")))?;
    payload
        .get("secret_id")
        .and_then(serde_json::Value::as_str)
        .map(String::from)
        .ok_or_else(|| file_error("no secret_id".to_string()))
}

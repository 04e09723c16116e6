//! Three-stage admission of identities.
//!
//! structure → local auth artifacts → certificate. The first failing stage
//! rejects the identity; later stages never run for it.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::NamingConfig;
use crate::identity::{Identity, alias};
use crate::pki::{CertificateManager, IssuanceError, san_names};
use crate::runtime::ContainerSnapshot;

/// Stage an identity was rejected at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Hostname, port, address and ignore marker
    Structure,
    /// Auth files on the proxy's filesystem
    Artifacts,
    /// Certificate presence or issuance
    Certificate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (n, name) = match self {
            Self::Structure => (1, "cfg"),
            Self::Artifacts => (2, "auth"),
            Self::Certificate => (3, "cert"),
        };
        write!(f, "{name} ({n}/3)")
    }
}

/// Why an identity is not published
#[derive(Debug, Error)]
pub enum Rejection {
    /// `NGINX_PROXY_IGNORE` is set
    #[error("ignored by own config")]
    Ignored,
    /// No hostname could be derived
    #[error("lack of service_fqdn")]
    MissingFqdn,
    /// The container exposes nothing
    #[error("lack of exposures")]
    NoExposures,
    /// `VIRTUAL_PORT` unusable or no numeric exposure
    #[error("lack of definitive port exposure")]
    NoPort,
    /// No address on the container's network
    #[error("has no ip_address; is there a named network?")]
    NoAddress,
    /// htpasswd file configured but absent
    #[error("basic auth file not found on the proxy: {}", .0.display())]
    MissingAuthBasicFile(PathBuf),
    /// Client-cert bundle configured but absent
    #[error("client cert bundle not found on the proxy: {}", .0.display())]
    MissingAuthCertBundle(PathBuf),
    /// Certificate missing and could not be issued
    #[error("certificate: {0}")]
    Certificate(#[from] IssuanceError),
}

impl Rejection {
    /// Stage that produced this rejection
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::Ignored | Self::MissingFqdn | Self::NoExposures | Self::NoPort | Self::NoAddress => {
                Stage::Structure
            }
            Self::MissingAuthBasicFile(_) | Self::MissingAuthCertBundle(_) => Stage::Artifacts,
            Self::Certificate(_) => Stage::Certificate,
        }
    }
}

/// Runs the admission stages against one [`CertificateManager`]
pub struct Qualifier {
    certs: Arc<CertificateManager>,
    naming: NamingConfig,
}

impl Qualifier {
    /// Create a qualifier issuing through `certs`
    pub fn new(certs: Arc<CertificateManager>, naming: NamingConfig) -> Self {
        Self { certs, naming }
    }

    /// Certificate manager in use
    #[must_use]
    pub fn certs(&self) -> &Arc<CertificateManager> {
        &self.certs
    }

    /// Naming rules in use
    #[must_use]
    pub fn naming(&self) -> &NamingConfig {
        &self.naming
    }

    /// Run every stage for `identity`, logging the outcome.
    ///
    /// # Errors
    ///
    /// The first stage's [`Rejection`].
    pub async fn qualify(&self, identity: &Identity, force: bool) -> Result<(), Rejection> {
        let result = self.run_stages(identity, force).await;

        match &result {
            Ok(()) => info!(container = %identity.name, fqdn = ?identity.service_fqdn, "adding service"),
            Err(rejection @ Rejection::Certificate(_)) => warn!(
                container = %identity.name,
                stage = %rejection.stage(),
                reason = %rejection,
                "did not qualify"
            ),
            Err(rejection) => info!(
                container = %identity.name,
                stage = %rejection.stage(),
                reason = %rejection,
                "did not qualify"
            ),
        }
        result
    }

    async fn run_stages(&self, identity: &Identity, force: bool) -> Result<(), Rejection> {
        check_structure(identity)?;
        debug!(fqdn = ?identity.service_fqdn, stage = %Stage::Structure, "passes");
        check_artifacts(identity)?;
        debug!(fqdn = ?identity.service_fqdn, stage = %Stage::Artifacts, "passes");
        self.check_certificate(identity, force).await
    }

    async fn check_certificate(&self, identity: &Identity, force: bool) -> Result<(), Rejection> {
        let san = san_names(identity, &self.naming.known_roots);
        self.certs.ensure(identity, &san, force).await?;
        debug!(fqdn = ?identity.service_fqdn, stage = %Stage::Certificate, "passes");
        Ok(())
    }

    /// Base identity of `snapshot` plus its contiguous run of admitted aliases.
    ///
    /// Empty when the base itself is rejected.
    pub async fn admit(&self, snapshot: Arc<ContainerSnapshot>, force: bool) -> Vec<Identity> {
        let base = Identity::resolve(snapshot, &self.naming);
        self.admit_identity(base, force).await
    }

    /// [`Self::admit`] for an already resolved base identity
    pub async fn admit_identity(&self, base: Identity, force: bool) -> Vec<Identity> {
        if self.qualify(&base, force).await.is_err() {
            return Vec::new();
        }

        let mut aliases = Vec::new();
        for candidate in alias::candidates(&base, &self.naming) {
            let ns = candidate.alias;
            if self.qualify(&candidate, force).await.is_err() {
                debug!(container = %base.name, alias = ?ns, "alias invalid, done here");
                break;
            }
            debug!(container = %base.name, alias = ?ns, "alias is valid, adding");
            aliases.push(candidate);
        }

        let mut admitted = Vec::with_capacity(aliases.len() + 1);
        admitted.push(base);
        admitted.extend(aliases);
        admitted
    }
}

fn check_structure(identity: &Identity) -> Result<(), Rejection> {
    if identity.ignored {
        return Err(Rejection::Ignored);
    }
    if identity.service_fqdn.is_none() {
        return Err(Rejection::MissingFqdn);
    }
    if identity.exposures.is_empty() {
        return Err(Rejection::NoExposures);
    }
    if identity.exposed_port.is_none_or(|port| port == 0) {
        return Err(Rejection::NoPort);
    }
    if identity.ip_address.is_none() {
        return Err(Rejection::NoAddress);
    }
    if identity.proxy_pass {
        debug!(fqdn = ?identity.service_fqdn, "proxy_pass enabled");
    }
    Ok(())
}

fn check_artifacts(identity: &Identity) -> Result<(), Rejection> {
    if let Some(path) = &identity.auth_basic_file {
        if !path.is_file() {
            return Err(Rejection::MissingAuthBasicFile(path.clone()));
        }
    }
    if let Some(path) = &identity.auth_cert_bundle {
        if !path.is_file() {
            return Err(Rejection::MissingAuthCertBundle(path.clone()));
        }
    }
    Ok(())
}

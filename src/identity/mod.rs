//! Service identity resolution.
//!
//! An [`Identity`] is the typed view of one virtual host backed by one
//! container. Everything the pipeline reasons about is a field; anything
//! else is reachable through [`Identity::raw`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::config::NamingConfig;
use crate::runtime::ContainerSnapshot;

pub mod alias;

pub use alias::AliasNamespace;

/// Label carrying the image build date, preferred over the creation time
pub const BUILD_DATE_LABEL: &str = "org.label-schema.build-date";

/// Env marker excluding a container from publication
pub const IGNORE_MARKER: &str = "NGINX_PROXY_IGNORE";

/// Upstream tuning options read from `<prefix>.opt.<name>` labels
const UPSTREAM_OPTIONS: [&str; 4] = ["weight", "fail_timeout", "slow_start", "max_fails"];

/// Resolved description of one publishable virtual host
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    /// Container name
    pub name: String,
    /// Image reference
    pub image: Option<String>,
    /// Publish hostname
    pub service_fqdn: Option<String>,
    /// Upstream key; equals `service_fqdn` at resolution time
    pub upstream: Option<String>,
    /// Network mode the address was taken from
    pub network: Option<String>,
    /// Address the proxy forwards to
    pub ip_address: Option<String>,
    /// Declared exposed ports
    pub exposures: Vec<String>,
    /// `VIRTUAL_PORT`, else the first exposure
    pub exposed_port: Option<u16>,
    /// Additional DNS names, without `service_fqdn`
    pub other_names: BTreeSet<String>,
    /// Whether other and short names join the SAN set and `server_name`
    pub use_other_names: bool,
    /// Certificate file stem override
    pub cert_name: Option<String>,
    /// PKI role to issue under
    pub pki_role: Option<String>,
    /// AppRole role id
    #[serde(skip)]
    pub role_id: Option<String>,
    /// One-time AppRole secret id
    #[serde(skip)]
    pub secret_id: Option<String>,
    /// Claim the `default_server` slot
    pub default_server: bool,
    /// Serve plain HTTP instead of redirecting
    pub serve_http: bool,
    /// Forward TLS upstream
    pub proxy_pass: bool,
    /// Omit the generated `location /` block
    pub skip_root_location: bool,
    /// Render custom fragments as templates
    pub render_confs: bool,
    /// htpasswd file, resolved on the proxy's filesystem
    pub auth_basic_file: Option<PathBuf>,
    /// Client certificate CA bundle, resolved on the proxy's filesystem
    pub auth_cert_bundle: Option<PathBuf>,
    /// Group required by the auth layer
    pub required_group: Option<String>,
    /// `client_max_body_size`
    pub max_upload_size: Option<String>,
    /// Upstream server parameters (`weight=2 max_fails=3`, or `backup`)
    pub options: String,
    /// Container opted out via [`IGNORE_MARKER`]
    pub ignored: bool,
    /// Namespace this identity was resolved under; `None` for the base
    pub alias: Option<AliasNamespace>,
    #[serde(skip)]
    env: BTreeMap<String, String>,
    #[serde(skip)]
    snapshot: Arc<ContainerSnapshot>,
}

impl Identity {
    /// Resolve the base identity of `snapshot`
    #[must_use]
    pub fn resolve(snapshot: Arc<ContainerSnapshot>, naming: &NamingConfig) -> Self {
        let env = snapshot.env_map();
        Self::resolve_with_env(snapshot, env, naming, None)
    }

    /// Resolve `snapshot` against an explicit environment view.
    ///
    /// Labels always come from the snapshot; only env-derived fields follow
    /// `env`.
    #[must_use]
    pub fn resolve_with_env(
        snapshot: Arc<ContainerSnapshot>,
        env: BTreeMap<String, String>,
        naming: &NamingConfig,
        alias: Option<AliasNamespace>,
    ) -> Self {
        let get = |key: &str| env.get(key).filter(|v| !v.is_empty()).cloned();
        let option = |opt: &str| {
            snapshot
                .labels
                .get(&format!("{}.{opt}", naming.option_prefix))
                .filter(|v| !v.is_empty())
                .cloned()
                .or_else(|| get(&opt.to_uppercase()))
        };
        let flag = |opt: &str| option(opt).is_some_and(|v| truthy(&v));

        let service_fqdn = get("SERVICE_FQDN")
            .or_else(|| snapshot.domain_name.clone().filter(|d| !d.is_empty()))
            .or_else(|| get("VIRTUAL_HOST"))
            .or_else(|| get("SERVICE_NAME").map(|short| format!("{short}.{}", naming.local_domain)));

        let exposures = snapshot.exposures();
        let exposed_port: Option<u16> = match get("VIRTUAL_PORT") {
            Some(custom) => custom.trim().parse().ok(),
            None => exposures.first().and_then(|p| p.parse().ok()),
        };

        let mut other_names = get("OTHER_DNS_NAMES")
            .map(|names| split_names(&names))
            .unwrap_or_default();
        if let Some(fqdn) = &service_fqdn {
            other_names.remove(fqdn);
        }

        let options = UPSTREAM_OPTIONS
            .iter()
            .filter_map(|opt| {
                snapshot
                    .labels
                    .get(&format!("{}.opt.{opt}", naming.option_prefix))
                    .map(|value| format!("{opt}={value}"))
            })
            .collect::<Vec<_>>()
            .join(" ");

        let identity = Self {
            name: snapshot.name.clone(),
            image: snapshot.image.clone(),
            upstream: service_fqdn.clone(),
            pki_role: get("PKI_ROLE").or_else(|| service_fqdn.clone()),
            service_fqdn,
            network: snapshot.network_mode.clone(),
            ip_address: snapshot.ip_address().map(String::from),
            exposures,
            exposed_port,
            other_names,
            use_other_names: get("NGINX_USE_OTHER_NAMES").is_none_or(|v| truthy(&v)),
            cert_name: option("cert_name"),
            role_id: get("PKI_ROLE_ID"),
            secret_id: get("PKI_SECRET_ID"),
            default_server: flag("default_server"),
            serve_http: flag("serve_http"),
            proxy_pass: flag("proxy_pass"),
            skip_root_location: flag("skip_root_location"),
            render_confs: flag("render_confs"),
            auth_basic_file: option("auth_basic_file").map(PathBuf::from),
            auth_cert_bundle: option("auth_cert_bundle").map(PathBuf::from),
            required_group: option("required_group"),
            max_upload_size: option("max_upload_size"),
            options,
            ignored: env.contains_key(IGNORE_MARKER),
            alias,
            env,
            snapshot,
        };

        debug!(
            container = %identity.name,
            fqdn = ?identity.service_fqdn,
            ip = ?identity.ip_address,
            port = ?identity.exposed_port,
            alias = ?identity.alias,
            "resolved identity"
        );
        identity
    }

    /// Raw runtime attributes, for lookups the typed fields do not cover
    #[must_use]
    pub fn raw(&self) -> &ContainerSnapshot {
        &self.snapshot
    }

    pub(crate) fn snapshot_handle(&self) -> Arc<ContainerSnapshot> {
        Arc::clone(&self.snapshot)
    }

    /// Environment view this identity was resolved from
    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// File stem of the certificate pair: `cert_name`, else the fqdn
    #[must_use]
    pub fn effective_cert_name(&self) -> Option<&str> {
        self.cert_name.as_deref().or(self.service_fqdn.as_deref())
    }

    /// Build date label when present, else the container creation time
    #[must_use]
    pub fn freshness(&self) -> Option<DateTime<Utc>> {
        let raw = self
            .snapshot
            .labels
            .get(BUILD_DATE_LABEL)
            .filter(|v| !v.is_empty())
            .or(self.snapshot.created.as_ref())?;
        DateTime::parse_from_rfc3339(raw.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    }

    /// Container name with the host it publishes, for log lines
    #[must_use]
    pub fn display_name(&self) -> String {
        match (&self.service_fqdn, self.alias) {
            (Some(fqdn), Some(ns)) => format!("{} ({ns}: {fqdn})", self.name),
            (Some(fqdn), None) => format!("{} ({fqdn})", self.name),
            (None, _) => self.name.clone(),
        }
    }
}

/// `false` only for `0`, `no`, `false` and `n` (any case)
#[must_use]
pub fn truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_lowercase().as_str(),
        "0" | "no" | "false" | "n"
    )
}

#[allow(clippy::unwrap_used)]
static NAME_SEPARATORS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[,\s]+").unwrap());

/// Split a comma/space separated name list into a set
fn split_names(names: &str) -> BTreeSet<String> {
    NAME_SEPARATORS
        .split(names)
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(String::from)
        .collect()
}

//! Configuration management

use std::{env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Where configuration and certificates live
    pub paths: PathsConfig,
    /// Hostname derivation rules
    pub naming: NamingConfig,
    /// Vault PKI settings
    pub vault: VaultConfig,
    /// Runtime event watching
    pub watch: WatchConfig,
    /// HTTP control surface
    pub control: ControlConfig,
    /// Proxy reload signalling
    pub reload: ReloadConfig,
    /// Template rendering
    pub render: RenderConfig,
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Proxy configuration directory (also holds per-host custom fragments)
    pub conf_dir: PathBuf,
    /// Certificate directory (`{name}.crt` / `{name}.key`)
    pub cert_dir: PathBuf,
    /// Generated file name, relative to `conf_dir`
    pub conf_file: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            conf_dir: PathBuf::from("/etc/nginx/conf.d"),
            cert_dir: PathBuf::from("/etc/nginx/certs"),
            conf_file: "default.conf".to_string(),
        }
    }
}

impl PathsConfig {
    /// Full path of the generated configuration file
    #[must_use]
    pub fn conf_path(&self) -> PathBuf {
        self.conf_dir.join(&self.conf_file)
    }
}

/// Hostname derivation rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    /// Suffix appended to `SERVICE_NAME` when nothing better is available
    pub local_domain: String,
    /// Label namespace for per-container options (`<prefix>.cert_name`, ...)
    pub option_prefix: String,
    /// Root domains stripped to derive short SAN entries
    pub known_roots: Vec<String>,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            local_domain: "docker.local".to_string(),
            option_prefix: "openresty".to_string(),
            known_roots: Vec::new(),
        }
    }
}

/// Vault PKI settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Vault address, e.g. `https://vault.example.com:8200`
    pub addr: Option<String>,
    /// PKI secrets engine mount
    pub pki: String,
    /// Static token; skips the AppRole exchange when set
    pub token: Option<String>,
    /// Extra PEM bundle to trust when talking to Vault
    pub ca_bundle: Option<PathBuf>,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Expiry of the issuing CA chain (unix seconds)
    pub ca_expire: Option<i64>,
    /// Margin kept between leaf and CA expiry
    #[serde(with = "humantime_serde")]
    pub ca_buffer: Duration,
    /// Upper bound on requested leaf validity
    #[serde(with = "humantime_serde")]
    pub max_ttl: Duration,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            addr: None,
            pki: "pki".to_string(),
            token: None,
            ca_bundle: None,
            timeout: Duration::from_secs(30),
            ca_expire: None,
            ca_buffer: Duration::from_secs(3 * 3600),
            max_ttl: Duration::from_secs(15_552_000),
        }
    }
}

/// Runtime event watching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Quiet period between the first event of a burst and regeneration
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,
    /// Docker endpoint; `DOCKER_HOST` / default socket when unset
    pub docker_host: Option<String>,
    /// Wait before resubscribing after the event stream drops
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            docker_host: None,
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// HTTP control surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Serve the control endpoints
    pub enabled: bool,
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 44380,
        }
    }
}

/// Proxy reload signalling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    /// Substring of the master process command line to signal
    pub process_match: String,
    /// procfs mount used for the process scan
    pub proc_root: PathBuf,
    /// Run this argv instead of signalling, e.g. `["nginx", "-s", "reload"]`
    pub command: Option<Vec<String>>,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            process_match: "nginx: master".to_string(),
            proc_root: PathBuf::from("/proc"),
            command: None,
        }
    }
}

/// Template rendering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Template file replacing the built-in one
    pub template: Option<PathBuf>,
    /// nginx `error_log` level
    pub log_level: String,
    /// Virtual host traffic status module
    pub vts: VtsConfig,
    /// Graylog syslog shipping
    pub graylog: GraylogConfig,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            template: None,
            log_level: "warn".to_string(),
            vts: VtsConfig::default(),
            graylog: GraylogConfig::default(),
        }
    }
}

/// Virtual host traffic status options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VtsConfig {
    /// Emit the status zone and location
    pub enabled: bool,
    /// Location serving the status page
    pub path: Option<String>,
    /// Break traffic down by user agent
    pub user_agent: bool,
    /// Break traffic down by URI
    pub uris: bool,
}

/// Graylog syslog options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraylogConfig {
    /// Ship access and error logs
    pub enabled: bool,
    /// Graylog host
    pub domain: Option<String>,
    /// Access log input port
    pub access_port: u16,
    /// Error log input port
    pub error_port: u16,
}

impl Default for GraylogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            domain: None,
            access_port: 12301,
            error_port: 12302,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("VHOSTGEN_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.apply_legacy_env(|key| env::var(key).ok());
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Fill unset values from the variable names older deployments used.
    fn apply_legacy_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if self.vault.addr.is_none() {
            self.vault.addr = get("VAULT_ADDR");
        }
        if self.vault.token.is_none() {
            self.vault.token = get("VAULT_TOKEN");
        }
        if self.vault.ca_bundle.is_none() {
            self.vault.ca_bundle = get("REQUESTS_CA_BUNDLE").map(PathBuf::from);
        }
        if self.vault.ca_expire.is_none() {
            self.vault.ca_expire = get("CA_EXPIRE").and_then(|v| v.trim().parse().ok());
        }
        if let Some(pki) = get("VAULT_PKI") {
            if self.vault.pki == VaultConfig::default().pki {
                self.vault.pki = pki;
            }
        }
        if let Some(secs) = get("CA_BUFFER_TIME").and_then(|v| v.trim().parse::<u64>().ok()) {
            if self.vault.ca_buffer == VaultConfig::default().ca_buffer {
                self.vault.ca_buffer = Duration::from_secs(secs);
            }
        }
        if self.naming.known_roots.is_empty() {
            if let Some(roots) = get("KNOWN_ROOTS") {
                self.naming.known_roots = roots
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
            }
        }
        let defaults = NamingConfig::default();
        if self.naming.local_domain == defaults.local_domain {
            if let Some(domain) = get("LOCAL_DOMAIN") {
                self.naming.local_domain = domain;
            }
        }
        if self.naming.option_prefix == defaults.option_prefix {
            if let Some(prefix) = get("NGINX_OPTION_PREFIX") {
                self.naming.option_prefix = prefix;
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in Vault settings
    fn expand_env_vars(&mut self) {
        #[allow(clippy::unwrap_used)]
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();

        for value in [&mut self.vault.addr, &mut self.vault.token]
            .into_iter()
            .flatten()
        {
            *value = Self::expand_string(&re, value);
        }
        if let Some(bundle) = &mut self.vault.ca_bundle {
            *bundle = PathBuf::from(Self::expand_string(&re, &bundle.to_string_lossy()));
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Reject settings the sidecar cannot run with
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the offending key.
    pub fn validate(&self) -> Result<()> {
        if self.watch.debounce.is_zero() {
            return Err(Error::Config("watch.debounce must be greater than zero".into()));
        }
        if self.vault.max_ttl.is_zero() {
            return Err(Error::Config("vault.max_ttl must be greater than zero".into()));
        }
        if self.paths.conf_file.trim().is_empty() {
            return Err(Error::Config("paths.conf_file must not be empty".into()));
        }
        Ok(())
    }
}

/// Human-readable serde helpers for `Duration`
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize "100ms", "30s", "5m", "3h", "180d" or bare seconds
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse(&s).map_err(serde::de::Error::custom),
        }
    }

    /// Parse a duration string
    ///
    /// # Errors
    ///
    /// Returns the offending input when it is not a number with a known suffix.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let number = |n: &str| n.trim().parse::<u64>().map_err(|e| format!("invalid duration '{s}': {e}"));

        if let Some(ms) = s.strip_suffix("ms") {
            number(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            number(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            number(mins).map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            number(hours).map(|h| Duration::from_secs(h * 3600))
        } else if let Some(days) = s.strip_suffix('d') {
            number(days).map(|d| Duration::from_secs(d * 86_400))
        } else {
            number(s).map(Duration::from_secs)
        }
    }
}

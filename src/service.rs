//! Aggregation of admitted identities into per-hostname services.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::identity::Identity;

/// Default `client_max_body_size`
pub const DEFAULT_MAX_UPLOAD_SIZE: &str = "20M";

/// Upstream option marking a passive target
pub const BACKUP_OPTION: &str = "backup";

/// A fragment file placed under `conf_dir/<fqdn>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CustomConf {
    /// Where it was read from
    pub path: PathBuf,
    /// File contents
    pub content: String,
}

/// Every identity published under one hostname
#[derive(Debug, Clone, Serialize)]
pub struct Service {
    /// Publish hostname
    pub fqdn: String,
    /// Upstream block name
    pub upstream: String,
    /// Member identities, in admission order
    pub containers: Vec<Identity>,
    /// Claims `default_server`
    pub default_server: bool,
    /// Serve plain HTTP
    pub serve_http: bool,
    /// Forward TLS upstream
    pub proxy_pass: bool,
    /// Omit the generated `location /`
    pub skip_root_location: bool,
    /// Render custom fragments as templates
    pub render_confs: bool,
    /// htpasswd file
    pub auth_basic_file: Option<PathBuf>,
    /// Client certificate CA bundle
    pub auth_cert_bundle: Option<PathBuf>,
    /// Group required by the auth layer
    pub required_group: Option<String>,
    /// `client_max_body_size`
    pub max_upload_size: String,
    /// Fragments from `conf_dir/<fqdn>`, sorted by content
    pub custom_confs: Vec<CustomConf>,
}

impl Service {
    /// Empty service for `fqdn`
    #[must_use]
    pub fn new(fqdn: impl Into<String>, upstream: impl Into<String>) -> Self {
        Self {
            fqdn: fqdn.into(),
            upstream: upstream.into(),
            containers: Vec::new(),
            default_server: false,
            serve_http: false,
            proxy_pass: false,
            skip_root_location: false,
            render_confs: false,
            auth_basic_file: None,
            auth_cert_bundle: None,
            required_group: None,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE.to_string(),
            custom_confs: Vec::new(),
        }
    }

    /// Fold `identity` in: each of its set flags and non-empty values
    /// overwrites what earlier members contributed; unset ones leave it.
    pub fn add(&mut self, identity: Identity) {
        fn flag(slot: &mut bool, value: bool) {
            if value {
                *slot = true;
            }
        }

        flag(&mut self.default_server, identity.default_server);
        flag(&mut self.proxy_pass, identity.proxy_pass);
        flag(&mut self.skip_root_location, identity.skip_root_location);
        flag(&mut self.render_confs, identity.render_confs);
        flag(&mut self.serve_http, identity.serve_http);
        if identity.auth_basic_file.is_some() {
            self.auth_basic_file.clone_from(&identity.auth_basic_file);
        }
        if identity.auth_cert_bundle.is_some() {
            self.auth_cert_bundle.clone_from(&identity.auth_cert_bundle);
        }
        if identity.required_group.is_some() {
            self.required_group.clone_from(&identity.required_group);
        }
        if let Some(size) = &identity.max_upload_size {
            self.max_upload_size.clone_from(size);
        }

        self.containers.push(identity);
    }

    /// Keep the freshest member(s) active and mark every other one `backup`.
    pub fn mark_latest(&mut self) {
        let Some(latest) = self.containers.iter().map(Identity::freshness).max() else {
            return;
        };
        for container in &mut self.containers {
            if container.freshness() != latest {
                debug!(container = %container.name, fqdn = %self.fqdn, "marking as backup");
                container.options = BACKUP_OPTION.to_string();
            }
        }
    }

    /// `fqdn` first, then every opted-in member's other names
    #[must_use]
    pub fn server_names(&self) -> Vec<String> {
        let mut others: Vec<String> = self
            .containers
            .iter()
            .filter(|c| c.use_other_names)
            .flat_map(|c| c.other_names.iter().cloned())
            .filter(|n| *n != self.fqdn)
            .collect();
        others.sort();
        others.dedup();

        let mut names = vec![self.fqdn.clone()];
        names.extend(others);
        names
    }

    /// Certificate stem: the first member's `cert_name`, else the fqdn
    #[must_use]
    pub fn cert_name(&self) -> &str {
        self.containers
            .iter()
            .find_map(|c| c.cert_name.as_deref())
            .unwrap_or(self.fqdn.as_str())
    }
}

/// Group `identities` by fqdn, settle load-balancing roles and attach custom
/// fragments. Plain services sort before renamed upstreams, then by fqdn.
#[must_use]
pub fn aggregate(identities: Vec<Identity>, conf_dir: &Path) -> Vec<Service> {
    let mut services: BTreeMap<String, Service> = BTreeMap::new();
    for identity in identities {
        let Some(fqdn) = identity.service_fqdn.clone() else {
            continue;
        };
        let upstream = identity.upstream.clone().unwrap_or_else(|| fqdn.clone());
        services
            .entry(fqdn.clone())
            .or_insert_with(|| Service::new(fqdn, upstream))
            .add(identity);
    }

    let mut services: Vec<Service> = services
        .into_values()
        .map(|mut service| {
            service.mark_latest();
            service.custom_confs = list_custom_confs(conf_dir, &service.fqdn);
            service
        })
        .collect();
    services.sort_by(|a, b| {
        (a.fqdn != a.upstream, &a.fqdn).cmp(&(b.fqdn != b.upstream, &b.fqdn))
    });
    services
}

/// Every file under `conf_dir/<fqdn>`, sorted by content
#[must_use]
pub fn list_custom_confs(conf_dir: &Path, fqdn: &str) -> Vec<CustomConf> {
    let root = conf_dir.join(fqdn);
    if !root.is_dir() {
        return Vec::new();
    }

    let mut confs: Vec<CustomConf> = WalkDir::new(&root)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(err) => {
                warn!(fqdn = %fqdn, error = %err, "skipping unreadable custom conf entry");
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter_map(|path| match fs::read_to_string(&path) {
            Ok(content) => Some(CustomConf { path, content }),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable custom conf");
                None
            }
        })
        .collect();
    confs.sort_by(|a, b| a.content.cmp(&b.content));
    confs
}

/// Leave `default_server` on the first identity claiming it and clear it on
/// every later one.
pub fn demote_default_servers(identities: &mut [Identity]) {
    let mut claimed_by: Option<String> = None;
    for identity in identities.iter_mut().filter(|i| i.default_server) {
        match &claimed_by {
            Some(owner) => {
                warn!(
                    container = %identity.name,
                    owner = %owner,
                    "default_server status removed, already set"
                );
                identity.default_server = false;
            }
            None => claimed_by = Some(identity.name.clone()),
        }
    }
}

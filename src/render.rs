//! Proxy configuration rendering.

use std::fs;
use std::path::{Path, PathBuf};

use minijinja::{AutoEscape, Environment, context};
use serde::Serialize;
use tracing::warn;

use crate::config::RenderConfig;
use crate::service::Service;
use crate::{Error, Result};

const TEMPLATE_NAME: &str = "nginx.conf.j2";
const BUILTIN_TEMPLATE: &str = include_str!("../templates/nginx.conf.j2");
const INDENT: &str = "  ";

/// One `server` line of an upstream block
#[derive(Debug, Serialize)]
struct UpstreamContext<'a> {
    name: &'a str,
    address: &'a str,
    port: u16,
    options: &'a str,
}

/// What the template sees of a [`Service`]
#[derive(Debug, Serialize)]
struct ServiceContext<'a> {
    fqdn: &'a str,
    upstream: &'a str,
    server_names: String,
    cert_name: &'a str,
    default_server: bool,
    serve_http: bool,
    proxy_pass: bool,
    skip_root_location: bool,
    auth_basic_file: Option<String>,
    auth_cert_bundle: Option<String>,
    required_group: Option<&'a str>,
    max_upload_size: &'a str,
    custom_confs: Vec<String>,
    members: Vec<UpstreamContext<'a>>,
}

/// Renders services into the proxy configuration text
pub struct Renderer {
    env: Environment<'static>,
    options: RenderConfig,
    cert_dir: PathBuf,
}

impl Renderer {
    /// Compile the built-in template, or `options.template` when set.
    ///
    /// # Errors
    ///
    /// Returns an error if the override cannot be read or does not compile.
    pub fn new(options: &RenderConfig, cert_dir: &Path) -> Result<Self> {
        let source = match &options.template {
            Some(path) => fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("Cannot read template '{}': {e}", path.display()))
            })?,
            None => BUILTIN_TEMPLATE.to_string(),
        };

        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.set_keep_trailing_newline(true);
        env.add_template_owned(TEMPLATE_NAME, source)?;

        Ok(Self {
            env,
            options: options.clone(),
            cert_dir: cert_dir.to_path_buf(),
        })
    }

    /// Render and tidy the full configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Template` if the template fails. A custom fragment
    /// that fails is logged and left out.
    pub fn render(&self, services: &[Service]) -> Result<String> {
        let services = services
            .iter()
            .map(|s| self.service_context(s))
            .collect::<Result<Vec<_>>>()?;

        let template = self.env.get_template(TEMPLATE_NAME)?;
        let raw = template.render(context! {
            services => services,
            cert_dir => self.cert_dir.display().to_string(),
            log_level => &self.options.log_level,
            vts => &self.options.vts,
            graylog => &self.options.graylog,
        })?;

        Ok(tidy(&raw))
    }

    fn service_context<'a>(&self, service: &'a Service) -> Result<ServiceContext<'a>> {
        let custom_confs = if service.render_confs {
            service
                .custom_confs
                .iter()
                .filter_map(|conf| {
                    match self.env.render_str(&conf.content, context! { service => service }) {
                        Ok(rendered) => Some(rendered),
                        Err(err) => {
                            warn!(
                                fqdn = %service.fqdn,
                                path = %conf.path.display(),
                                error = %err,
                                "custom conf failed to render, skipped"
                            );
                            None
                        }
                    }
                })
                .collect()
        } else {
            service.custom_confs.iter().map(|c| c.content.clone()).collect()
        };

        let members = service
            .containers
            .iter()
            .filter_map(|c| {
                Some(UpstreamContext {
                    name: &c.name,
                    address: c.ip_address.as_deref()?,
                    port: c.exposed_port?,
                    options: &c.options,
                })
            })
            .collect();

        Ok(ServiceContext {
            fqdn: &service.fqdn,
            upstream: &service.upstream,
            server_names: service.server_names().join(" "),
            cert_name: service.cert_name(),
            default_server: service.default_server,
            serve_http: service.serve_http,
            proxy_pass: service.proxy_pass,
            skip_root_location: service.skip_root_location,
            auth_basic_file: service.auth_basic_file.as_ref().map(|p| p.display().to_string()),
            auth_cert_bundle: service.auth_cert_bundle.as_ref().map(|p| p.display().to_string()),
            required_group: service.required_group.as_deref(),
            max_upload_size: &service.max_upload_size,
            custom_confs,
            members,
        })
    }
}

/// Normalize layout: trim every line, drop blank ones, open a blank line
/// before each block start and end, and indent block bodies.
#[must_use]
pub fn tidy(contents: &str) -> String {
    let mut depth = 0usize;
    let mut lines: Vec<String> = Vec::new();

    for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line.ends_with('}') {
            lines.push(String::new());
            depth = depth.saturating_sub(1);
        }
        if line.ends_with('{') {
            lines.push(String::new());
        }

        lines.push(format!("{}{line}", INDENT.repeat(depth)));

        if line.ends_with('{') {
            depth += 1;
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

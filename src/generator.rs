//! One end-to-end generation: discover, qualify, aggregate, render, write.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::Result;
use crate::config::PathsConfig;
use crate::identity::Identity;
use crate::qualify::Qualifier;
use crate::render::Renderer;
use crate::runtime::DynContainerRuntime;
use crate::service::{Service, aggregate, demote_default_servers};

/// Produces the proxy configuration from the running containers
pub struct ConfGen {
    runtime: DynContainerRuntime,
    qualifier: Arc<Qualifier>,
    renderer: Renderer,
    conf_dir: PathBuf,
    conf_path: PathBuf,
}

impl ConfGen {
    /// Wire a generator writing to `paths.conf_path()`
    pub fn new(
        runtime: DynContainerRuntime,
        qualifier: Arc<Qualifier>,
        renderer: Renderer,
        paths: &PathsConfig,
    ) -> Self {
        Self {
            runtime,
            qualifier,
            renderer,
            conf_dir: paths.conf_dir.clone(),
            conf_path: paths.conf_path(),
        }
    }

    /// Qualifier used for every identity
    #[must_use]
    pub fn qualifier(&self) -> &Arc<Qualifier> {
        &self.qualifier
    }

    /// Generated file location
    #[must_use]
    pub fn conf_path(&self) -> &Path {
        &self.conf_path
    }

    /// Base identity of every running container, unqualified
    ///
    /// # Errors
    ///
    /// Returns `Error::Runtime` if the runtime cannot be listed.
    pub async fn base_identities(&self) -> Result<Vec<Identity>> {
        let naming = self.qualifier.naming();
        Ok(self
            .runtime
            .list_running()
            .await?
            .into_iter()
            .map(|snapshot| Identity::resolve(Arc::new(snapshot), naming))
            .collect())
    }

    /// Admitted services, ready to render
    ///
    /// # Errors
    ///
    /// Returns `Error::Runtime` if the runtime cannot be listed. Identities
    /// that fail qualification are skipped, never surfaced.
    pub async fn services(&self) -> Result<Vec<Service>> {
        let mut admitted = Vec::new();
        for identity in self.base_identities().await? {
            admitted.extend(self.qualifier.admit_identity(identity, false).await);
        }
        demote_default_servers(&mut admitted);
        Ok(aggregate(admitted, &self.conf_dir))
    }

    /// Render the configuration and write it if it differs from disk.
    ///
    /// Returns whether the file was rewritten.
    ///
    /// # Errors
    ///
    /// Runtime, template or IO failures.
    pub async fn generate(&self) -> Result<bool> {
        let services = self.services().await?;
        info!(services = services.len(), "generating configuration");

        let content = self.renderer.render(&services)?;
        let written = write_if_changed(&self.conf_path, &content)?;
        if written {
            info!(path = %self.conf_path.display(), "configuration rewritten");
        } else {
            debug!(path = %self.conf_path.display(), "configuration unchanged");
        }
        Ok(written)
    }
}

/// Write `content` to `path` unless the file already holds exactly that.
///
/// # Errors
///
/// Returns the IO error if the file cannot be read or written.
pub fn write_if_changed(path: &Path, content: &str) -> Result<bool> {
    match fs::read_to_string(path) {
        Ok(previous) if previous == content => return Ok(false),
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(true)
}

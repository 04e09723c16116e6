//! Container runtime boundary.
//!
//! The rest of the crate only sees [`ContainerSnapshot`]s and
//! [`RuntimeEvent`]s; how they are obtained is the adapter's business.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

pub mod docker;
pub mod memory;

pub use docker::DockerRuntime;
pub use memory::StaticRuntime;

/// Shared handle to a runtime adapter
pub type DynContainerRuntime = Arc<dyn ContainerRuntime>;

/// Lifecycle statuses that warrant a regeneration
pub const LIFECYCLE_STATUSES: [&str; 4] = ["start", "stop", "kill", "die"];

/// Raw attributes of one running container, as reported by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSnapshot {
    /// Runtime id
    pub id: String,
    /// Container name without the leading `/`
    pub name: String,
    /// Image reference from the container config
    pub image: Option<String>,
    /// Environment as `KEY=value` pairs
    pub env: Vec<String>,
    /// Container labels
    pub labels: BTreeMap<String, String>,
    /// Exposed ports as reported, e.g. `8080/tcp`
    pub exposed_ports: Vec<String>,
    /// `Config.Domainname`
    pub domain_name: Option<String>,
    /// `HostConfig.NetworkMode`
    pub network_mode: Option<String>,
    /// `NetworkSettings.IPAddress`, used in `default` network mode
    pub default_ip: Option<String>,
    /// Address per attached network
    pub network_ips: BTreeMap<String, String>,
    /// Creation timestamp (RFC 3339)
    pub created: Option<String>,
}

impl ContainerSnapshot {
    /// Environment as a map; later duplicates win, entries without `=` are
    /// dropped.
    #[must_use]
    pub fn env_map(&self) -> BTreeMap<String, String> {
        self.env
            .iter()
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Exposed port numbers with the protocol suffix stripped, ordered by
    /// the raw `port/proto` key the way the engine lists them.
    #[must_use]
    pub fn exposures(&self) -> Vec<String> {
        let mut keys: Vec<&str> = self.exposed_ports.iter().map(String::as_str).collect();
        keys.sort_unstable();

        let mut ports: Vec<String> = Vec::with_capacity(keys.len());
        for key in keys {
            let port = key.split('/').next().unwrap_or(key);
            if !port.is_empty() && !ports.iter().any(|p| p == port) {
                ports.push(port.to_string());
            }
        }
        ports
    }

    /// Address on the container's own network.
    ///
    /// `default` mode uses the flat address, any other mode looks the
    /// network up by name.
    #[must_use]
    pub fn ip_address(&self) -> Option<&str> {
        match self.network_mode.as_deref() {
            Some("default") => self.default_ip.as_deref(),
            Some(network) => self.network_ips.get(network).map(String::as_str),
            None => None,
        }
        .filter(|ip| !ip.is_empty())
    }
}

/// One lifecycle notification from the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    /// Event status / action (`start`, `die`, ...)
    pub status: String,
    /// Container id, when reported
    pub id: Option<String>,
    /// Container name, when reported
    pub name: Option<String>,
}

impl RuntimeEvent {
    /// `true` for statuses that change the set of running containers
    #[must_use]
    pub fn is_lifecycle(&self) -> bool {
        LIFECYCLE_STATUSES.contains(&self.status.as_str())
    }
}

/// Source of container snapshots and lifecycle events
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Snapshot every running container
    async fn list_running(&self) -> Result<Vec<ContainerSnapshot>, RuntimeError>;

    /// Subscribe to container lifecycle events; the stream ends or errors
    /// when the connection drops.
    fn events(&self) -> BoxStream<'static, Result<RuntimeEvent, RuntimeError>>;
}

/// Runtime adapter failures
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Could not reach the runtime
    #[error("failed to connect to runtime ({context}): {source}")]
    Connection {
        /// Operation that failed
        context: &'static str,
        /// Underlying error
        #[source]
        source: anyhow::Error,
    },
    /// Listing containers failed
    #[error("failed to list containers: {0}")]
    ListContainers(#[source] anyhow::Error),
    /// Inspecting one container failed
    #[error("failed to inspect container {id}: {source}")]
    InspectContainer {
        /// Container id
        id: String,
        /// Underlying error
        #[source]
        source: anyhow::Error,
    },
    /// Event stream broke
    #[error("event stream failed: {0}")]
    Events(#[source] anyhow::Error),
}

//! Docker Engine adapter.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::{
    API_DEFAULT_VERSION, Docker,
    models::{ContainerInspectResponse, EventMessage},
    query_parameters::{EventsOptions, InspectContainerOptions, ListContainersOptions},
};
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::debug;

use super::{ContainerRuntime, ContainerSnapshot, RuntimeError, RuntimeEvent};

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Docker Engine adapter backed by `bollard`
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to `host` (`unix://`, plain socket path, `tcp://` or
    /// `http://`), or to whatever `DOCKER_HOST` / the default socket points
    /// at when `host` is `None`.
    pub fn connect(host: Option<&str>) -> Result<Self, RuntimeError> {
        let docker = match host {
            None => Docker::connect_with_defaults(),
            Some(h) if h.starts_with("tcp://") || h.starts_with("http://") => {
                Docker::connect_with_http(h, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Some(h) => Docker::connect_with_socket(
                h.trim_start_matches("unix://"),
                CONNECT_TIMEOUT_SECS,
                API_DEFAULT_VERSION,
            ),
        }
        .map_err(|err| RuntimeError::Connection {
            context: "connect",
            source: err.into(),
        })?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_running(&self) -> Result<Vec<ContainerSnapshot>, RuntimeError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(|err| RuntimeError::ListContainers(err.into()))?;

        let mut snapshots = Vec::with_capacity(containers.len());
        for id in containers.iter().filter_map(|c| c.id.as_ref()) {
            match self
                .docker
                .inspect_container(id, None::<InspectContainerOptions>)
                .await
            {
                Ok(details) => snapshots.push(snapshot_from_inspect(id, details)),
                // Gone between list and inspect.
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => {
                    debug!(container = %id, "container vanished before inspect");
                }
                Err(err) => {
                    return Err(RuntimeError::InspectContainer {
                        id: id.clone(),
                        source: err.into(),
                    });
                }
            }
        }

        Ok(snapshots)
    }

    fn events(&self) -> BoxStream<'static, Result<RuntimeEvent, RuntimeError>> {
        let docker = self.docker.clone();
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);

        let stream = async_stream::stream! {
            let mut events = docker.events(Some(EventsOptions {
                filters: Some(filters),
                ..Default::default()
            }));
            while let Some(item) = events.next().await {
                yield item
                    .map(event_from_message)
                    .map_err(|err| RuntimeError::Events(err.into()));
            }
        };
        stream.boxed()
    }
}

fn event_from_message(message: EventMessage) -> RuntimeEvent {
    let actor = message.actor.unwrap_or_default();
    let name = actor
        .attributes
        .as_ref()
        .and_then(|attrs| attrs.get("name"))
        .cloned();
    RuntimeEvent {
        status: message.action.unwrap_or_default(),
        id: actor.id,
        name,
    }
}

fn snapshot_from_inspect(id: &str, details: ContainerInspectResponse) -> ContainerSnapshot {
    let config = details.config.unwrap_or_default();
    let settings = details.network_settings.unwrap_or_default();

    let network_ips = settings
        .networks
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(network, endpoint)| endpoint.ip_address.map(|ip| (network, ip)))
        .collect();

    ContainerSnapshot {
        id: details.id.unwrap_or_else(|| id.to_string()),
        name: details
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        image: config.image,
        env: config.env.unwrap_or_default(),
        labels: config.labels.unwrap_or_default().into_iter().collect(),
        exposed_ports: config
            .exposed_ports
            .map(|ports| {
                let mut keys: Vec<String> = ports.into_keys().collect();
                keys.sort();
                keys
            })
            .unwrap_or_default(),
        domain_name: config.domainname.filter(|d| !d.is_empty()),
        network_mode: details.host_config.and_then(|h| h.network_mode),
        default_ip: settings.ip_address,
        network_ips,
        created: details.created,
    }
}

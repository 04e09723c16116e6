//! In-memory runtime used by tests and dry runs.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::{ContainerRuntime, ContainerSnapshot, RuntimeError, RuntimeEvent};

/// Runtime whose containers and events are supplied by the caller
pub struct StaticRuntime {
    containers: RwLock<Vec<ContainerSnapshot>>,
    events: broadcast::Sender<RuntimeEvent>,
}

impl StaticRuntime {
    /// Create a runtime reporting `containers` as running
    #[must_use]
    pub fn new(containers: Vec<ContainerSnapshot>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            containers: RwLock::new(containers),
            events,
        }
    }

    /// Replace the running set
    pub fn set_containers(&self, containers: Vec<ContainerSnapshot>) {
        *self.containers.write() = containers;
    }

    /// Publish an event to current subscribers; returns how many received it
    pub fn emit(&self, event: RuntimeEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }
}

#[async_trait]
impl ContainerRuntime for StaticRuntime {
    async fn list_running(&self) -> Result<Vec<ContainerSnapshot>, RuntimeError> {
        Ok(self.containers.read().clone())
    }

    fn events(&self) -> BoxStream<'static, Result<RuntimeEvent, RuntimeError>> {
        let mut rx = self.events.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield Ok(event),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        stream.boxed()
    }
}

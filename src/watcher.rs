//! Event-driven regeneration.
//!
//! Runtime events feed a [`Debouncer`], which drives a single
//! [`Regenerator`]. Every cycle, whether from the debouncer or the control
//! surface, runs under the regenerator's cycle lock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::generator::ConfGen;
use crate::identity::Identity;
use crate::reload::ReloadSignal;
use crate::runtime::DynContainerRuntime;

/// What one cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleOutcome {
    /// The configuration file was written
    pub rewritten: bool,
    /// The proxy was told to reload
    pub reloaded: bool,
}

/// Result of a forced certificate refresh for one identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecertifyOutcome {
    /// Identities (base plus aliases) admitted with forced issuance
    pub admitted: usize,
    /// The follow-up cycle
    pub cycle: CycleOutcome,
}

/// Target of debounced regeneration
#[async_trait]
pub trait Regenerate: Send + Sync {
    /// Run one regeneration cycle.
    ///
    /// # Errors
    ///
    /// Whatever the cycle failed with.
    async fn regenerate(&self) -> Result<CycleOutcome>;
}

/// Owns the generator, the reload signal and the cycle lock
pub struct Regenerator {
    confgen: ConfGen,
    reload: Box<dyn ReloadSignal>,
    cycle: AsyncMutex<()>,
}

impl Regenerator {
    /// Create a regenerator
    pub fn new(confgen: ConfGen, reload: Box<dyn ReloadSignal>) -> Self {
        Self {
            confgen,
            reload,
            cycle: AsyncMutex::new(()),
        }
    }

    /// Generator in use
    #[must_use]
    pub fn confgen(&self) -> &ConfGen {
        &self.confgen
    }

    /// Generate, and reload when the file changed or `force` is set.
    ///
    /// # Errors
    ///
    /// `Error::Reload` when the file is valid but the proxy could not be
    /// told; any other error means generation itself failed.
    pub async fn run_cycle(&self, force: bool) -> Result<CycleOutcome> {
        let _guard = self.cycle.lock().await;
        self.cycle_locked(force).await
    }

    async fn cycle_locked(&self, force: bool) -> Result<CycleOutcome> {
        let rewritten = self.confgen.generate().await?;
        let mut outcome = CycleOutcome {
            rewritten,
            reloaded: false,
        };

        if rewritten || force {
            info!(rewritten, force, "cycling frontend");
            self.reload.reload().await?;
            outcome.reloaded = true;
        }
        Ok(outcome)
    }

    /// Install `secret_id` for the identity's hostname, re-qualify it with
    /// forced issuance, then run a cycle that reloads if anything was
    /// admitted. All of it happens under the cycle lock, so no other cycle
    /// can consume the pushed secret first.
    ///
    /// # Errors
    ///
    /// As [`Self::run_cycle`].
    pub async fn recertify(
        &self,
        identity: Identity,
        secret_id: &str,
    ) -> Result<RecertifyOutcome> {
        let _guard = self.cycle.lock().await;

        if let Some(fqdn) = identity.service_fqdn.as_deref() {
            self.confgen.qualifier().certs().set_override(fqdn, secret_id);
        }
        let admitted = self
            .confgen
            .qualifier()
            .admit_identity(identity, true)
            .await
            .len();
        let cycle = self.cycle_locked(admitted > 0).await?;
        Ok(RecertifyOutcome { admitted, cycle })
    }
}

#[async_trait]
impl Regenerate for Regenerator {
    async fn regenerate(&self) -> Result<CycleOutcome> {
        self.run_cycle(false).await
    }
}

/// Where the debouncer is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    /// Waiting for a trigger
    Idle,
    /// Timer armed; further triggers are absorbed
    Pending,
    /// Cycle running; triggers queue the next debounce
    Regenerating,
}

/// Coalesces triggers into one regeneration per quiet window
#[derive(Clone)]
pub struct Debouncer {
    tx: mpsc::Sender<()>,
    state: Arc<Mutex<DebounceState>>,
}

impl Debouncer {
    /// Start the worker task.
    ///
    /// The timer is armed by the first trigger after `Idle` and is never
    /// pushed back by later ones.
    pub fn spawn(
        target: Arc<dyn Regenerate>,
        delay: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let state = Arc::new(Mutex::new(DebounceState::Idle));
        let worker_state = Arc::clone(&state);

        let handle = tokio::spawn(async move {
            let mut deadline: Option<Instant> = None;

            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        if msg.is_none() {
                            debug!("debouncer channel closed");
                            break;
                        }
                        if deadline.is_none() {
                            debug!(?delay, "timer start");
                            deadline = Some(Instant::now() + delay);
                            *worker_state.lock() = DebounceState::Pending;
                        }
                    }
                    () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        deadline = None;
                        *worker_state.lock() = DebounceState::Regenerating;
                        match target.regenerate().await {
                            Ok(outcome) => info!(
                                rewritten = outcome.rewritten,
                                reloaded = outcome.reloaded,
                                "regeneration finished"
                            ),
                            Err(e) if e.is_reload() => {
                                error!(error = %e, "configuration written but reload failed");
                            }
                            Err(e) => error!(error = %e, "regeneration failed"),
                        }
                        *worker_state.lock() = DebounceState::Idle;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Debouncer shutting down");
                        break;
                    }
                }
            }
        });

        (Self { tx, state }, handle)
    }

    /// Request a regeneration; never blocks.
    pub fn trigger(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
            Err(mpsc::error::TrySendError::Closed(())) => warn!("debouncer is gone"),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> DebounceState {
        *self.state.lock()
    }
}

/// Turns runtime events into debouncer triggers
pub struct Watcher {
    runtime: DynContainerRuntime,
    debouncer: Debouncer,
    reconnect_delay: Duration,
}

impl Watcher {
    /// Create a watcher
    pub fn new(runtime: DynContainerRuntime, debouncer: Debouncer, reconnect_delay: Duration) -> Self {
        Self {
            runtime,
            debouncer,
            reconnect_delay,
        }
    }

    /// Consume events until shutdown. Each (re)subscription is followed by a
    /// trigger, since events may have been missed meanwhile.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            self.debouncer.trigger();
            let mut events = self.runtime.events();

            loop {
                tokio::select! {
                    item = events.next() => match item {
                        Some(Ok(event)) => {
                            debug!(status = %event.status, name = ?event.name, "runtime event");
                            if event.is_lifecycle() {
                                self.debouncer.trigger();
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "event stream failed");
                            break;
                        }
                        None => {
                            warn!("event stream ended");
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        info!("Watcher shutting down");
                        return;
                    }
                }
            }

            tokio::select! {
                () = tokio::time::sleep(self.reconnect_delay) => {
                    info!(delay = ?self.reconnect_delay, "resubscribing to runtime events");
                }
                _ = shutdown_rx.recv() => return,
            }
        }
    }
}

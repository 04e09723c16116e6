//! vhostgen Library
//!
//! Reverse-proxy sidecar that derives nginx virtual hosts from running
//! containers and keeps their TLS certificates issued from Vault PKI.
//!
//! # Features
//!
//! - **Discovery**: Docker containers become identities, plus up to five alias
//!   namespaces (`SECOND_` .. `SIXTH_`) per container
//! - **Qualification**: structural, artifact and certificate stages; failures
//!   drop one identity, never the cycle
//! - **Certificates**: AppRole login with one-time secret ids, burned before use
//! - **Regeneration**: debounced, written only on change, reload only on write
//! - **Control surface**: `/ping` and `/cert` for pushed secret ids

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod control;
pub mod error;
pub mod generator;
pub mod identity;
pub mod pki;
pub mod qualify;
pub mod reload;
pub mod render;
pub mod runtime;
pub mod service;
pub mod watcher;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer().with_target(false))
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}

//! Error types for vhostgen

use std::io;

use thiserror::Error;

use crate::runtime::RuntimeError;

/// Result type alias for vhostgen
pub type Result<T> = std::result::Result<T, Error>;

/// vhostgen errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Container runtime unreachable or returned garbage
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Configuration was rewritten but the proxy could not be told to reload
    #[error("Reload error: {0}")]
    Reload(String),

    /// Template compilation or rendering failed
    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// `true` when the cycle produced a valid configuration and only the
    /// reload signal failed.
    #[must_use]
    pub fn is_reload(&self) -> bool {
        matches!(self, Self::Reload(_))
    }
}

//! # Relay Errors
//!
//! Failures that cross a unit boundary. Framing problems never show up here:
//! the parser recovers from them on its own and reports them as events.

use std::io;

use thiserror::Error;

use crate::configs::ConfigError;

/// Error type of the relay engine.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Socket level failure; the unit that hit it reconnects or closes.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A bounded wait expired.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// A listening socket could not be opened.
    #[error("failed to bind {what} port {port}: {source}")]
    Bind {
        /// Which listener (station, downstream, control).
        what: &'static str,
        /// Requested port.
        port: u16,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Invalid service definition. Never retried.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// `send:` was issued while no station link is active.
    #[error("no active station connection")]
    NoActiveStation,

    /// The service actor is gone.
    #[error("service '{0}' is not running")]
    ServiceGone(String),
}

impl RelayError {
    /// Whether restarting the failed unit could help.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RelayError::Config(_))
    }
}

//! Error types for torbridge.
//!
//! Every component returns [`Error`]; the orchestrator converts it into the
//! `Error(message)` service state and the structured responses of the public
//! contract, so these messages end up in front of callers.

use std::time::Duration;
use thiserror::Error;

/// Core error type for torbridge operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The daemon could not be spawned or exited during startup.
    #[error("launch failed: {0}")]
    Launch(String),

    /// The daemon did not become ready or bootstrap before the deadline.
    #[error("tor did not finish starting within {0:?}")]
    LaunchTimeout(Duration),

    /// The daemon could not be stopped.
    #[error("shutdown failed: {0}")]
    Shutdown(String),

    /// The control port rejected our credentials, or a command was issued
    /// before authenticating.
    #[error("control port authentication failed: {0}")]
    Auth(String),

    /// Non-2xx or malformed control port reply.
    /// Malformed lines carry `code == -1`.
    #[error("control protocol error {code}: {message}")]
    Protocol {
        /// Status code of the reply, `-1` for malformed lines.
        code: i32,
        /// Reply text.
        message: String,
    },

    /// ADD_ONION succeeded at the protocol level but the result is unusable.
    #[error("onion service creation failed: {0}")]
    OnionCreate(String),

    /// Key material failed validation.
    #[error("invalid key material: {0}")]
    Validation(String),

    /// Unknown onion service.
    #[error("hidden service not found: {0}")]
    NotFound(String),

    /// Network failure while tunnelling an HTTP request.
    #[error("request failed: {0}")]
    Request(String),

    /// Operation timed out.
    #[error("timeout")]
    Timeout,

    /// The daemon is not in the `Running` state.
    #[error("tor not running")]
    NotRunning,

    /// Local I/O failure (data directory, sockets).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using torbridge's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Malformed control reply, as opposed to a well-formed error reply.
    pub(crate) fn malformed() -> Self {
        Error::Protocol {
            code: -1,
            message: "malformed reply".into(),
        }
    }

    /// Whether the control connection is still usable after this error.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Timeout) || matches!(self, Error::Protocol { code: -1, .. })
    }
}

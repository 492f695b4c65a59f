//! Top-level error taxonomy used at process boundaries (CLI exit codes, MCP error mapping).

use thiserror::Error;

/// Coarse error kind the CLI maps to an exit code.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no backends reachable")]
    NoBackendsReachable,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GatewayError {
    /// Process exit code per the CLI contract: 0 success, 1 generic, 2 config, 3 no-backends.
    pub fn exit_code(&self) -> i32 {
        match self {
            GatewayError::Configuration(_) => 2,
            GatewayError::NoBackendsReachable => 3,
            GatewayError::Other(_) => 1,
        }
    }
}

/// Error surfaced to an MCP client, stripped of anything sensitive.
/// Internal detail (file paths, backend exception `repr`, stack traces) stays in the log.
#[derive(Debug, Error, Clone)]
pub enum RequestError {
    #[error("capability '{0}' does not exist")]
    CapabilityNotFound(String),

    #[error("backend '{0}' is unavailable")]
    BackendUnavailable(String),

    #[error("backend '{0}' is disconnected")]
    BackendDisconnected(String),

    #[error("backend '{backend}' call failed: {reason}")]
    BackendCall { backend: String, reason: String },

    #[error("backend '{0}' returned an invalid response")]
    InvalidBackendResponse(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("internal gateway error")]
    Internal,
}

impl RequestError {
    /// Stable error code surfaced alongside the sanitized message.
    pub fn code(&self) -> &'static str {
        match self {
            RequestError::CapabilityNotFound(_) => "capability_not_found",
            RequestError::BackendUnavailable(_) => "backend_unavailable",
            RequestError::BackendDisconnected(_) => "backend_disconnected",
            RequestError::BackendCall { .. } => "backend_call_failed",
            RequestError::InvalidBackendResponse(_) => "invalid_backend_response",
            RequestError::Unauthorized(_) => "unauthorized",
            RequestError::Forbidden(_) => "forbidden",
            RequestError::Internal => "internal",
        }
    }
}

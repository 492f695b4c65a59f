use thiserror::Error;

use super::BackendState;

/// Errors raised while connecting to or calling a backend MCP server.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend '{backend}' is not available (state: {state:?})")]
    Unavailable {
        backend: String,
        state: BackendState,
    },

    #[error("backend '{backend}' not found")]
    NotFound { backend: String },

    #[error("backend '{backend}' call to '{capability}' failed: {reason}")]
    Call {
        backend: String,
        capability: String,
        reason: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackendError {
    pub fn is_stopped_backend(&self) -> bool {
        matches!(
            self,
            BackendError::Unavailable {
                state: BackendState::Stopped,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_stopped_backend_detects_stopped_state() {
        let stopped = BackendError::Unavailable {
            backend: "test".to_string(),
            state: BackendState::Stopped,
        };
        assert!(stopped.is_stopped_backend());

        let unhealthy = BackendError::Unavailable {
            backend: "test".to_string(),
            state: BackendState::Unhealthy,
        };
        assert!(!unhealthy.is_stopped_backend());
    }

    #[test]
    fn error_messages_name_the_backend() {
        let err = BackendError::NotFound {
            backend: "test-backend".to_string(),
        };
        assert!(err.to_string().contains("test-backend"));
    }
}

use crate::resilience::breaker::CircuitState;

/// Failure taxonomy for the session manager.
///
/// Callers branch on the class: `Validation` and `Auth` are caller-fixable
/// and never retried, `Network`/`Timeout` are retried per policy,
/// `CircuitOpen` fails fast so a degraded backend can be surfaced as such.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("circuit open for '{operation}'")]
    CircuitOpen { operation: String },

    #[error("stream protocol violated: {0}")]
    Protocol(String),

    #[error("server reported stream failure: {0}")]
    Server(String),

    #[error("approval '{approval_id}' expired")]
    ApprovalExpired { approval_id: String },

    #[error("'{operation}' failed after {attempts} attempts (circuit {circuit:?}): {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        circuit: CircuitState,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Whether the retry coordinator may consume an attempt on this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_))
    }

    /// Whether the caller should re-authenticate before trying again.
    pub fn requires_reauthentication(&self) -> bool {
        match self {
            Error::Auth(_) => true,
            Error::RetriesExhausted { source, .. } => source.requires_reauthentication(),
            _ => false,
        }
    }
}

use std::time::Duration;

/// Failures surfaced by the session store. Lookup misses are not errors;
/// they come back as `None`/`false`.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session storage i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("session storage did not respond within {0:?}")]
    Timeout(Duration),

    #[error("malformed session token")]
    InvalidToken,

    #[error("session record could not be encoded or decoded: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no entropy available for session token: {0}")]
    Entropy(String),

    #[error("invalid session settings: {0}")]
    Config(String),
}

impl SessionError {
    /// Storage hiccups are worth retrying; caller mistakes are not.
    pub fn is_retryable(&self) -> bool { matches!(self, SessionError::Io(_) | SessionError::Timeout(_)) }
}

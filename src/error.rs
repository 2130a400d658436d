//! Session-layer error types
//!
//! Every fallible session operation returns one of these kinds. The gateway
//! maps them onto HTTP statuses in `gateway::error`; the important split is
//! auth failures (expected, high-frequency, cheap) vs backend/store failures
//! (operational, logged with context).

use thiserror::Error;

/// Errors produced by the session layer and surfaced through the gateway
#[derive(Debug, Error)]
pub enum SessionError {
    /// No free port left in the configured range
    #[error("no free port available in range {min}-{max}")]
    PortExhausted { min: u16, max: u16 },

    /// Token failed signature or shape validation
    #[error("invalid session token")]
    InvalidToken,

    /// Token was well-formed but past its expiry
    #[error("session token expired")]
    ExpiredToken,

    /// Token verified but no matching store record (expiry/termination race)
    #[error("session not found")]
    SessionNotFound,

    /// Proxied connection to the session's backend failed
    #[error("backend unavailable at {addr}: {reason}")]
    BackendUnavailable { addr: String, reason: String },

    /// The distributed store is unreachable; operations fail closed
    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),
}

impl SessionError {
    /// Auth failures are expected under normal churn and logged at info,
    /// not as application errors
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            SessionError::InvalidToken | SessionError::ExpiredToken | SessionError::SessionNotFound
        )
    }
}

impl From<redis::RedisError> for SessionError {
    fn from(err: redis::RedisError) -> Self {
        SessionError::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::StoreUnavailable(format!("corrupt session record: {err}"))
    }
}

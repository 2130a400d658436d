//! Session layer: records, port allocation, tokens, storage and orchestration
//!
//! A session is a time-bounded, user-scoped web UI instance with its own
//! backend port and credential. The `SessionManager` in `manager` is the
//! only writer; the gateway consults it on every proxied request.

pub mod manager;
pub mod ports;
pub mod store;
pub mod tokens;

pub use manager::{ManagerConfig, SessionManager, SessionStats};
pub use ports::{PortAllocator, PortRange};
pub use store::{MemoryStore, RedisStore, SessionStore};
pub use tokens::{token_fingerprint, TokenCodec, VerifiedToken};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Address of the UI server instance serving a session's content
///
/// In gateway mode this is the only way the proxy learns where to route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendAddr {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One-active-session-per-key identity: `user_id` in direct mode,
/// `(user_id, server_name)` in gateway mode
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct SessionKey {
    pub user_id: String,
    pub server_name: Option<String>,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, server_name: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            server_name,
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.server_name {
            Some(server) => write!(f, "{}@{}", self.user_id, server),
            None => write!(f, "{}", self.user_id),
        }
    }
}

/// A single ephemeral dashboard session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Storage key, independent of the token
    pub session_id: String,

    /// Owning user
    pub user_id: String,

    /// Logical tool server (gateway mode only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    /// Credential presented by clients; unique across active sessions
    pub token: String,

    /// Where this session's UI server listens
    pub backend: BackendAddr,

    /// Access URL handed to the client (see url construction on
    /// `ManagerConfig`)
    pub url: String,

    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    /// Open extension bag (polling interval, proxy prefix, ...) not
    /// interpreted by the session layer
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl Session {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.user_id.clone(), self.server_name.clone())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Remaining lifetime, clamped to zero
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }

    /// Record activity: expiry is always `last_activity_at + timeout` and
    /// never moves backwards
    pub fn touch(&mut self, timeout: Duration, now: DateTime<Utc>) {
        self.last_activity_at = now;
        self.expires_at = self.expires_at.max(now + timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session() -> Session {
        let now = Utc::now();
        Session {
            session_id: "sess-1".to_string(),
            user_id: "u1".to_string(),
            server_name: Some("weather".to_string()),
            token: "tok".to_string(),
            backend: BackendAddr {
                host: "10.0.0.5".to_string(),
                port: 12345,
            },
            url: "https://dash.example.com/mcp/tok/".to_string(),
            created_at: now,
            last_activity_at: now,
            expires_at: now + Duration::minutes(30),
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_touch_never_decreases_expiry() {
        let mut session = sample_session();
        let far = session.last_activity_at + Duration::hours(2);
        session.expires_at = far;

        session.touch(Duration::minutes(30), Utc::now());
        assert_eq!(session.expires_at, far);
    }

    #[test]
    fn test_expiry_window() {
        let session = sample_session();
        let now = Utc::now();
        assert!(!session.is_expired(now));
        assert!(session.is_expired(now + Duration::minutes(31)));
    }

    #[test]
    fn test_serde_camel_case() {
        let json = serde_json::to_value(sample_session()).unwrap();
        assert!(json.get("sessionId").is_some());
        assert!(json.get("userId").is_some());
        assert!(json.get("expiresAt").is_some());
        assert_eq!(json["backend"]["port"], 12345);
    }

    #[test]
    fn test_session_key_display() {
        assert_eq!(
            SessionKey::new("u1", Some("weather".into())).to_string(),
            "u1@weather"
        );
        assert_eq!(SessionKey::new("u1", None).to_string(), "u1");
    }
}

//! Session orchestration
//!
//! The manager ties the port allocator, token codec and store together. It
//! is the only component that writes sessions; the gateway and the hosting
//! application both talk to it. One manager instance owns one port registry,
//! so tests can run several managers side by side without shared state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;

use crate::error::SessionError;

use super::ports::PortAllocator;
use super::store::SessionStore;
use super::tokens::{token_fingerprint, TokenCodec, VerifiedToken};
use super::{BackendAddr, Session, SessionKey};

/// A single extension call cannot push expiry out more than this
const MAX_EXTEND_MINUTES: i64 = 24 * 60;

/// Construction parameters consumed verbatim from configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// "http" or "https", used when constructing access URLs
    pub protocol: String,

    /// Public host for gateway-mode URLs, e.g. "dash.example.com"
    pub base_url: String,

    /// Path prefix for gateway-mode URLs; absence selects direct mode
    pub proxy_prefix: Option<String>,

    /// Host the per-session UI servers bind on
    pub backend_host: String,

    /// Sliding expiry window
    pub session_timeout: Duration,
}

impl ManagerConfig {
    /// Access URL handed to the client
    ///
    /// Direct mode points straight at the allocated port; gateway mode
    /// points at the shared front door with the token in the path.
    fn access_url(&self, token: &str, backend: &BackendAddr) -> String {
        match &self.proxy_prefix {
            Some(prefix) => format!(
                "{}://{}/{}/{}/",
                self.protocol, self.base_url, prefix, token
            ),
            None => format!(
                "{}://{}:{}?token={}",
                self.protocol, backend.host, backend.port, token
            ),
        }
    }
}

/// Read-only aggregate over active sessions; never mutates state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub active_sessions: usize,
    pub used_ports: usize,
    pub sessions_per_user: HashMap<String, usize>,
    pub sessions_per_server: HashMap<String, usize>,
}

/// Orchestrates session lifecycle across allocator, codec and store
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    ports: PortAllocator,
    codec: TokenCodec,
    config: ManagerConfig,
    // Serializes terminate-old-then-create-new; a naive read-then-write
    // races with a concurrent create for the same user. Creation is rare,
    // so one lock over all creates is enough. The sweep takes it too, so a
    // port allocated but not yet persisted cannot be swept as an orphan.
    create_lock: tokio::sync::Mutex<()>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        ports: PortAllocator,
        codec: TokenCodec,
        config: ManagerConfig,
    ) -> Self {
        Self {
            store,
            ports,
            codec,
            config,
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn session_timeout(&self) -> Duration {
        self.config.session_timeout
    }

    /// Create a session for a user, superseding any active one for the same
    /// `(user_id[, server_name])` key
    ///
    /// The old session's port is released before the new one is allocated,
    /// so a full range with one session per user never reports exhaustion on
    /// re-create. Port exhaustion and store failures abort the call; no
    /// "session created" response ever carries a dangling backend.
    pub async fn create_session(
        &self,
        user_id: &str,
        server_name: Option<String>,
        backend: Option<BackendAddr>,
    ) -> Result<Session, SessionError> {
        let _guard = self.create_lock.lock().await;

        let key = SessionKey::new(user_id, server_name.clone());
        if let Some(existing) = self.store.get_by_user(&key).await? {
            tracing::info!(
                session_id = %existing.session_id,
                user = %key,
                port = existing.backend.port,
                "Superseding existing session"
            );
            self.ports.release(existing.backend.port);
            self.store.delete(&existing.session_id).await?;
        }

        let session_id = uuid::Uuid::new_v4().to_string();

        let backend = match backend {
            Some(addr) => {
                // Externally started UI server: record its port so it counts
                // against double-allocation checks
                self.ports.claim(addr.port, &session_id)?;
                addr
            }
            None => {
                let port = self.ports.allocate(&session_id)?;
                BackendAddr {
                    host: self.config.backend_host.clone(),
                    port,
                }
            }
        };

        let timeout = self.config.session_timeout;
        let token = match self
            .codec
            .mint(user_id, server_name.as_deref(), &session_id, timeout)
        {
            Ok(token) => token,
            Err(e) => {
                self.ports.release(backend.port);
                return Err(e);
            }
        };

        let now = Utc::now();
        let session = Session {
            session_id: session_id.clone(),
            user_id: user_id.to_string(),
            server_name,
            url: self.config.access_url(&token, &backend),
            token,
            backend,
            created_at: now,
            last_activity_at: now,
            expires_at: now + timeout,
            metadata: serde_json::Value::Null,
        };

        if let Err(e) = self.store.put(&session, timeout).await {
            // Failed persist must not leak the port
            self.ports.release(session.backend.port);
            return Err(e);
        }

        tracing::info!(
            session_id = %session_id,
            user = %session.key(),
            backend = %session.backend,
            token_fp = %token_fingerprint(&session.token),
            expires_at = %session.expires_at,
            "Session created"
        );
        Ok(session)
    }

    /// Resolve a token to its session
    ///
    /// Signed tokens are verified before the store round-trip, so forged or
    /// expired tokens are rejected cheaply. `update_activity` distinguishes
    /// passive polling reads (must not extend expiry) from user actions
    /// (extend the sliding window).
    pub async fn get_session_by_token(
        &self,
        token: &str,
        update_activity: bool,
    ) -> Result<Session, SessionError> {
        let verified = self.codec.verify(token)?;

        if !update_activity {
            return self.resolve_token(token, &verified).await;
        }

        // The fetch-touch-put below must be atomic with respect to a
        // concurrent supersede: a put landing after create_session deleted
        // the record would resurrect it with a port already released (and
        // possibly re-allocated). The create lock closes that window.
        let _guard = self.create_lock.lock().await;
        let mut session = self.resolve_token(token, &verified).await?;
        let now = Utc::now();
        session.touch(self.config.session_timeout, now);
        let ttl = session.remaining(now);
        self.store.put(&session, ttl).await?;
        Ok(session)
    }

    /// Fetch by token, check the token-session binding, retire on expiry
    async fn resolve_token(
        &self,
        token: &str,
        verified: &VerifiedToken,
    ) -> Result<Session, SessionError> {
        let session = self
            .store
            .get_by_token(token)
            .await?
            .ok_or(SessionError::SessionNotFound)?;

        // A token must never resolve to a different session than it was
        // minted for
        if let VerifiedToken::Signed(claims) = verified {
            if claims.sid != session.session_id {
                return Err(SessionError::InvalidToken);
            }
        }

        let now = Utc::now();
        if session.is_expired(now) {
            // Lazy cleanup: the sweep would get here eventually
            self.ports.release(session.backend.port);
            self.store.delete(&session.session_id).await?;
            return Err(SessionError::SessionNotFound);
        }
        Ok(session)
    }

    /// Look up the active session for a user key, if any
    pub async fn get_session_by_user(
        &self,
        user_id: &str,
        server_name: Option<&str>,
    ) -> Result<Option<Session>, SessionError> {
        let key = SessionKey::new(user_id, server_name.map(String::from));
        match self.store.get_by_user(&key).await? {
            Some(s) if !s.is_expired(Utc::now()) => Ok(Some(s)),
            _ => Ok(None),
        }
    }

    /// Add up to `MAX_EXTEND_MINUTES` to a session's expiry
    ///
    /// Additive, so every call moves `expires_at` strictly later; the clamp
    /// bounds a single call, not the total. Returns false for an
    /// already-gone session instead of recreating it.
    pub async fn extend_session(
        &self,
        session_id: &str,
        minutes: i64,
    ) -> Result<bool, SessionError> {
        let minutes = minutes.clamp(1, MAX_EXTEND_MINUTES);

        let Some(mut session) = self.store.get_by_session_id(session_id).await? else {
            return Ok(false);
        };
        let now = Utc::now();
        if session.is_expired(now) {
            return Ok(false);
        }

        session.last_activity_at = now;
        session.expires_at += Duration::minutes(minutes);
        let ttl = session.remaining(now);
        self.store.put(&session, ttl).await?;

        tracing::debug!(
            session_id = %session_id,
            expires_at = %session.expires_at,
            "Session extended"
        );
        Ok(true)
    }

    /// Release the port and delete the record; idempotent
    pub async fn terminate_session(&self, session_id: &str) -> Result<bool, SessionError> {
        if let Some(session) = self.store.get_by_session_id(session_id).await? {
            self.ports.release(session.backend.port);
        } else {
            // Record already gone (TTL); free any port still registered to it
            for (port, owner) in self.ports.snapshot() {
                if owner == session_id {
                    self.ports.release(port);
                }
            }
        }
        let existed = self.store.delete(session_id).await?;
        if existed {
            tracing::info!(session_id = %session_id, "Session terminated");
        }
        Ok(existed)
    }

    /// Release ports and delete records for sessions past expiry
    ///
    /// In the Redis backing the store TTL is the primary expiry mechanism
    /// and this is a safety net; port release is idempotent so both can
    /// retire the same session. Also frees ports whose record vanished via
    /// TTL without a terminate call.
    pub async fn sweep_expired(&self) -> Result<usize, SessionError> {
        let _guard = self.create_lock.lock().await;

        let now = Utc::now();
        let active = self.store.list_active().await?;
        let mut reaped = 0;

        let mut live_ids = std::collections::HashSet::new();
        for session in active {
            if session.is_expired(now) {
                self.ports.release(session.backend.port);
                self.store.delete(&session.session_id).await?;
                reaped += 1;
                tracing::debug!(
                    session_id = %session.session_id,
                    user = %session.key(),
                    "Swept expired session"
                );
            } else {
                live_ids.insert(session.session_id);
            }
        }

        // Orphaned registry entries: record expired out of the store but the
        // port was never released
        for (port, owner) in self.ports.snapshot() {
            if !live_ids.contains(&owner) {
                self.ports.release(port);
            }
        }

        if reaped > 0 {
            tracing::info!(count = reaped, "Expired session sweep complete");
        }
        Ok(reaped)
    }

    /// Read-only aggregate for operators; must not mutate state
    pub async fn stats(&self) -> Result<SessionStats, SessionError> {
        let now = Utc::now();
        let mut sessions_per_user: HashMap<String, usize> = HashMap::new();
        let mut sessions_per_server: HashMap<String, usize> = HashMap::new();
        let mut active = 0;

        for session in self.store.list_active().await? {
            if session.is_expired(now) {
                continue;
            }
            active += 1;
            *sessions_per_user.entry(session.user_id.clone()).or_default() += 1;
            if let Some(server) = &session.server_name {
                *sessions_per_server.entry(server.clone()).or_default() += 1;
            }
        }

        Ok(SessionStats {
            active_sessions: active,
            used_ports: self.ports.used_count(),
            sessions_per_user,
            sessions_per_server,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ports::PortRange;
    use crate::session::store::MemoryStore;

    fn manager(range: PortRange) -> SessionManager {
        SessionManager::new(
            Arc::new(MemoryStore::new()),
            PortAllocator::new(range, []),
            TokenCodec::opaque(),
            ManagerConfig {
                protocol: "http".to_string(),
                base_url: "localhost".to_string(),
                proxy_prefix: None,
                backend_host: "127.0.0.1".to_string(),
                session_timeout: Duration::minutes(30),
            },
        )
    }

    fn gateway_manager(range: PortRange) -> SessionManager {
        SessionManager::new(
            Arc::new(MemoryStore::new()),
            PortAllocator::new(range, []),
            TokenCodec::signed("test-secret"),
            ManagerConfig {
                protocol: "https".to_string(),
                base_url: "dash.example.com".to_string(),
                proxy_prefix: Some("mcp".to_string()),
                backend_host: "127.0.0.1".to_string(),
                session_timeout: Duration::minutes(30),
            },
        )
    }

    #[tokio::test]
    async fn test_create_allocates_from_range() {
        let mgr = manager(PortRange::new(11000, 11002));
        let session = mgr.create_session("u1", None, None).await.unwrap();
        assert!((11000..=11002).contains(&session.backend.port));
        assert_eq!(
            session.url,
            format!(
                "http://127.0.0.1:{}?token={}",
                session.backend.port, session.token
            )
        );
    }

    #[tokio::test]
    async fn test_second_create_supersedes_and_releases_port() {
        let mgr = manager(PortRange::new(11000, 11000));

        let first = mgr.create_session("u1", None, None).await.unwrap();
        // Single-port range: a second create for the same user only succeeds
        // if the first port was released
        let second = mgr.create_session("u1", None, None).await.unwrap();
        assert_eq!(second.backend.port, first.backend.port);

        let stats = mgr.stats().await.unwrap();
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.used_ports, 1);

        // First session's token must not resolve anymore
        assert!(matches!(
            mgr.get_session_by_token(&first.token, false).await,
            Err(SessionError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn test_port_exhaustion_is_surfaced() {
        let mgr = manager(PortRange::new(11000, 11000));
        mgr.create_session("u1", None, None).await.unwrap();
        let err = mgr.create_session("u2", None, None).await.unwrap_err();
        assert!(matches!(err, SessionError::PortExhausted { .. }));
    }

    #[tokio::test]
    async fn test_server_name_scopes_the_one_session_invariant() {
        let mgr = gateway_manager(PortRange::new(11000, 11003));
        mgr.create_session("u1", Some("weather".into()), None)
            .await
            .unwrap();
        mgr.create_session("u1", Some("stocks".into()), None)
            .await
            .unwrap();

        let stats = mgr.stats().await.unwrap();
        assert_eq!(stats.active_sessions, 2);
        assert_eq!(stats.sessions_per_user["u1"], 2);
        assert_eq!(stats.sessions_per_server["weather"], 1);
    }

    #[tokio::test]
    async fn test_tokens_are_pairwise_distinct() {
        let mgr = manager(PortRange::new(11000, 11009));
        let mut tokens = std::collections::HashSet::new();
        for i in 0..10 {
            let s = mgr
                .create_session(&format!("u{i}"), None, None)
                .await
                .unwrap();
            assert!(tokens.insert(s.token), "duplicate token minted");
        }
    }

    #[tokio::test]
    async fn test_signed_token_resolves_with_claims_check() {
        let mgr = gateway_manager(PortRange::new(11000, 11001));
        let session = mgr
            .create_session("u1", Some("weather".into()), None)
            .await
            .unwrap();

        let resolved = mgr
            .get_session_by_token(&session.token, false)
            .await
            .unwrap();
        assert_eq!(resolved.session_id, session.session_id);

        // Tampered token fails signature, never reaching the store
        let mut tampered = session.token.clone();
        tampered.push('x');
        assert!(matches!(
            mgr.get_session_by_token(&tampered, false).await,
            Err(SessionError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_passive_read_does_not_extend() {
        let mgr = manager(PortRange::new(11000, 11001));
        let session = mgr.create_session("u1", None, None).await.unwrap();
        let before = session.expires_at;

        let after = mgr
            .get_session_by_token(&session.token, false)
            .await
            .unwrap();
        assert_eq!(after.expires_at, before);

        let touched = mgr
            .get_session_by_token(&session.token, true)
            .await
            .unwrap();
        assert!(touched.expires_at >= before);
        assert!(touched.last_activity_at >= session.created_at);
    }

    #[tokio::test]
    async fn test_extend_is_additive_and_strictly_increasing() {
        let mgr = manager(PortRange::new(11000, 11001));
        let session = mgr.create_session("u1", None, None).await.unwrap();

        assert!(mgr.extend_session(&session.session_id, 60).await.unwrap());
        let extended = mgr
            .get_session_by_token(&session.token, false)
            .await
            .unwrap();
        assert_eq!(extended.expires_at, session.expires_at + Duration::minutes(60));

        // A shorter follow-up extension still moves expiry strictly later
        assert!(mgr.extend_session(&session.session_id, 1).await.unwrap());
        let again = mgr
            .get_session_by_token(&session.token, false)
            .await
            .unwrap();
        assert!(again.expires_at > extended.expires_at);
        assert_eq!(again.expires_at, extended.expires_at + Duration::minutes(1));
    }

    #[tokio::test]
    async fn test_extend_clamps_a_single_call() {
        let mgr = manager(PortRange::new(11000, 11001));
        let session = mgr.create_session("u1", None, None).await.unwrap();

        // One call cannot add more than 24h, however large the request
        assert!(mgr
            .extend_session(&session.session_id, 100_000)
            .await
            .unwrap());
        let extended = mgr
            .get_session_by_token(&session.token, false)
            .await
            .unwrap();
        assert_eq!(
            extended.expires_at,
            session.expires_at + Duration::minutes(MAX_EXTEND_MINUTES)
        );
    }

    #[tokio::test]
    async fn test_extend_gone_session_returns_false() {
        let mgr = manager(PortRange::new(11000, 11001));
        assert!(!mgr.extend_session("no-such-session", 30).await.unwrap());
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent_and_frees_port() {
        let mgr = manager(PortRange::new(11000, 11000));
        let session = mgr.create_session("u1", None, None).await.unwrap();

        assert!(mgr.terminate_session(&session.session_id).await.unwrap());
        assert!(!mgr.terminate_session(&session.session_id).await.unwrap());

        // Port is reusable by another user
        let next = mgr.create_session("u2", None, None).await.unwrap();
        assert_eq!(next.backend.port, session.backend.port);
    }

    #[tokio::test]
    async fn test_concurrent_creates_one_active_session() {
        let mgr = Arc::new(manager(PortRange::new(11000, 11031)));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let mgr = mgr.clone();
            handles.push(tokio::spawn(
                async move { mgr.create_session("u1", None, None).await },
            ));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stats = mgr.stats().await.unwrap();
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.used_ports, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_activity_update_cannot_resurrect_superseded_session() {
        let mgr = Arc::new(manager(PortRange::new(11000, 11031)));

        // Race a touching read against a supersede for the same user; the
        // touched record must never be written back after its deletion
        for _ in 0..20 {
            let first = mgr.create_session("u1", None, None).await.unwrap();

            let toucher = {
                let mgr = mgr.clone();
                let token = first.token.clone();
                tokio::spawn(async move { mgr.get_session_by_token(&token, true).await })
            };
            let second = mgr.create_session("u1", None, None).await.unwrap();
            let _ = toucher.await.unwrap();

            // Superseded token stays dead and the user maps to the new session
            assert!(matches!(
                mgr.get_session_by_token(&first.token, false).await,
                Err(SessionError::SessionNotFound)
            ));
            let current = mgr
                .get_session_by_user("u1", None)
                .await
                .unwrap()
                .expect("current session");
            assert_eq!(current.session_id, second.session_id);
        }

        let stats = mgr.stats().await.unwrap();
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.used_ports, 1);
    }

    #[tokio::test]
    async fn test_sweep_releases_expired_sessions() {
        let mgr = manager(PortRange::new(11000, 11000));
        let session = mgr.create_session("u1", None, None).await.unwrap();

        // Force the record past expiry, then sweep
        assert_eq!(mgr.sweep_expired().await.unwrap(), 0);
        {
            let mut expired = session.clone();
            expired.expires_at = Utc::now() - Duration::minutes(1);
            mgr.store.put(&expired, Duration::minutes(1)).await.unwrap();
        }
        assert_eq!(mgr.sweep_expired().await.unwrap(), 1);

        let stats = mgr.stats().await.unwrap();
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.used_ports, 0);

        // Port is back in the pool
        mgr.create_session("u2", None, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_gateway_url_shape() {
        let mgr = gateway_manager(PortRange::new(11000, 11001));
        let session = mgr
            .create_session("u1", Some("weather".into()), None)
            .await
            .unwrap();
        assert_eq!(
            session.url,
            format!("https://dash.example.com/mcp/{}/", session.token)
        );
    }

    #[tokio::test]
    async fn test_external_backend_registration() {
        let mgr = manager(PortRange::new(11000, 11001));
        let backend = BackendAddr {
            host: "10.0.0.5".to_string(),
            port: 9123,
        };
        let session = mgr
            .create_session("u1", None, Some(backend.clone()))
            .await
            .unwrap();
        assert_eq!(session.backend, backend);
        assert_eq!(mgr.stats().await.unwrap().used_ports, 1);
    }
}

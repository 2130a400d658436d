//! Session storage: one interface, two backings
//!
//! Direct mode uses a process-local map (lost on restart, acceptable for a
//! single instance). Gateway mode uses Redis so multiple gateway instances
//! resolve the same tokens; records carry a TTL equal to the session
//! lifetime, so expired records vanish without explicit deletion and the
//! manager's sweep is only a safety net.
//!
//! `get_by_token` is the hot path for every proxied call, so both backings
//! index token -> session id instead of scanning.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Duration;
use redis::AsyncCommands;

use crate::error::SessionError;

use super::{Session, SessionKey};

/// Storage port for session records
///
/// Reads must tolerate a record disappearing between index lookup and fetch
/// (TTL expiry mid-flight): that is `Ok(None)`, not an error.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or replace a session record, with a lifetime for TTL-capable
    /// backings
    async fn put(&self, session: &Session, ttl: Duration) -> Result<(), SessionError>;

    async fn get_by_token(&self, token: &str) -> Result<Option<Session>, SessionError>;

    async fn get_by_session_id(&self, id: &str) -> Result<Option<Session>, SessionError>;

    async fn get_by_user(&self, key: &SessionKey) -> Result<Option<Session>, SessionError>;

    /// Remove a session record; returns whether it existed
    async fn delete(&self, id: &str) -> Result<bool, SessionError>;

    async fn list_active(&self) -> Result<Vec<Session>, SessionError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory backing (direct mode)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    by_id: HashMap<String, Session>,
    // token -> session id, so token lookup never scans
    by_token: HashMap<String, String>,
    by_user: HashMap<SessionKey, String>,
}

/// Process-local session store
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn put(&self, session: &Session, _ttl: Duration) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().unwrap();
        // Replacing a record for the same id must not leave a stale token
        // index entry behind
        let old = inner
            .by_id
            .get(&session.session_id)
            .map(|old| (old.token.clone(), old.key()));
        if let Some((old_token, old_key)) = old {
            inner.by_token.remove(&old_token);
            inner.by_user.remove(&old_key);
        }
        inner
            .by_token
            .insert(session.token.clone(), session.session_id.clone());
        inner
            .by_user
            .insert(session.key(), session.session_id.clone());
        inner
            .by_id
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn get_by_token(&self, token: &str) -> Result<Option<Session>, SessionError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .by_token
            .get(token)
            .and_then(|id| inner.by_id.get(id))
            .cloned())
    }

    async fn get_by_session_id(&self, id: &str) -> Result<Option<Session>, SessionError> {
        Ok(self.inner.lock().unwrap().by_id.get(id).cloned())
    }

    async fn get_by_user(&self, key: &SessionKey) -> Result<Option<Session>, SessionError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .by_user
            .get(key)
            .and_then(|id| inner.by_id.get(id))
            .cloned())
    }

    async fn delete(&self, id: &str) -> Result<bool, SessionError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.by_id.remove(id) {
            Some(session) => {
                inner.by_token.remove(&session.token);
                // Only drop the user index if it still points at this session
                if inner.by_user.get(&session.key()) == Some(&session.session_id) {
                    inner.by_user.remove(&session.key());
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_active(&self) -> Result<Vec<Session>, SessionError> {
        Ok(self.inner.lock().unwrap().by_id.values().cloned().collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Redis backing (gateway mode)
// ─────────────────────────────────────────────────────────────────────────────

/// Key prefix shared by all gateway instances
const KEY_PREFIX: &str = "mcpgw";

/// Redis-backed session store
///
/// Layout:
/// - `mcpgw:session:{id}`      -> JSON record, EX = session lifetime
/// - `mcpgw:token:{token}`     -> session id,  EX = session lifetime
/// - `mcpgw:user:{user}:{srv}` -> session id,  EX = session lifetime
/// - `mcpgw:sessions`          -> set of ids (stale members filtered on read)
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisStore {
    /// Connect to the store; fails closed if Redis is unreachable
    pub async fn connect(url: &str) -> Result<Self, SessionError> {
        let client = redis::Client::open(url)
            .map_err(|e| SessionError::StoreUnavailable(e.to_string()))?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }

    fn session_key(id: &str) -> String {
        format!("{KEY_PREFIX}:session:{id}")
    }

    fn token_key(token: &str) -> String {
        format!("{KEY_PREFIX}:token:{token}")
    }

    fn user_key(key: &SessionKey) -> String {
        format!(
            "{KEY_PREFIX}:user:{}:{}",
            key.user_id,
            key.server_name.as_deref().unwrap_or("-")
        )
    }

    fn set_key() -> String {
        format!("{KEY_PREFIX}:sessions")
    }

    async fn fetch(&self, id: &str) -> Result<Option<Session>, SessionError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::session_key(id)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SessionStore for RedisStore {
    async fn put(&self, session: &Session, ttl: Duration) -> Result<(), SessionError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(session)?;
        // TTL equal to session lifetime: expired records vanish on their own
        let secs = ttl.num_seconds().max(1) as u64;

        let () = conn.set_ex(Self::session_key(&session.session_id), json, secs).await?;
        let () = conn
            .set_ex(Self::token_key(&session.token), &session.session_id, secs)
            .await?;
        let () = conn
            .set_ex(Self::user_key(&session.key()), &session.session_id, secs)
            .await?;
        let () = conn.sadd(Self::set_key(), &session.session_id).await?;
        Ok(())
    }

    async fn get_by_token(&self, token: &str) -> Result<Option<Session>, SessionError> {
        let mut conn = self.conn.clone();
        let id: Option<String> = conn.get(Self::token_key(token)).await?;
        match id {
            // The record may expire between index lookup and fetch; that is
            // "not found", not an error
            Some(id) => self.fetch(&id).await,
            None => Ok(None),
        }
    }

    async fn get_by_session_id(&self, id: &str) -> Result<Option<Session>, SessionError> {
        self.fetch(id).await
    }

    async fn get_by_user(&self, key: &SessionKey) -> Result<Option<Session>, SessionError> {
        let mut conn = self.conn.clone();
        let id: Option<String> = conn.get(Self::user_key(key)).await?;
        match id {
            Some(id) => self.fetch(&id).await,
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, SessionError> {
        let mut conn = self.conn.clone();
        let session = self.fetch(id).await?;
        let () = conn.srem(Self::set_key(), id).await?;
        match session {
            Some(session) => {
                let () = conn
                    .del(&[
                        Self::session_key(id),
                        Self::token_key(&session.token),
                        Self::user_key(&session.key()),
                    ])
                    .await?;
                Ok(true)
            }
            None => {
                // Record already gone (TTL); still drop the bare key
                let deleted: i64 = conn.del(Self::session_key(id)).await?;
                Ok(deleted > 0)
            }
        }
    }

    async fn list_active(&self) -> Result<Vec<Session>, SessionError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(Self::set_key()).await?;
        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            match self.fetch(&id).await? {
                Some(session) => sessions.push(session),
                None => {
                    // Stale set member: the record expired via TTL
                    let () = conn.srem(Self::set_key(), &id).await?;
                }
            }
        }
        Ok(sessions)
    }
}

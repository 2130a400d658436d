//! Token minting and verification
//!
//! Two trust models behind one codec:
//!
//! - `Opaque` (direct mode): high-entropy random identifiers with no embedded
//!   structure. Validity is decided solely by presence in the session store.
//! - `Signed` (gateway mode): JWTs embedding the session claims. Signature
//!   and expiry are checked before the store is consulted, so forged or
//!   expired tokens are rejected without a store round-trip.
//!
//! The signing key is process-wide configuration; rotating it invalidates
//! all outstanding signed tokens.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SessionError;

/// Claims embedded in a signed gateway-mode token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Owning user id
    pub sub: String,

    /// Logical tool server this session belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    /// Session id the token was minted for
    pub sid: String,

    /// Issued at (Unix epoch seconds)
    pub iat: i64,

    /// Expiration (Unix epoch seconds)
    pub exp: i64,
}

/// Result of verifying a token, by trust model
#[derive(Debug, Clone)]
pub enum VerifiedToken {
    /// Opaque token: shape-checked only, the store is the authority
    Opaque,
    /// Signed token: claims verified against signature and expiry
    Signed(TokenClaims),
}

/// Mints and verifies session tokens
pub enum TokenCodec {
    Opaque,
    Signed {
        encoding_key: EncodingKey,
        decoding_key: DecodingKey,
    },
}

/// Opaque tokens are 32 random bytes hex-encoded
const OPAQUE_TOKEN_BYTES: usize = 32;

impl TokenCodec {
    /// Codec for direct-mode opaque tokens
    pub fn opaque() -> Self {
        TokenCodec::Opaque
    }

    /// Codec for gateway-mode signed tokens, keyed by the shared secret
    pub fn signed(secret: &str) -> Self {
        TokenCodec::Signed {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Mint a token for a session
    ///
    /// `ttl` only matters for signed tokens, where expiry is embedded in the
    /// claims; opaque tokens expire with their store record.
    pub fn mint(
        &self,
        user_id: &str,
        server_name: Option<&str>,
        session_id: &str,
        ttl: Duration,
    ) -> Result<String, SessionError> {
        match self {
            TokenCodec::Opaque => {
                let mut bytes = [0u8; OPAQUE_TOKEN_BYTES];
                rand::thread_rng().fill_bytes(&mut bytes);
                Ok(hex::encode(bytes))
            }
            TokenCodec::Signed { encoding_key, .. } => {
                let now = Utc::now();
                let claims = TokenClaims {
                    sub: user_id.to_string(),
                    server_name: server_name.map(String::from),
                    sid: session_id.to_string(),
                    iat: now.timestamp(),
                    exp: (now + ttl).timestamp(),
                };
                encode(&Header::default(), &claims, encoding_key)
                    .map_err(|_| SessionError::InvalidToken)
            }
        }
    }

    /// Verify a token before the store is consulted
    ///
    /// Opaque tokens only get a shape check here; the store lookup is the
    /// real validation. Signed tokens are rejected outright on bad signature
    /// or expiry.
    pub fn verify(&self, token: &str) -> Result<VerifiedToken, SessionError> {
        match self {
            TokenCodec::Opaque => {
                // 64 hex chars; anything else never came from mint()
                if token.len() == OPAQUE_TOKEN_BYTES * 2
                    && token.bytes().all(|b| b.is_ascii_hexdigit())
                {
                    Ok(VerifiedToken::Opaque)
                } else {
                    Err(SessionError::InvalidToken)
                }
            }
            TokenCodec::Signed { decoding_key, .. } => {
                let claims = decode::<TokenClaims>(token, decoding_key, &Validation::default())
                    .map_err(|e| match e.kind() {
                        jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                            SessionError::ExpiredToken
                        }
                        _ => SessionError::InvalidToken,
                    })?;
                Ok(VerifiedToken::Signed(claims.claims))
            }
        }
    }
}

/// Short SHA-256 fingerprint of a token, safe to log
///
/// Raw tokens never hit the logs; this gives operators a stable handle for
/// correlating requests to a session.
pub fn token_fingerprint(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let hash = hasher.finalize();
    format!("{:x}", hash)[..16].to_string()
}

//! Self-contained session tokens.
//!
//! Wire format (before base64):
//!   [ token key (32 bytes) | nonce (12 bytes) | AES-256-GCM ciphertext + tag ]
//!
//! The plaintext is the JSON form of [`SessionClaims`]. A fresh key is
//! generated per token and travels inside it, so no session table is kept.
//! Early invalidation goes through an in-memory revocation set.

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::crypto::{generate_key, open, seal, DERIVED_KEY_LEN, NONCE_LEN, TAG_LEN};
use crate::error::CryptoError;
use crate::permissions::Role;

pub const SESSION_LIFETIME_HOURS: i64 = 24;
const TOKEN_KEY_LEN: usize = DERIVED_KEY_LEN;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionClaims {
    pub email: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStatus {
    Valid(SessionClaims),
    Expired,
    Revoked,
    Invalid,
}

impl TokenStatus {
    pub fn claims(self) -> Option<SessionClaims> {
        match self {
            TokenStatus::Valid(claims) => Some(claims),
            _ => None,
        }
    }
}

pub struct SessionTokenService {
    lifetime: Duration,
    /// token digest -> instant after which the entry can be dropped
    revoked: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Default for SessionTokenService {
    fn default() -> Self {
        Self::new(Duration::hours(SESSION_LIFETIME_HOURS))
    }
}

impl SessionTokenService {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            revoked: Mutex::new(HashMap::new()),
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Copy the revocations held by `other`, so tokens logged out there stay
    /// rejected here.
    pub fn inherit_revocations(&self, other: &SessionTokenService) {
        let theirs = other.revoked.lock().clone();
        self.revoked.lock().extend(theirs);
    }

    pub fn issue(&self, email: &str, role: Role) -> Result<IssuedToken, CryptoError> {
        self.issue_at(email, role, Utc::now())
    }

    pub fn issue_at(
        &self,
        email: &str,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, CryptoError> {
        let claims = SessionClaims {
            email: email.to_string(),
            role,
            created_at: now,
            expires_at: now + self.lifetime,
        };
        let plaintext = serde_json::to_vec(&claims).map_err(|_| CryptoError::Encrypt)?;
        let key = generate_key();
        let sealed = seal(&key, &plaintext)?;

        let mut raw = Vec::with_capacity(TOKEN_KEY_LEN + sealed.len());
        raw.extend_from_slice(&key[..]);
        raw.extend_from_slice(&sealed);
        debug!(email, role = %role, "session token issued");
        Ok(IssuedToken {
            token: general_purpose::STANDARD.encode(raw),
            expires_at: claims.expires_at,
        })
    }

    /// Claims of a currently valid token, `None` otherwise.
    pub fn verify(&self, token: &str) -> Option<SessionClaims> {
        self.status(token).claims()
    }

    pub fn status(&self, token: &str) -> TokenStatus {
        self.status_at(token, Utc::now())
    }

    pub fn status_at(&self, token: &str, now: DateTime<Utc>) -> TokenStatus {
        self.prune_revoked(now);
        let claims = match self.decode(token) {
            Some(claims) => claims,
            None => {
                warn!("malformed or tampered session token rejected");
                return TokenStatus::Invalid;
            }
        };
        if claims.expires_at <= claims.created_at
            || claims.expires_at - claims.created_at > self.lifetime
        {
            warn!(email = %claims.email, "session token with inconsistent lifetime rejected");
            return TokenStatus::Invalid;
        }
        if now >= claims.expires_at {
            info!(email = %claims.email, expired_at = %claims.expires_at, "expired session token rejected");
            return TokenStatus::Expired;
        }
        if self.revoked.lock().contains_key(&token_digest(token)) {
            info!(email = %claims.email, "revoked session token rejected");
            return TokenStatus::Revoked;
        }
        debug!(email = %claims.email, "session token verified");
        TokenStatus::Valid(claims)
    }

    /// Reject `token` from now until its natural expiry. Returns false if the
    /// token was not valid to begin with.
    pub fn revoke(&self, token: &str) -> bool {
        self.revoke_at(token, Utc::now())
    }

    pub fn revoke_at(&self, token: &str, now: DateTime<Utc>) -> bool {
        let claims = match self.status_at(token, now) {
            TokenStatus::Valid(claims) => claims,
            _ => return false,
        };
        self.revoked
            .lock()
            .insert(token_digest(token), claims.expires_at);
        info!(email = %claims.email, "session token revoked");
        true
    }

    pub fn revoked_count(&self) -> usize {
        self.revoked.lock().len()
    }

    fn prune_revoked(&self, now: DateTime<Utc>) {
        self.revoked.lock().retain(|_, until| *until > now);
    }

    fn decode(&self, token: &str) -> Option<SessionClaims> {
        let raw = general_purpose::STANDARD.decode(token.trim()).ok()?;
        if raw.len() < TOKEN_KEY_LEN + NONCE_LEN + TAG_LEN {
            return None;
        }
        let (key_bytes, sealed) = raw.split_at(TOKEN_KEY_LEN);
        let key: [u8; TOKEN_KEY_LEN] = key_bytes.try_into().ok()?;
        let plaintext = open(&key, sealed).ok()?;
        serde_json::from_slice(&plaintext).ok()
    }
}

fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.trim().as_bytes()))
}

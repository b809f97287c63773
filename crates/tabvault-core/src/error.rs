use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failures raised by the crypto engine.
///
/// `Decrypt` is deliberately the only decryption outcome: a wrong password,
/// a truncated blob, a bad tag and an unparseable plaintext all map to it.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("salt unavailable: {0}")]
    Salt(String),

    #[error("password hashing failed")]
    PasswordHash,
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("account locked until {until}")]
    AccountLocked { until: DateTime<Utc> },

    #[error("session invalid or expired")]
    InvalidSession,

    #[error("insufficient permissions")]
    PermissionDenied,

    #[error("invalid value for '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("no active schema")]
    NoActiveSchema,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Conflict(String),

    #[error("operation not allowed: {0}")]
    Protected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl VaultError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        VaultError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// True for errors whose details must not be shown to the presenting party.
    pub fn is_security_sensitive(&self) -> bool {
        matches!(
            self,
            VaultError::Crypto(_)
                | VaultError::AuthenticationFailed
                | VaultError::AccountLocked { .. }
                | VaultError::InvalidSession
                | VaultError::PermissionDenied
        )
    }
}

pub type VaultResult<T> = Result<T, VaultError>;

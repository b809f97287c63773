//! Password-based file encryption and login password hashing.
//!
//! Blob wire format (before base64):
//!   [ nonce (12 bytes) | AES-256-GCM ciphertext + tag ]
//!
//! The key is PBKDF2-HMAC-SHA256(password, salt) and is recomputed for every
//! call; only the salt is persisted.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose, Engine as _};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::Sha256;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const KDF_ITERATIONS: u32 = 100_000;
pub const DERIVED_KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const DEFAULT_BCRYPT_COST: u32 = bcrypt::DEFAULT_COST;

pub type DerivedKey = Zeroizing<[u8; DERIVED_KEY_LEN]>;

/// Holds the salt and cost parameters. Built once at startup and shared.
#[derive(Clone)]
pub struct CryptoEngine {
    salt: [u8; SALT_LEN],
    iterations: u32,
    bcrypt_cost: u32,
}

impl std::fmt::Debug for CryptoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoEngine")
            .field("iterations", &self.iterations)
            .field("bcrypt_cost", &self.bcrypt_cost)
            .finish_non_exhaustive()
    }
}

impl CryptoEngine {
    pub fn new(salt: [u8; SALT_LEN]) -> Self {
        Self::with_params(salt, KDF_ITERATIONS, DEFAULT_BCRYPT_COST)
    }

    /// Engine with explicit work factors. Production uses [`CryptoEngine::new`].
    pub fn with_params(salt: [u8; SALT_LEN], iterations: u32, bcrypt_cost: u32) -> Self {
        Self {
            salt,
            iterations,
            bcrypt_cost,
        }
    }

    /// Load the salt at `salt_path`, creating it on first use.
    pub fn open(salt_path: &Path, iterations: u32, bcrypt_cost: u32) -> Result<Self, CryptoError> {
        let salt = load_or_create_salt(salt_path)?;
        Ok(Self::with_params(salt, iterations, bcrypt_cost))
    }

    pub fn derive_key(&self, password: &str) -> Result<DerivedKey, CryptoError> {
        if self.iterations == 0 {
            return Err(CryptoError::KeyDerivation);
        }
        let mut key = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
        pbkdf2_hmac::<Sha256>(password.as_bytes(), &self.salt, self.iterations, &mut key[..]);
        Ok(key)
    }

    /// Serialize `payload` to JSON and seal it under the password-derived key.
    pub fn encrypt<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        password: &str,
    ) -> Result<String, CryptoError> {
        let result = serde_json::to_vec(payload)
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::Encrypt)
            .and_then(|plaintext| {
                let key = self.derive_key(password)?;
                seal(&key, &plaintext)
            });
        match result {
            Ok(sealed) => {
                debug!(bytes = sealed.len(), "payload encrypted");
                Ok(general_purpose::STANDARD.encode(sealed))
            }
            Err(err) => {
                warn!("payload encryption failed");
                Err(err)
            }
        }
    }

    /// Inverse of [`CryptoEngine::encrypt`]. Every failure is `CryptoError::Decrypt`.
    pub fn decrypt<T: DeserializeOwned>(&self, blob: &str, password: &str) -> Result<T, CryptoError> {
        let result = general_purpose::STANDARD
            .decode(blob.trim())
            .map_err(|_| CryptoError::Decrypt)
            .and_then(|raw| {
                let key = self.derive_key(password).map_err(|_| CryptoError::Decrypt)?;
                open(&key, &raw)
            })
            .and_then(|plaintext| {
                serde_json::from_slice::<T>(&plaintext).map_err(|_| CryptoError::Decrypt)
            });
        match result {
            Ok(payload) => {
                debug!("payload decrypted");
                Ok(payload)
            }
            Err(_) => {
                warn!("payload decryption failed");
                Err(CryptoError::Decrypt)
            }
        }
    }

    pub fn hash_password(&self, password: &str) -> Result<String, CryptoError> {
        bcrypt::hash(password, self.bcrypt_cost).map_err(|_| CryptoError::PasswordHash)
    }

    /// A malformed stored hash verifies as `false`.
    pub fn verify_password(&self, password: &str, hash: &str) -> bool {
        bcrypt::verify(password, hash).unwrap_or(false)
    }
}

/// Encrypt under a raw 32-byte key, prepending a fresh random nonce.
pub fn seal(key: &[u8; DERIVED_KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Encrypt)?;
    let nonce = generate_nonce();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt `nonce || ciphertext+tag` under a raw key.
pub fn open(key: &[u8; DERIVED_KEY_LEN], data: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Decrypt);
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Decrypt)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)?;
    Ok(Zeroizing::new(plaintext))
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn generate_key() -> Zeroizing<[u8; DERIVED_KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    OsRng.fill_bytes(&mut key[..]);
    key
}

/// Read the 32-byte salt, writing a new random one if the file is absent.
///
/// A new salt makes anything encrypted under a previous salt unreadable.
pub fn load_or_create_salt(path: &Path) -> Result<[u8; SALT_LEN], CryptoError> {
    if path.exists() {
        let bytes = fs::read(path).map_err(|e| CryptoError::Salt(e.to_string()))?;
        let salt: [u8; SALT_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Salt(format!("expected {SALT_LEN} bytes, found {}", bytes.len())))?;
        return Ok(salt);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CryptoError::Salt(e.to_string()))?;
    }
    let salt = generate_salt();
    fs::write(path, salt).map_err(|e| CryptoError::Salt(e.to_string()))?;
    restrict_file_permissions(path);
    warn!(path = %path.display(), "created new salt file");
    Ok(salt)
}

#[cfg(unix)]
fn restrict_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        warn!(path = %path.display(), "could not restrict permissions: {err}");
    }
}

#[cfg(not(unix))]
fn restrict_file_permissions(_path: &Path) {}

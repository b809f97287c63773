//! Encrypted, role-controlled tabular data store.
//!
//! Every file on disk is AES-256-GCM ciphertext under a key derived from the
//! master password. Callers authenticate to obtain a session token, and every
//! store operation checks that token's role against a fixed permission matrix.

pub mod access;
pub mod audit;
pub mod config;
pub mod crypto;
pub mod error;
pub mod lockout;
pub mod paths;
pub mod permissions;
pub mod records;
pub mod schemas;
pub mod session;
pub mod storage;
pub mod users;
pub mod vault;

pub use config::{Secrets, VaultConfig};
pub use crypto::CryptoEngine;
pub use error::{CryptoError, VaultError, VaultResult};
pub use permissions::{Operation, Role};
pub use records::Record;
pub use schemas::{ColumnDef, ColumnType};
pub use session::{SessionClaims, SessionTokenService, TokenStatus};
pub use vault::TabVault;

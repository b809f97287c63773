use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use zeroize::Zeroizing;

use crate::audit::DEFAULT_AUDIT_MAX_BYTES;
use crate::crypto::{DEFAULT_BCRYPT_COST, KDF_ITERATIONS};
use crate::lockout::{LOCKOUT_WINDOW_MINUTES, MAX_FAILED_ATTEMPTS};
use crate::paths;
use crate::session::SESSION_LIFETIME_HOURS;

pub const MAX_SESSION_HOURS: i64 = 24 * 365;
pub const MAX_LOCKOUT_MINUTES: i64 = 60 * 24 * 30;

pub const ENV_DATA_DIR: &str = "TABVAULT_DATA_DIR";
pub const ENV_SESSION_HOURS: &str = "TABVAULT_SESSION_HOURS";
pub const ENV_KDF_ITERATIONS: &str = "TABVAULT_KDF_ITERATIONS";
pub const ENV_BCRYPT_COST: &str = "TABVAULT_BCRYPT_COST";
pub const ENV_MASTER_PASSWORD: &str = "TABVAULT_MASTER_PASSWORD";
pub const ENV_ROOT_EMAIL: &str = "TABVAULT_ROOT_EMAIL";
pub const ENV_ROOT_PASSWORD: &str = "TABVAULT_ROOT_PASSWORD";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLayout {
    pub salt: String,
    pub users: String,
    pub schemas_dir: String,
    pub active_schema: String,
    pub data: String,
    pub audit_log: String,
}

impl Default for FileLayout {
    fn default() -> Self {
        Self {
            salt: "salt.key".into(),
            users: "users.enc".into(),
            schemas_dir: "schemas".into(),
            active_schema: "active_schema.enc".into(),
            data: "database.enc".into(),
            audit_log: "logs/audit.log".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityLimits {
    pub session_hours: i64,
    pub kdf_iterations: u32,
    pub bcrypt_cost: u32,
    pub min_password_length: usize,
    pub max_failed_attempts: usize,
    pub lockout_minutes: i64,
}

impl Default for SecurityLimits {
    fn default() -> Self {
        Self {
            session_hours: SESSION_LIFETIME_HOURS,
            kdf_iterations: KDF_ITERATIONS,
            bcrypt_cost: DEFAULT_BCRYPT_COST,
            min_password_length: 8,
            max_failed_attempts: MAX_FAILED_ATTEMPTS,
            lockout_minutes: LOCKOUT_WINDOW_MINUTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    pub data_dir: PathBuf,
    #[serde(default)]
    pub files: FileLayout,
    #[serde(default)]
    pub limits: SecurityLimits,
    #[serde(default = "default_audit_max_bytes")]
    pub audit_max_bytes: u64,
}

fn default_audit_max_bytes() -> u64 {
    DEFAULT_AUDIT_MAX_BYTES
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self::in_dir(paths::data_dir().unwrap_or_else(|_| PathBuf::from("data")))
    }
}

impl VaultConfig {
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            files: FileLayout::default(),
            limits: SecurityLimits::default(),
            audit_max_bytes: DEFAULT_AUDIT_MAX_BYTES,
        }
    }

    /// Defaults overlaid with `TABVAULT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var_os(ENV_DATA_DIR) {
            Some(dir) => Self::in_dir(PathBuf::from(dir)),
            None => Self::default(),
        };
        if let Some(hours) = env_parse::<i64>(ENV_SESSION_HOURS)? {
            config.limits.session_hours = hours;
        }
        if let Some(iterations) = env_parse::<u32>(ENV_KDF_ITERATIONS)? {
            config.limits.kdf_iterations = iterations;
        }
        if let Some(cost) = env_parse::<u32>(ENV_BCRYPT_COST)? {
            config.limits.bcrypt_cost = cost;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_SESSION_HOURS).contains(&self.limits.session_hours) {
            return Err(anyhow!("session_hours must be between 1 and {MAX_SESSION_HOURS}"));
        }
        if self.limits.kdf_iterations == 0 {
            return Err(anyhow!("kdf_iterations must be positive"));
        }
        if !(4..=31).contains(&self.limits.bcrypt_cost) {
            return Err(anyhow!("bcrypt_cost must be between 4 and 31"));
        }
        if self.limits.lockout_minutes <= 0 || self.limits.max_failed_attempts == 0 {
            return Err(anyhow!("lockout settings must be positive"));
        }
        if self.limits.lockout_minutes > MAX_LOCKOUT_MINUTES {
            return Err(anyhow!("lockout_minutes must be at most {MAX_LOCKOUT_MINUTES}"));
        }
        Ok(())
    }

    pub fn salt_path(&self) -> PathBuf {
        self.data_dir.join(&self.files.salt)
    }

    pub fn users_path(&self) -> PathBuf {
        self.data_dir.join(&self.files.users)
    }

    pub fn schemas_dir(&self) -> PathBuf {
        self.data_dir.join(&self.files.schemas_dir)
    }

    pub fn active_schema_path(&self) -> PathBuf {
        self.schemas_dir().join(&self.files.active_schema)
    }

    pub fn data_path(&self) -> PathBuf {
        self.data_dir.join(&self.files.data)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.files.audit_log)
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("invalid value for {name}")),
        Err(_) => Ok(None),
    }
}

/// Externally supplied secrets. Never serialized, zeroized on drop.
pub struct Secrets {
    pub master_password: Zeroizing<String>,
    pub root_email: String,
    pub root_password: Zeroizing<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("root_email", &self.root_email)
            .finish_non_exhaustive()
    }
}

impl Secrets {
    pub fn new(master_password: &str, root_email: &str, root_password: &str) -> Self {
        Self {
            master_password: Zeroizing::new(master_password.to_string()),
            root_email: root_email.to_string(),
            root_password: Zeroizing::new(root_password.to_string()),
        }
    }

    /// Each value is `None` when the variable is unset or empty.
    pub fn partial_from_env() -> (Option<Zeroizing<String>>, Option<String>, Option<Zeroizing<String>>) {
        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        (
            read(ENV_MASTER_PASSWORD).map(Zeroizing::new),
            read(ENV_ROOT_EMAIL),
            read(ENV_ROOT_PASSWORD).map(Zeroizing::new),
        )
    }

    pub fn from_env() -> Result<Self> {
        match Self::partial_from_env() {
            (Some(master_password), Some(root_email), Some(root_password)) => Ok(Self {
                master_password,
                root_email,
                root_password,
            }),
            _ => Err(anyhow!(
                "{ENV_MASTER_PASSWORD}, {ENV_ROOT_EMAIL} and {ENV_ROOT_PASSWORD} must be set"
            )),
        }
    }
}

//! Encrypted user store: bootstrap, authentication and account management.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

use crate::access::VaultContext;
use crate::audit::AuditOutcome;
use crate::error::{VaultError, VaultResult};
use crate::lockout::{normalize, AccountGuard, LockoutStatus};
use crate::permissions::{Operation, Role};
use crate::storage::EncryptedFile;

const SYSTEM_ACTOR: &str = "system";
/// bcrypt ignores input past this length.
const MAX_PASSWORD_BYTES: usize = 72;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub password_hash: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub last_login: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_root: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UserDocument {
    users: BTreeMap<String, UserRecord>,
}

/// A user as shown to callers. Never carries the password hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSummary {
    pub email: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub last_login: Option<DateTime<Utc>>,
    pub is_root: bool,
}

impl UserSummary {
    fn from_record(email: &str, record: &UserRecord) -> Self {
        Self {
            email: email.to_string(),
            role: record.role,
            created_at: record.created_at,
            created_by: record.created_by.clone(),
            last_login: record.last_login,
            is_root: record.is_root,
        }
    }
}

#[derive(Clone, Serialize)]
pub struct AuthSession {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserSummary,
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("user", &self.user)
            .finish()
    }
}

pub struct UserStore {
    ctx: Arc<VaultContext>,
    file: EncryptedFile,
    guard: AccountGuard,
    min_password_length: usize,
    dummy_hash: OnceLock<Option<String>>,
}

impl UserStore {
    pub fn new(
        ctx: Arc<VaultContext>,
        file: EncryptedFile,
        guard: AccountGuard,
        min_password_length: usize,
    ) -> Self {
        Self {
            ctx,
            file,
            guard,
            min_password_length,
            dummy_hash: OnceLock::new(),
        }
    }

    pub fn guard(&self) -> &AccountGuard {
        &self.guard
    }

    pub(crate) fn file(&self) -> &EncryptedFile {
        &self.file
    }

    fn load(&self) -> VaultResult<UserDocument> {
        let password = self.ctx.master_password();
        Ok(self
            .file
            .load(&self.ctx.engine, &password)?
            .unwrap_or_default())
    }

    fn save(&self, doc: &UserDocument) -> VaultResult<()> {
        let password = self.ctx.master_password();
        self.file.save(&self.ctx.engine, &password, doc)
    }

    /// Create the root account when no user store exists yet.
    ///
    /// Returns `false` without touching anything if the store is present.
    pub fn bootstrap_root(&self, email: &str, password: &str) -> VaultResult<bool> {
        if self.file.exists() {
            debug!("user store present, skipping bootstrap");
            return Ok(false);
        }
        let email = normalize(email);
        validate_email(&email)?;
        self.validate_password(password)?;

        let mut doc = UserDocument::default();
        doc.users.insert(
            email.clone(),
            UserRecord {
                password_hash: self.ctx.engine.hash_password(password)?,
                role: Role::Root,
                created_at: Utc::now(),
                created_by: SYSTEM_ACTOR.to_string(),
                last_login: None,
                is_root: true,
            },
        );
        self.save(&doc)?;
        info!(email = %email, "root account created");
        self.ctx.audit(
            SYSTEM_ACTOR,
            "user.bootstrap",
            AuditOutcome::Success,
            Some(&email),
            json!({ "role": Role::Root }),
        );
        Ok(true)
    }

    pub fn authenticate(&self, email: &str, password: &str) -> VaultResult<AuthSession> {
        let email = normalize(email);
        if let LockoutStatus::Locked { until } = self.guard.check_lockout(&email) {
            self.ctx.audit(
                &email,
                "auth.login",
                AuditOutcome::Denied,
                None,
                json!({ "reason": "account locked", "until": until }),
            );
            return Err(VaultError::AccountLocked { until });
        }

        let mut doc = self.load()?;
        let verified = match doc.users.get(&email) {
            Some(record) => self.ctx.engine.verify_password(password, &record.password_hash),
            None => {
                // same bcrypt cost whether or not the account exists
                if let Some(hash) = self.dummy_hash() {
                    self.ctx.engine.verify_password(password, hash);
                }
                false
            }
        };
        if !verified {
            self.guard.record_failure(&email);
            self.ctx.audit(
                &email,
                "auth.login",
                AuditOutcome::Failed,
                None,
                json!({ "reason": "invalid credentials" }),
            );
            return Err(VaultError::AuthenticationFailed);
        }

        self.guard.record_success(&email);
        let Some(record) = doc.users.get_mut(&email) else {
            return Err(VaultError::AuthenticationFailed);
        };
        record.last_login = Some(Utc::now());
        let summary = UserSummary::from_record(&email, record);
        self.save(&doc)?;

        let issued = self.ctx.sessions.issue(&email, summary.role)?;
        self.ctx.audit(
            &email,
            "auth.login",
            AuditOutcome::Success,
            None,
            json!({ "role": summary.role, "expires_at": issued.expires_at }),
        );
        Ok(AuthSession {
            token: issued.token,
            expires_at: issued.expires_at,
            user: summary,
        })
    }

    fn dummy_hash(&self) -> Option<&str> {
        self.dummy_hash
            .get_or_init(|| self.ctx.engine.hash_password("tabvault-dummy-password").ok())
            .as_deref()
    }

    pub fn create_user(
        &self,
        token: &str,
        email: &str,
        password: &str,
        role: Role,
    ) -> VaultResult<UserSummary> {
        let email = normalize(email);
        let action = "user.create";
        let claims = self
            .ctx
            .authorize(token, Operation::UserCreate, action, Some(&email))?;
        self.ctx.require_manage(&claims, role, action, Some(&email))?;

        let result = (|| -> VaultResult<UserSummary> {
            validate_email(&email)?;
            self.validate_password(password)?;
            let mut doc = self.load()?;
            if doc.users.contains_key(&email) {
                return Err(VaultError::Conflict(format!("user {email}")));
            }
            let record = UserRecord {
                password_hash: self.ctx.engine.hash_password(password)?,
                role,
                created_at: Utc::now(),
                created_by: claims.email.clone(),
                last_login: None,
                is_root: false,
            };
            let summary = UserSummary::from_record(&email, &record);
            doc.users.insert(email.clone(), record);
            self.save(&doc)?;
            Ok(summary)
        })();

        match &result {
            Ok(_) => self.ctx.audit(
                &claims.email,
                action,
                AuditOutcome::Success,
                Some(&email),
                json!({ "role": role }),
            ),
            Err(err) => self.ctx.audit_failure(&claims.email, action, Some(&email), err),
        }
        result
    }

    pub fn delete_user(&self, token: &str, email: &str) -> VaultResult<()> {
        let email = normalize(email);
        let action = "user.delete";
        let claims = self
            .ctx
            .authorize(token, Operation::UserDelete, action, Some(&email))?;

        let mut doc = self.load()?;
        let Some(record) = doc.users.get(&email) else {
            let err = VaultError::NotFound(format!("user {email}"));
            self.ctx.audit_failure(&claims.email, action, Some(&email), &err);
            return Err(err);
        };
        let target_role = record.role;
        if record.is_root {
            return Err(self.protected(&claims.email, action, &email, "root account cannot be deleted"));
        }
        if matches!(target_role, Role::Root | Role::Admin) {
            let privileged = doc
                .users
                .values()
                .filter(|u| matches!(u.role, Role::Root | Role::Admin))
                .count();
            if privileged <= 1 {
                return Err(self.protected(
                    &claims.email,
                    action,
                    &email,
                    "last administrative account cannot be deleted",
                ));
            }
        }
        self.ctx.require_manage(&claims, target_role, action, Some(&email))?;

        doc.users.remove(&email);
        if let Err(err) = self.save(&doc) {
            self.ctx.audit_failure(&claims.email, action, Some(&email), &err);
            return Err(err);
        }
        self.ctx.audit(
            &claims.email,
            action,
            AuditOutcome::Success,
            Some(&email),
            json!({ "role": target_role }),
        );
        Ok(())
    }

    fn protected(&self, actor: &str, action: &str, target: &str, reason: &str) -> VaultError {
        self.ctx.audit(
            actor,
            action,
            AuditOutcome::Denied,
            Some(target),
            json!({ "reason": reason }),
        );
        VaultError::Protected(reason.to_string())
    }

    pub fn reset_password(&self, token: &str, email: &str, new_password: &str) -> VaultResult<()> {
        let email = normalize(email);
        let action = "user.reset-password";
        let claims = self
            .ctx
            .authorize(token, Operation::PasswordReset, action, Some(&email))?;

        let mut doc = self.load()?;
        let Some(record) = doc.users.get(&email) else {
            let err = VaultError::NotFound(format!("user {email}"));
            self.ctx.audit_failure(&claims.email, action, Some(&email), &err);
            return Err(err);
        };
        self.ctx.require_manage(&claims, record.role, action, Some(&email))?;

        let result = (|| -> VaultResult<()> {
            self.validate_password(new_password)?;
            let hash = self.ctx.engine.hash_password(new_password)?;
            if let Some(record) = doc.users.get_mut(&email) {
                record.password_hash = hash;
            }
            self.save(&doc)
        })();
        match &result {
            Ok(()) => self.ctx.audit(&claims.email, action, AuditOutcome::Success, Some(&email), json!({})),
            Err(err) => self.ctx.audit_failure(&claims.email, action, Some(&email), err),
        }
        result
    }

    /// Any authenticated user may change their own password given the current one.
    pub fn change_password(
        &self,
        token: &str,
        current_password: &str,
        new_password: &str,
    ) -> VaultResult<()> {
        let action = "user.change-password";
        let claims = self.ctx.authorize(token, Operation::Read, action, None)?;
        let email = claims.email.clone();
        if let LockoutStatus::Locked { until } = self.guard.check_lockout(&email) {
            self.ctx.audit(
                &email,
                action,
                AuditOutcome::Denied,
                Some(&email),
                json!({ "reason": "account locked", "until": until }),
            );
            return Err(VaultError::AccountLocked { until });
        }

        let mut doc = self.load()?;
        let Some(record) = doc.users.get_mut(&email) else {
            self.ctx.audit(&email, action, AuditOutcome::Denied, Some(&email), json!({ "reason": "unknown account" }));
            return Err(VaultError::InvalidSession);
        };
        if !self.ctx.engine.verify_password(current_password, &record.password_hash) {
            self.guard.record_failure(&email);
            self.ctx.audit(
                &email,
                action,
                AuditOutcome::Denied,
                Some(&email),
                json!({ "reason": "re-authentication failed" }),
            );
            return Err(VaultError::AuthenticationFailed);
        }
        self.guard.record_success(&email);
        if let Err(err) = self.validate_password(new_password) {
            self.ctx.audit_failure(&email, action, Some(&email), &err);
            return Err(err);
        }
        record.password_hash = self.ctx.engine.hash_password(new_password)?;
        self.save(&doc)?;
        self.ctx.audit(&email, action, AuditOutcome::Success, Some(&email), json!({}));
        Ok(())
    }

    pub fn change_user_role(&self, token: &str, email: &str, new_role: Role) -> VaultResult<UserSummary> {
        let email = normalize(email);
        let action = "user.set-role";
        let claims = self
            .ctx
            .authorize(token, Operation::UserModify, action, Some(&email))?;

        let mut doc = self.load()?;
        let Some(record) = doc.users.get(&email) else {
            let err = VaultError::NotFound(format!("user {email}"));
            self.ctx.audit_failure(&claims.email, action, Some(&email), &err);
            return Err(err);
        };
        if record.is_root {
            return Err(self.protected(&claims.email, action, &email, "root account cannot be modified"));
        }
        let old_role = record.role;
        self.ctx.require_manage(&claims, old_role, action, Some(&email))?;
        self.ctx.require_manage(&claims, new_role, action, Some(&email))?;

        let summary = match doc.users.get_mut(&email) {
            Some(record) => {
                record.role = new_role;
                UserSummary::from_record(&email, record)
            }
            None => return Err(VaultError::NotFound(format!("user {email}"))),
        };
        if let Err(err) = self.save(&doc) {
            self.ctx.audit_failure(&claims.email, action, Some(&email), &err);
            return Err(err);
        }
        self.ctx.audit(
            &claims.email,
            action,
            AuditOutcome::Success,
            Some(&email),
            json!({ "from": old_role, "to": new_role }),
        );
        Ok(summary)
    }

    pub fn get_users(&self, token: &str) -> VaultResult<Vec<UserSummary>> {
        self.ctx.authorize(token, Operation::UserView, "user.list", None)?;
        let doc = self.load()?;
        Ok(doc
            .users
            .iter()
            .map(|(email, record)| UserSummary::from_record(email, record))
            .collect())
    }

    fn validate_password(&self, password: &str) -> VaultResult<()> {
        if password.chars().count() < self.min_password_length {
            return Err(VaultError::validation(
                "password",
                format!("must be at least {} characters", self.min_password_length),
            ));
        }
        if password.len() > MAX_PASSWORD_BYTES {
            return Err(VaultError::validation(
                "password",
                format!("must be at most {MAX_PASSWORD_BYTES} bytes"),
            ));
        }
        Ok(())
    }
}

fn validate_email(email: &str) -> VaultResult<()> {
    let invalid = || VaultError::validation("email", "not a valid email address");
    if email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) if !host.is_empty() && !tld.is_empty() => Ok(()),
        _ => Err(invalid()),
    }
}

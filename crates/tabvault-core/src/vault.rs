//! `TabVault`: the facade the UI and import layers talk to.

use chrono::Duration;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::access::VaultContext;
use crate::audit::{AuditEntry, AuditLog, AuditOutcome, ChainCheck};
use crate::config::VaultConfig;
use crate::crypto::CryptoEngine;
use crate::error::{VaultError, VaultResult};
use crate::lockout::AccountGuard;
use crate::permissions::{Operation, Role};
use crate::records::{DataPage, Record, RecordStore};
use crate::schemas::{ActiveSchema, ColumnDef, Schema, SchemaInfo, SchemaStore};
use crate::session::{SessionClaims, SessionTokenService, TokenStatus};
use crate::storage::{EncryptedFile, StagedBlob};
use crate::users::{AuthSession, UserStore, UserSummary};

fn check_config(config: &VaultConfig) -> VaultResult<()> {
    config
        .validate()
        .map_err(|err| VaultError::validation("config", err.to_string()))
}

pub struct TabVault {
    config: VaultConfig,
    ctx: Arc<VaultContext>,
    users: UserStore,
    schemas: Arc<SchemaStore>,
    records: RecordStore,
}

impl TabVault {
    /// Open the stores under `config.data_dir`, creating the salt if needed.
    pub fn open(config: VaultConfig, master_password: Zeroizing<String>) -> VaultResult<Self> {
        check_config(&config)?;
        let engine = CryptoEngine::open(
            &config.salt_path(),
            config.limits.kdf_iterations,
            config.limits.bcrypt_cost,
        )?;
        Self::with_engine(config, engine, master_password)
    }

    pub fn with_engine(
        config: VaultConfig,
        engine: CryptoEngine,
        master_password: Zeroizing<String>,
    ) -> VaultResult<Self> {
        check_config(&config)?;
        let audit = AuditLog::open(config.audit_log_path(), config.audit_max_bytes)?;
        let sessions = SessionTokenService::new(Duration::hours(config.limits.session_hours));
        let ctx = Arc::new(VaultContext::new(engine, sessions, audit, master_password));

        let guard = AccountGuard::new(
            config.limits.max_failed_attempts,
            Duration::minutes(config.limits.lockout_minutes),
        );
        let users = UserStore::new(
            ctx.clone(),
            EncryptedFile::new(config.users_path()),
            guard,
            config.limits.min_password_length,
        );
        let schemas = Arc::new(SchemaStore::new(
            ctx.clone(),
            config.schemas_dir(),
            EncryptedFile::new(config.active_schema_path()),
        ));
        let records = RecordStore::new(ctx.clone(), EncryptedFile::new(config.data_path()), schemas.clone());
        info!(data_dir = %config.data_dir.display(), "vault opened");
        Ok(Self {
            config,
            ctx,
            users,
            schemas,
            records,
        })
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn users(&self) -> &UserStore {
        &self.users
    }

    pub fn sessions(&self) -> &SessionTokenService {
        &self.ctx.sessions
    }

    /// First-run setup. Returns `true` when the root account was created.
    pub fn bootstrap_root(&self, email: &str, password: &str) -> VaultResult<bool> {
        self.users.bootstrap_root(email, password)
    }

    pub fn authenticate(&self, email: &str, password: &str) -> VaultResult<AuthSession> {
        self.users.authenticate(email, password)
    }

    pub fn session_status(&self, token: &str) -> TokenStatus {
        self.ctx.sessions.status(token)
    }

    pub fn verify_token(&self, token: &str) -> Option<SessionClaims> {
        self.ctx.sessions.verify(token)
    }

    pub fn logout(&self, token: &str) -> VaultResult<()> {
        let Some(claims) = self.ctx.sessions.verify(token) else {
            return Err(VaultError::InvalidSession);
        };
        self.ctx.sessions.revoke(token);
        self.ctx
            .audit(&claims.email, "auth.logout", AuditOutcome::Success, None, json!({}));
        Ok(())
    }

    pub fn create_user(
        &self,
        token: &str,
        email: &str,
        password: &str,
        role: Role,
    ) -> VaultResult<UserSummary> {
        self.users.create_user(token, email, password, role)
    }

    pub fn delete_user(&self, token: &str, email: &str) -> VaultResult<()> {
        self.users.delete_user(token, email)
    }

    pub fn reset_password(&self, token: &str, email: &str, new_password: &str) -> VaultResult<()> {
        self.users.reset_password(token, email, new_password)
    }

    pub fn change_password(&self, token: &str, current: &str, new_password: &str) -> VaultResult<()> {
        self.users.change_password(token, current, new_password)
    }

    pub fn change_user_role(&self, token: &str, email: &str, role: Role) -> VaultResult<UserSummary> {
        self.users.change_user_role(token, email, role)
    }

    pub fn get_users(&self, token: &str) -> VaultResult<Vec<UserSummary>> {
        self.users.get_users(token)
    }

    pub fn create_schema(&self, token: &str, name: &str, columns: Vec<ColumnDef>) -> VaultResult<Schema> {
        self.schemas.create_schema(token, name, columns)
    }

    pub fn import_schema(&self, token: &str, name: &str, path: &Path) -> VaultResult<Schema> {
        self.schemas.import_schema(token, name, path)
    }

    pub fn export_schema(&self, token: &str, name: &str, path: &Path) -> VaultResult<()> {
        self.schemas.export_schema(token, name, path)
    }

    pub fn list_schemas(&self, token: &str) -> VaultResult<Vec<SchemaInfo>> {
        self.schemas.list_schemas(token)
    }

    pub fn get_schema(&self, token: &str, name: &str) -> VaultResult<Schema> {
        self.schemas.get_schema(token, name)
    }

    pub fn set_active_schema(&self, token: &str, name: &str) -> VaultResult<ActiveSchema> {
        self.schemas.set_active_schema(token, name)
    }

    pub fn get_active_schema(&self, token: &str) -> VaultResult<Option<ActiveSchema>> {
        self.schemas.get_active_schema(token)
    }

    pub fn add_record(&self, token: &str, fields: Record) -> VaultResult<usize> {
        self.records.add_record(token, fields)
    }

    pub fn update_record(&self, token: &str, index: usize, fields: Record) -> VaultResult<Record> {
        self.records.update_record(token, index, fields)
    }

    pub fn delete_record(&self, token: &str, index: usize) -> VaultResult<Record> {
        self.records.delete_record(token, index)
    }

    pub fn get_data(&self, token: &str, page: usize, page_size: usize) -> VaultResult<DataPage> {
        self.records.get_data(token, page, page_size)
    }

    pub fn import_tabular_file(&self, token: &str, rows: Vec<Record>) -> VaultResult<usize> {
        self.records.import_tabular_file(token, rows)
    }

    /// Most recent audit entries first. Requires user-view.
    pub fn audit_tail(&self, token: &str, limit: usize) -> VaultResult<Vec<AuditEntry>> {
        self.ctx.authorize(token, Operation::UserView, "audit.read", None)?;
        self.ctx.audit.read_recent(None, Some(limit))
    }

    pub fn verify_audit(&self, token: &str) -> VaultResult<ChainCheck> {
        self.ctx.authorize(token, Operation::UserView, "audit.verify", None)?;
        let check = self.ctx.audit.verify_chain()?;
        if let ChainCheck::Broken { line, reason } = &check {
            warn!(line, reason = %reason, "audit chain broken");
        }
        Ok(check)
    }

    /// Re-encrypt every store under `new_master_password`. Root only.
    ///
    /// All files are decrypted and the new versions staged before any is
    /// replaced, so an unreadable file aborts the rekey with nothing changed.
    pub fn rekey(&self, token: &str, new_master_password: &str) -> VaultResult<usize> {
        let action = "vault.rekey";
        let claims = self.require_root(token, action, None)?;
        if new_master_password.is_empty() {
            return Err(VaultError::validation("master_password", "must not be empty"));
        }

        let result = self.reencrypt_all(new_master_password);
        match &result {
            Ok(files) => {
                self.ctx
                    .set_master_password(Zeroizing::new(new_master_password.to_string()));
                info!(files, "stores re-encrypted under new master password");
                self.ctx
                    .audit(&claims.email, action, AuditOutcome::Success, None, json!({ "files": files }))
            }
            Err(err) => self.ctx.audit_failure(&claims.email, action, None, err),
        }
        result
    }

    /// Move every store to `target_dir`, encrypted under `new_master_password`,
    /// and return the vault opened there. Root only.
    ///
    /// The salt and the audit trail are copied along and sessions stay valid.
    /// The old store files are removed once the new vault has opened; on any
    /// earlier failure the target is cleaned up and the old stores are intact.
    /// `self` must not be used after a successful move.
    pub fn relocate(
        &self,
        token: &str,
        target_dir: &Path,
        new_master_password: Zeroizing<String>,
    ) -> VaultResult<TabVault> {
        let action = "vault.relocate";
        let target = target_dir.display().to_string();
        let claims = self.require_root(token, action, Some(&target))?;
        if new_master_password.is_empty() {
            return Err(VaultError::validation("master_password", "must not be empty"));
        }

        let result = self.move_stores(target_dir, new_master_password);
        match &result {
            Ok((moved, files)) => {
                info!(from = %self.config.data_dir.display(), to = %target, files, "vault relocated");
                moved.ctx.audit(
                    &claims.email,
                    action,
                    AuditOutcome::Success,
                    Some(&target),
                    json!({ "files": files, "from": self.config.data_dir.display().to_string() }),
                );
            }
            Err(err) => self.ctx.audit_failure(&claims.email, action, Some(&target), err),
        }
        result.map(|(moved, _)| moved)
    }

    fn require_root(&self, token: &str, action: &str, target: Option<&str>) -> VaultResult<SessionClaims> {
        let claims = self
            .ctx
            .authorize(token, Operation::SchemaModify, action, target)?;
        if claims.role != Role::Root {
            self.ctx.audit(
                &claims.email,
                action,
                AuditOutcome::Denied,
                target,
                json!({ "reason": "root only", "role": claims.role }),
            );
            return Err(VaultError::PermissionDenied);
        }
        Ok(claims)
    }

    /// Every store that currently exists, decrypted.
    fn decrypt_all(&self, password: &str) -> VaultResult<Vec<(EncryptedFile, Value)>> {
        let mut files = vec![self.users.file().clone(), self.records.file().clone()];
        files.extend(self.schemas.files()?);

        let mut plain = Vec::new();
        for file in files {
            if let Some(value) = file.load::<Value>(&self.ctx.engine, password)? {
                plain.push((file, value));
            }
        }
        Ok(plain)
    }

    fn stage_all<'a>(
        &self,
        entries: impl IntoIterator<Item = (&'a EncryptedFile, &'a Value)>,
        password: &str,
    ) -> VaultResult<Vec<StagedBlob>> {
        entries
            .into_iter()
            .map(|(file, value)| -> VaultResult<StagedBlob> {
                let blob = self.ctx.engine.encrypt(value, password)?;
                file.stage_blob(&blob)
            })
            .collect()
    }

    fn reencrypt_all(&self, new_master_password: &str) -> VaultResult<usize> {
        let old = self.ctx.master_password();
        let plain = self.decrypt_all(&old)?;
        let staged = self.stage_all(plain.iter().map(|(file, value)| (file, value)), new_master_password)?;
        match commit_all(staged) {
            Ok(count) => Ok(count),
            Err((committed, err)) => {
                for (file, value) in &plain[..committed] {
                    if let Err(restore) = file.save(&self.ctx.engine, &old, value) {
                        warn!(path = %file.path().display(), "could not restore file after failed rekey: {restore}");
                    }
                }
                Err(err)
            }
        }
    }

    fn move_stores(
        &self,
        target_dir: &Path,
        new_master_password: Zeroizing<String>,
    ) -> VaultResult<(TabVault, usize)> {
        let from = &self.config.data_dir;
        fs::create_dir_all(target_dir)?;
        if fs::canonicalize(target_dir)? == fs::canonicalize(from)? {
            return Err(VaultError::validation("data_dir", "target is the current data directory"));
        }
        let mut config = self.config.clone();
        config.data_dir = target_dir.to_path_buf();

        let old = self.ctx.master_password();
        let plain = self.decrypt_all(&old)?;
        let mut moved: Vec<(EncryptedFile, &Value)> = Vec::with_capacity(plain.len());
        for (file, value) in &plain {
            moved.push((EncryptedFile::new(rebase(file.path(), from, target_dir)?), value));
        }
        let mut copies = vec![(self.config.salt_path(), config.salt_path())];
        for log in self.ctx.audit.files() {
            copies.push((log.clone(), rebase(&log, from, target_dir)?));
        }
        for path in moved
            .iter()
            .map(|(file, _)| file.path())
            .chain(copies.iter().map(|(_, to)| to.as_path()))
        {
            if path.exists() {
                return Err(VaultError::Conflict(path.display().to_string()));
            }
        }

        let mut created: Vec<PathBuf> = Vec::new();
        let result = (|| -> VaultResult<TabVault> {
            for (src, dst) in &copies {
                if let Some(parent) = dst.parent() {
                    fs::create_dir_all(parent)?;
                }
                created.push(dst.clone());
                fs::copy(src, dst)?;
            }
            let staged = self.stage_all(moved.iter().map(|(file, value)| (file, *value)), &new_master_password)?;
            created.extend(staged.iter().map(|blob| blob.path().to_path_buf()));
            commit_all(staged).map_err(|(_, err)| err)?;

            let vault = TabVault::open(config, new_master_password)?;
            vault.ctx.sessions.inherit_revocations(&self.ctx.sessions);
            Ok(vault)
        })();
        let vault = match result {
            Ok(vault) => vault,
            Err(err) => {
                for path in &created {
                    if let Err(cleanup) = fs::remove_file(path) {
                        if cleanup.kind() != std::io::ErrorKind::NotFound {
                            warn!(path = %path.display(), "could not clean up relocation target: {cleanup}");
                        }
                    }
                }
                return Err(err);
            }
        };

        for (file, _) in &plain {
            if let Err(err) = file.remove() {
                warn!(path = %file.path().display(), "could not remove relocated store: {err}");
            }
        }
        Ok((vault, moved.len()))
    }
}

/// Rename every staged file into place. On failure, also reports how many
/// were already committed.
fn commit_all(staged: Vec<StagedBlob>) -> Result<usize, (usize, VaultError)> {
    let mut committed = 0;
    for blob in staged {
        blob.commit().map_err(|err| (committed, err))?;
        committed += 1;
    }
    Ok(committed)
}

fn rebase(path: &Path, from: &Path, to: &Path) -> VaultResult<PathBuf> {
    path.strip_prefix(from).map(|rel| to.join(rel)).map_err(|_| {
        VaultError::validation("data_dir", format!("{} is outside the data directory", path.display()))
    })
}

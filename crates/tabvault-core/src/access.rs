//! Shared state for the access-controlled stores and the authorization gate
//! every store operation passes through.

use parking_lot::RwLock;
use serde_json::json;
use tracing::warn;
use zeroize::Zeroizing;

use crate::audit::{AuditLog, AuditOutcome};
use crate::crypto::CryptoEngine;
use crate::error::{VaultError, VaultResult};
use crate::permissions::{can_manage_role, has_permission, Operation, Role};
use crate::session::{SessionClaims, SessionTokenService, TokenStatus};

const ANONYMOUS: &str = "anonymous";

pub struct VaultContext {
    pub engine: CryptoEngine,
    pub sessions: SessionTokenService,
    pub audit: AuditLog,
    master_password: RwLock<Zeroizing<String>>,
}

impl VaultContext {
    pub fn new(
        engine: CryptoEngine,
        sessions: SessionTokenService,
        audit: AuditLog,
        master_password: Zeroizing<String>,
    ) -> Self {
        Self {
            engine,
            sessions,
            audit,
            master_password: RwLock::new(master_password),
        }
    }

    pub(crate) fn master_password(&self) -> Zeroizing<String> {
        self.master_password.read().clone()
    }

    pub(crate) fn set_master_password(&self, password: Zeroizing<String>) {
        *self.master_password.write() = password;
    }

    /// Resolve `token` and require `operation`. Denials are audited.
    pub fn authorize(
        &self,
        token: &str,
        operation: Operation,
        action: &str,
        target: Option<&str>,
    ) -> VaultResult<SessionClaims> {
        let claims = match self.sessions.status(token) {
            TokenStatus::Valid(claims) => claims,
            status => {
                let reason = match status {
                    TokenStatus::Expired => "expired session",
                    TokenStatus::Revoked => "revoked session",
                    _ => "invalid session",
                };
                self.audit(ANONYMOUS, action, AuditOutcome::Denied, target, json!({ "reason": reason }));
                return Err(VaultError::InvalidSession);
            }
        };
        if !has_permission(claims.role, operation) {
            self.audit(
                &claims.email,
                action,
                AuditOutcome::Denied,
                target,
                json!({ "reason": "insufficient permissions", "role": claims.role, "required": operation }),
            );
            return Err(VaultError::PermissionDenied);
        }
        Ok(claims)
    }

    /// Require that the caller may manage accounts holding `target_role`.
    pub fn require_manage(
        &self,
        claims: &SessionClaims,
        target_role: Role,
        action: &str,
        target: Option<&str>,
    ) -> VaultResult<()> {
        if can_manage_role(claims.role, target_role) {
            return Ok(());
        }
        self.audit(
            &claims.email,
            action,
            AuditOutcome::Denied,
            target,
            json!({ "reason": "cannot manage role", "role": claims.role, "target_role": target_role }),
        );
        Err(VaultError::PermissionDenied)
    }

    /// Append to the audit trail. A failed write is logged, not propagated.
    pub fn audit(
        &self,
        actor: &str,
        action: &str,
        outcome: AuditOutcome,
        target: Option<&str>,
        detail: serde_json::Value,
    ) {
        if let Err(err) = self.audit.record(actor, action, outcome, target, detail) {
            warn!(actor, action, "audit write failed: {err}");
        }
    }

    /// Audit a failed operation, keeping security-sensitive detail out of the trail.
    pub fn audit_failure(&self, actor: &str, action: &str, target: Option<&str>, err: &VaultError) {
        let reason = if err.is_security_sensitive() {
            "rejected".to_string()
        } else {
            err.to_string()
        };
        self.audit(actor, action, AuditOutcome::Failed, target, json!({ "reason": reason }));
    }
}

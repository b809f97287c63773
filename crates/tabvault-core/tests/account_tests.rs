//! Account management through the facade.
//!
//! Tests cover:
//!  1. Password changes require the current password
//!  2. Password resets follow role delegation
//!  3. Role changes check both the old and the new role
//!  4. Deletion rules and audit of denials
//!  5. Input validation on new accounts

mod common;

use common::*;
use tabvault_core::audit::AuditOutcome;
use tabvault_core::{Role, VaultError};

// ─── Test 1: Change password ────────────────────────────────────────────────

#[test]
fn test_change_password_requires_current() {
    let fx = fixture();
    let member = fx.login_as("member@tabvault.test", Role::User);

    let err = fx
        .vault
        .change_password(&member, "not-my-password", "brand-new-pass")
        .unwrap_err();
    assert!(matches!(err, VaultError::AuthenticationFailed));

    fx.vault
        .change_password(&member, "member-passw0rd", "brand-new-pass")
        .unwrap();
    assert!(fx
        .vault
        .authenticate("member@tabvault.test", "member-passw0rd")
        .is_err());
    fx.vault
        .authenticate("member@tabvault.test", "brand-new-pass")
        .unwrap();
}

#[test]
fn test_change_password_enforces_length() {
    let fx = fixture();
    let err = fx
        .vault
        .change_password(&fx.root_token, ROOT_PASSWORD, "short")
        .unwrap_err();
    assert!(matches!(err, VaultError::Validation { .. }));
    fx.vault.authenticate(ROOT_EMAIL, ROOT_PASSWORD).unwrap();
}

#[test]
fn test_change_password_guesses_lock_the_account() {
    let fx = fixture();
    let member = fx.login_as("member@tabvault.test", Role::User);
    for _ in 0..5 {
        assert!(matches!(
            fx.vault.change_password(&member, "a-wrong-guess", "brand-new-pass"),
            Err(VaultError::AuthenticationFailed)
        ));
    }
    assert_eq!(fx.vault.users().guard().failure_count("member@tabvault.test"), 5);

    // even the right password is refused while locked
    assert!(matches!(
        fx.vault.change_password(&member, "member-passw0rd", "brand-new-pass"),
        Err(VaultError::AccountLocked { .. })
    ));
    assert!(matches!(
        fx.vault.authenticate("member@tabvault.test", "member-passw0rd"),
        Err(VaultError::AccountLocked { .. })
    ));
}

// ─── Test 2: Reset password ─────────────────────────────────────────────────

#[test]
fn test_reset_password_follows_delegation() {
    let fx = fixture();
    let admin = fx.login_as("admin@tabvault.test", Role::Admin);
    fx.login_as("member@tabvault.test", Role::User);
    let moderator = fx.login_as("mod@tabvault.test", Role::Moderator);

    fx.vault
        .reset_password(&admin, "member@tabvault.test", "reset-passw0rd")
        .unwrap();
    fx.vault
        .authenticate("member@tabvault.test", "reset-passw0rd")
        .unwrap();

    assert!(matches!(
        fx.vault.reset_password(&admin, ROOT_EMAIL, "takeover-pass"),
        Err(VaultError::PermissionDenied)
    ));
    assert!(matches!(
        fx.vault
            .reset_password(&moderator, "member@tabvault.test", "reset-passw0rd"),
        Err(VaultError::PermissionDenied)
    ));
    assert!(matches!(
        fx.vault
            .reset_password(&admin, "nobody@tabvault.test", "reset-passw0rd"),
        Err(VaultError::NotFound(_))
    ));
}

// ─── Test 3: Role changes ───────────────────────────────────────────────────

#[test]
fn test_role_change_checks_both_roles() {
    let fx = fixture();
    let admin = fx.login_as("admin@tabvault.test", Role::Admin);
    fx.login_as("member@tabvault.test", Role::User);

    let promoted = fx
        .vault
        .change_user_role(&admin, "member@tabvault.test", Role::Moderator)
        .unwrap();
    assert_eq!(promoted.role, Role::Moderator);

    assert!(matches!(
        fx.vault
            .change_user_role(&admin, "member@tabvault.test", Role::Admin),
        Err(VaultError::PermissionDenied)
    ));

    fx.vault
        .change_user_role(&fx.root_token, "member@tabvault.test", Role::Admin)
        .unwrap();
    assert!(matches!(
        fx.vault
            .change_user_role(&admin, "member@tabvault.test", Role::User),
        Err(VaultError::PermissionDenied)
    ));
}

#[test]
fn test_root_role_is_immutable() {
    let fx = fixture();
    assert!(matches!(
        fx.vault
            .change_user_role(&fx.root_token, ROOT_EMAIL, Role::Admin),
        Err(VaultError::Protected(_))
    ));
    let users = fx.vault.get_users(&fx.root_token).unwrap();
    assert_eq!(users[0].role, Role::Root);
}

// ─── Test 4: Deletion ───────────────────────────────────────────────────────

#[test]
fn test_delete_user_rules() {
    let fx = fixture();
    let admin = fx.login_as("admin@tabvault.test", Role::Admin);
    let moderator = fx.login_as("mod@tabvault.test", Role::Moderator);
    fx.login_as("member@tabvault.test", Role::User);

    assert!(matches!(
        fx.vault.delete_user(&moderator, "member@tabvault.test"),
        Err(VaultError::PermissionDenied)
    ));
    assert!(matches!(
        fx.vault.delete_user(&admin, "ghost@tabvault.test"),
        Err(VaultError::NotFound(_))
    ));

    fx.vault.delete_user(&admin, "member@tabvault.test").unwrap();
    fx.vault.delete_user(&fx.root_token, "admin@tabvault.test").unwrap();

    let emails: Vec<String> = fx
        .vault
        .get_users(&fx.root_token)
        .unwrap()
        .into_iter()
        .map(|u| u.email)
        .collect();
    assert_eq!(emails, vec!["mod@tabvault.test", ROOT_EMAIL]);

    // deleted accounts can no longer log in
    assert!(fx
        .vault
        .authenticate("admin@tabvault.test", "member-passw0rd")
        .is_err());
}

#[test]
fn test_denials_are_audited() {
    let fx = fixture();
    let member = fx.login_as("member@tabvault.test", Role::User);
    let _ = fx.vault.get_users(&member);
    let _ = fx.vault.delete_user(&fx.root_token, ROOT_EMAIL);

    let entries = fx.vault.audit_tail(&fx.root_token, 10).unwrap();
    let protected = &entries[0];
    assert_eq!(protected.action, "user.delete");
    assert_eq!(protected.outcome, AuditOutcome::Denied);
    assert_eq!(protected.target.as_deref(), Some(ROOT_EMAIL));

    let viewed = &entries[1];
    assert_eq!(viewed.action, "user.list");
    assert_eq!(viewed.actor, "member@tabvault.test");
    assert_eq!(viewed.outcome, AuditOutcome::Denied);
}

// ─── Test 5: Validation ─────────────────────────────────────────────────────

#[test]
fn test_new_account_validation() {
    let fx = fixture();
    let t = &fx.root_token;
    assert!(matches!(
        fx.vault.create_user(t, "not-an-email", "long-enough-pw", Role::User),
        Err(VaultError::Validation { .. })
    ));
    assert!(matches!(
        fx.vault.create_user(t, "short@tabvault.test", "short", Role::User),
        Err(VaultError::Validation { .. })
    ));
    let too_long = "x".repeat(80);
    assert!(matches!(
        fx.vault.create_user(t, "long@tabvault.test", &too_long, Role::User),
        Err(VaultError::Validation { .. })
    ));
    assert!(matches!(
        fx.vault.create_user(t, "second-root@tabvault.test", "long-enough-pw", Role::Root),
        Err(VaultError::PermissionDenied)
    ));

    fx.vault
        .create_user(t, "Mixed.Case@TabVault.test", "long-enough-pw", Role::User)
        .unwrap();
    assert!(matches!(
        fx.vault.create_user(t, "mixed.case@tabvault.test", "long-enough-pw", Role::User),
        Err(VaultError::Conflict(_))
    ));
    fx.vault
        .authenticate("MIXED.case@tabvault.test", "long-enough-pw")
        .unwrap();
}

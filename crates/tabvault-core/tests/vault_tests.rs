//! Whole-vault behaviour: encryption at rest, master password handling and
//! the audit trail.

mod common;

use common::*;
use serde_json::json;
use std::fs;
use tabvault_core::audit::ChainCheck;
use tabvault_core::{CryptoError, Role, TabVault, VaultError};
use zeroize::Zeroizing;

#[test]
fn test_store_files_hold_no_plaintext() {
    let fx = fixture();
    fx.activate_people_schema();
    fx.vault
        .add_record(&fx.root_token, record(json!({ "name": "Ada Lovelace", "age": 36 })))
        .unwrap();

    let users = fs::read_to_string(fx.dir.path().join("users.enc")).unwrap();
    assert!(!users.contains(ROOT_EMAIL));
    let data = fs::read_to_string(fx.dir.path().join("database.enc")).unwrap();
    assert!(!data.contains("Ada Lovelace"));
    assert_eq!(fs::read(fx.dir.path().join("salt.key")).unwrap().len(), 32);
}

#[test]
fn test_wrong_master_password_is_generic() {
    let fx = fixture();
    let wrong = open_vault(fx.dir.path(), "not the master password");
    let err = wrong.authenticate(ROOT_EMAIL, ROOT_PASSWORD).unwrap_err();
    assert!(matches!(err, VaultError::Crypto(CryptoError::Decrypt)));
    assert_eq!(err.to_string(), "decryption failed");
    // a wrong master password is not a login failure
    assert_eq!(wrong.users().guard().failure_count(ROOT_EMAIL), 0);
}

#[test]
fn test_oversized_session_lifetime_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.limits.session_hours = 10_000_000_000_000;
    let result = TabVault::open(config, Zeroizing::new(MASTER.to_string()));
    assert!(matches!(result, Err(VaultError::Validation { .. })));
    assert!(!dir.path().join("salt.key").exists());
}

#[test]
fn test_corrupted_store_is_generic() {
    let fx = fixture();
    let path = fx.dir.path().join("users.enc");
    let mut bytes = fs::read(&path).unwrap();
    bytes[3] = 0xFF;
    fs::write(&path, bytes).unwrap();

    let err = fx.vault.authenticate(ROOT_EMAIL, ROOT_PASSWORD).unwrap_err();
    assert!(matches!(err, VaultError::Crypto(CryptoError::Decrypt)));
    assert_eq!(err.to_string(), "decryption failed");
}

#[test]
fn test_rekey_reencrypts_everything() {
    let fx = fixture();
    fx.activate_people_schema();
    fx.vault
        .add_record(&fx.root_token, record(json!({ "name": "Ada", "age": 36 })))
        .unwrap();
    let before = fs::read_to_string(fx.dir.path().join("database.enc")).unwrap();

    let files = fx.vault.rekey(&fx.root_token, "a new master password").unwrap();
    // users, data, one schema, active schema
    assert_eq!(files, 4);
    assert_ne!(fs::read_to_string(fx.dir.path().join("database.enc")).unwrap(), before);

    // the running vault switched over
    assert_eq!(fx.row_count(), 1);

    let old = open_vault(fx.dir.path(), MASTER);
    assert!(matches!(
        old.authenticate(ROOT_EMAIL, ROOT_PASSWORD),
        Err(VaultError::Crypto(_))
    ));
    let new = open_vault(fx.dir.path(), "a new master password");
    let token = new.authenticate(ROOT_EMAIL, ROOT_PASSWORD).unwrap().token;
    assert_eq!(new.get_data(&token, 1, 10).unwrap().data.len(), 1);
    assert_eq!(new.get_schema(&token, "people").unwrap().columns.len(), 3);
}

#[test]
fn test_rekey_is_root_only() {
    let fx = fixture();
    let admin = fx.login_as("admin@tabvault.test", Role::Admin);
    assert!(matches!(
        fx.vault.rekey(&admin, "a new master password"),
        Err(VaultError::PermissionDenied)
    ));
    let reopened = open_vault(fx.dir.path(), MASTER);
    reopened.authenticate(ROOT_EMAIL, ROOT_PASSWORD).unwrap();
}

#[test]
fn test_audit_chain_and_secrecy() {
    let fx = fixture();
    fx.activate_people_schema();
    let member = fx.login_as("member@tabvault.test", Role::User);
    let _ = fx.vault.add_record(&member, record(json!({ "name": "x", "age": 1 })));
    let _ = fx.vault.authenticate(ROOT_EMAIL, "wrong-password");
    fx.vault
        .reset_password(&fx.root_token, "member@tabvault.test", "fresh-passw0rd")
        .unwrap();

    match fx.vault.verify_audit(&fx.root_token).unwrap() {
        ChainCheck::Intact { entries } => assert!(entries >= 8),
        broken => panic!("chain broken: {broken:?}"),
    }

    let text = fs::read_to_string(fx.dir.path().join("logs").join("audit.log")).unwrap();
    for secret in [ROOT_PASSWORD, "member-passw0rd", "fresh-passw0rd", "wrong-password", MASTER] {
        assert!(!text.contains(secret), "audit log leaked {secret}");
    }
    assert!(!text.contains(&fx.root_token));
    assert!(!text.contains(&member));
    assert!(!text.contains("$2b$"));

    let tail = fx.vault.audit_tail(&fx.root_token, 1).unwrap();
    assert_eq!(tail[0].action, "user.reset-password");
    assert!(matches!(
        fx.vault.audit_tail(&member, 1),
        Err(VaultError::PermissionDenied)
    ));
}

#[test]
fn test_relocate_moves_every_store() {
    let fx = fixture();
    fx.activate_people_schema();
    fx.vault
        .add_record(&fx.root_token, record(json!({ "name": "Ada", "age": 36 })))
        .unwrap();
    let member = fx.login_as("member@tabvault.test", Role::User);
    fx.vault.logout(&member).unwrap();

    let elsewhere = tempfile::tempdir().unwrap();
    let target = elsewhere.path().join("moved");
    let moved = fx
        .vault
        .relocate(&fx.root_token, &target, Zeroizing::new("a new master password".to_string()))
        .unwrap();

    for name in ["users.enc", "database.enc"] {
        assert!(!fx.dir.path().join(name).exists(), "{name} left behind");
        assert!(target.join(name).exists(), "{name} not moved");
    }
    assert!(!fx.dir.path().join("schemas").join("people.enc").exists());
    assert!(target.join("schemas").join("active_schema.enc").exists());

    // sessions survive the move, revocations included
    assert_eq!(moved.get_data(&fx.root_token, 1, 10).unwrap().data.len(), 1);
    assert!(moved.verify_token(&member).is_none());

    match moved.verify_audit(&fx.root_token).unwrap() {
        ChainCheck::Intact { entries } => assert!(entries > 1),
        broken => panic!("chain broken: {broken:?}"),
    }
    assert_eq!(moved.audit_tail(&fx.root_token, 1).unwrap()[0].action, "vault.relocate");

    let reopened = open_vault(&target, "a new master password");
    let token = reopened.authenticate(ROOT_EMAIL, ROOT_PASSWORD).unwrap().token;
    assert_eq!(reopened.get_schema(&token, "people").unwrap().columns.len(), 3);
}

#[test]
fn test_relocate_refusals_leave_stores_in_place() {
    let fx = fixture();
    let admin = fx.login_as("admin@tabvault.test", Role::Admin);
    let elsewhere = tempfile::tempdir().unwrap();
    let new_master = || Zeroizing::new("a new master password".to_string());

    assert!(matches!(
        fx.vault.relocate(&admin, elsewhere.path(), new_master()),
        Err(VaultError::PermissionDenied)
    ));
    assert!(matches!(
        fx.vault.relocate(&fx.root_token, fx.dir.path(), new_master()),
        Err(VaultError::Validation { .. })
    ));

    fs::write(elsewhere.path().join("users.enc"), "occupied").unwrap();
    assert!(matches!(
        fx.vault.relocate(&fx.root_token, elsewhere.path(), new_master()),
        Err(VaultError::Conflict(_))
    ));
    assert_eq!(fs::read_to_string(elsewhere.path().join("users.enc")).unwrap(), "occupied");
    assert!(!elsewhere.path().join("salt.key").exists());

    fx.vault.authenticate(ROOT_EMAIL, ROOT_PASSWORD).unwrap();
    assert_eq!(fx.vault.get_users(&fx.root_token).unwrap().len(), 2);
}

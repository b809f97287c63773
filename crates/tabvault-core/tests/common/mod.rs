#![allow(dead_code)]

use serde_json::Value;
use std::path::Path;
use tabvault_core::{ColumnDef, ColumnType, Record, Role, TabVault, VaultConfig};
use tempfile::{tempdir, TempDir};
use zeroize::Zeroizing;

pub const MASTER: &str = "correct horse battery staple";
pub const ROOT_EMAIL: &str = "root@tabvault.test";
pub const ROOT_PASSWORD: &str = "r00t-passw0rd";

pub struct Fixture {
    pub dir: TempDir,
    pub vault: TabVault,
    pub root_token: String,
}

/// Cheap work factors; the file formats are the same as production.
pub fn test_config(dir: &Path) -> VaultConfig {
    let mut config = VaultConfig::in_dir(dir);
    config.limits.kdf_iterations = 1_000;
    config.limits.bcrypt_cost = 4;
    config
}

pub fn open_vault(dir: &Path, master: &str) -> TabVault {
    TabVault::open(test_config(dir), Zeroizing::new(master.to_string())).unwrap()
}

/// A bootstrapped vault with a logged-in root session.
pub fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    let vault = open_vault(dir.path(), MASTER);
    assert!(vault.bootstrap_root(ROOT_EMAIL, ROOT_PASSWORD).unwrap());
    let root_token = vault.authenticate(ROOT_EMAIL, ROOT_PASSWORD).unwrap().token;
    Fixture {
        dir,
        vault,
        root_token,
    }
}

impl Fixture {
    /// Create an account with `role` through root and log it in.
    pub fn login_as(&self, email: &str, role: Role) -> String {
        let password = "member-passw0rd";
        self.vault
            .create_user(&self.root_token, email, password, role)
            .unwrap();
        self.vault.authenticate(email, password).unwrap().token
    }

    /// Create and activate the `people` schema: name TEXT (alias "Full Name"),
    /// age NUMBER required, score NUMBER nullable.
    pub fn activate_people_schema(&self) {
        self.vault
            .create_schema(
                &self.root_token,
                "people",
                vec![
                    ColumnDef::new("name", ColumnType::Text, false).with_alias("Full Name"),
                    ColumnDef::new("age", ColumnType::Number, false),
                    ColumnDef::new("score", ColumnType::Number, true),
                ],
            )
            .unwrap();
        self.vault
            .set_active_schema(&self.root_token, "people")
            .unwrap();
    }

    pub fn row_count(&self) -> usize {
        self.vault
            .get_data(&self.root_token, 1, 100)
            .unwrap()
            .metadata
            .row_count
    }
}

pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

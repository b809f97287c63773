//! Schemas and records through the facade.
//!
//! Tests cover:
//!  1. Schema lifecycle: create, list, activate, export, import
//!  2. Record add/update/delete with validation
//!  3. Pagination
//!  4. Tabular import is all-or-nothing
//!  5. Role limits on record operations

mod common;

use common::*;
use serde_json::json;
use std::fs;
use tabvault_core::{ColumnDef, ColumnType, Role, VaultError};

// ─── Test 1: Schema lifecycle ───────────────────────────────────────────────

#[test]
fn test_schema_lifecycle() {
    let fx = fixture();
    let t = &fx.root_token;
    assert!(fx.vault.get_active_schema(t).unwrap().is_none());
    fx.activate_people_schema();

    let err = fx
        .vault
        .create_schema(t, "people", vec![ColumnDef::new("x", ColumnType::Text, true)])
        .unwrap_err();
    assert!(matches!(err, VaultError::Conflict(_)));
    assert!(matches!(
        fx.vault
            .create_schema(t, "bad name", vec![ColumnDef::new("x", ColumnType::Text, true)]),
        Err(VaultError::Validation { .. })
    ));

    let exported = fx.dir.path().join("people.json");
    fx.vault.export_schema(t, "people", &exported).unwrap();
    let plain: serde_json::Value = serde_json::from_str(&fs::read_to_string(&exported).unwrap()).unwrap();
    assert_eq!(plain["columns"][1]["name"], "age");
    assert_eq!(plain["columns"][1]["type"], "NUMBER");
    assert_eq!(plain["metadata"]["created_by"], ROOT_EMAIL);

    let imported = fx.vault.import_schema(t, "peoplecopy", &exported).unwrap();
    assert_eq!(imported.columns.len(), 3);
    assert_eq!(imported.columns[0].excel_column, "Full Name");

    let listed = fx.vault.list_schemas(t).unwrap();
    let names: Vec<&str> = listed.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["people", "peoplecopy"]);
    assert!(listed[0].active);
    assert!(!listed[1].active);

    let active = fx.vault.get_active_schema(t).unwrap().unwrap();
    assert_eq!(active.metadata.name, "people");
    assert_eq!(active.metadata.activated_by, ROOT_EMAIL);

    assert!(matches!(
        fx.vault.get_schema(t, "missing"),
        Err(VaultError::NotFound(_))
    ));
    assert!(matches!(
        fx.vault.set_active_schema(t, "missing"),
        Err(VaultError::NotFound(_))
    ));
}

#[test]
fn test_schema_import_rejects_malformed_file() {
    let fx = fixture();
    let path = fx.dir.path().join("broken.json");
    fs::write(&path, r#"{"columns": [{"name": "a", "type": "DATE"}]}"#).unwrap();
    assert!(matches!(
        fx.vault.import_schema(&fx.root_token, "broken", &path),
        Err(VaultError::Validation { .. })
    ));
    assert!(fx.vault.list_schemas(&fx.root_token).unwrap().is_empty());
}

#[test]
fn test_schema_files_are_encrypted() {
    let fx = fixture();
    fx.activate_people_schema();
    let on_disk = fs::read_to_string(fx.dir.path().join("schemas").join("people.enc")).unwrap();
    assert!(!on_disk.contains("Full Name"));
    let active = fs::read_to_string(fx.dir.path().join("schemas").join("active_schema.enc")).unwrap();
    assert!(!active.contains("people"));
}

// ─── Test 2: Record mutations ───────────────────────────────────────────────

#[test]
fn test_records_require_active_schema() {
    let fx = fixture();
    assert!(matches!(
        fx.vault
            .add_record(&fx.root_token, record(json!({ "name": "Ada", "age": 36 }))),
        Err(VaultError::NoActiveSchema)
    ));
}

#[test]
fn test_add_update_delete_record() {
    let fx = fixture();
    fx.activate_people_schema();
    let t = &fx.root_token;

    let index = fx
        .vault
        .add_record(t, record(json!({ "Full Name": "Ada", "age": "36", "ignored": 1 })))
        .unwrap();
    assert_eq!(index, 0);

    let updated = fx
        .vault
        .update_record(t, 0, record(json!({ "score": 9.5 })))
        .unwrap();
    assert_eq!(
        serde_json::Value::Object(updated),
        json!({ "name": "Ada", "age": 36, "score": 9.5 })
    );

    let err = fx
        .vault
        .update_record(t, 0, record(json!({ "age": null })))
        .unwrap_err();
    assert!(matches!(err, VaultError::Validation { ref field, .. } if field == "age"));
    let page = fx.vault.get_data(t, 1, 10).unwrap();
    assert_eq!(page.data[0]["age"], json!(36));
    assert_eq!(page.metadata.updated_by.as_deref(), Some(ROOT_EMAIL));
    assert_eq!(page.metadata.active_schema.as_deref(), Some("people"));

    assert!(matches!(
        fx.vault.update_record(t, 5, record(json!({ "age": 1 }))),
        Err(VaultError::NotFound(_))
    ));

    let removed = fx.vault.delete_record(t, 0).unwrap();
    assert_eq!(removed["name"], json!("Ada"));
    assert_eq!(fx.row_count(), 0);
    assert!(matches!(
        fx.vault.delete_record(t, 0),
        Err(VaultError::NotFound(_))
    ));
}

#[test]
fn test_update_by_source_header() {
    let fx = fixture();
    fx.activate_people_schema();
    let t = &fx.root_token;
    fx.vault
        .add_record(t, record(json!({ "Full Name": "Ada", "age": 36 })))
        .unwrap();

    let updated = fx
        .vault
        .update_record(t, 0, record(json!({ "Full Name": "Bob" })))
        .unwrap();
    assert_eq!(updated["name"], json!("Bob"));
    assert_eq!(fx.vault.get_data(t, 1, 10).unwrap().data[0]["name"], json!("Bob"));
}

// ─── Test 3: Pagination ─────────────────────────────────────────────────────

#[test]
fn test_pagination() {
    let fx = fixture();
    fx.activate_people_schema();
    for i in 0..5 {
        fx.vault
            .add_record(&fx.root_token, record(json!({ "name": format!("p{i}"), "age": i })))
            .unwrap();
    }
    let page = fx.vault.get_data(&fx.root_token, 3, 2).unwrap();
    assert_eq!(page.pagination.total_records, 5);
    assert_eq!(page.pagination.total_pages, 3);
    assert_eq!(page.pagination.current_page, 3);
    assert_eq!(page.data.len(), 1);
    assert_eq!(page.data[0]["name"], json!("p4"));

    assert!(fx.vault.get_data(&fx.root_token, 9, 2).unwrap().data.is_empty());
    assert!(matches!(
        fx.vault.get_data(&fx.root_token, 0, 2),
        Err(VaultError::Validation { .. })
    ));
    assert!(matches!(
        fx.vault.get_data(&fx.root_token, 1, 0),
        Err(VaultError::Validation { .. })
    ));
}

// ─── Test 4: Tabular import ─────────────────────────────────────────────────

#[test]
fn test_import_is_all_or_nothing() {
    let fx = fixture();
    fx.activate_people_schema();
    let t = &fx.root_token;
    fx.vault
        .add_record(t, record(json!({ "name": "Existing", "age": 1 })))
        .unwrap();

    let bad = vec![
        record(json!({ "Full Name": "Ada", "age": 36 })),
        record(json!({ "Full Name": "Bob", "age": "thirty" })),
    ];
    let err = fx.vault.import_tabular_file(t, bad).unwrap_err();
    assert!(err.to_string().contains("row 2: age"));
    let page = fx.vault.get_data(t, 1, 10).unwrap();
    assert_eq!(page.metadata.row_count, 1);
    assert_eq!(page.data[0]["name"], json!("Existing"));

    let good = vec![
        record(json!({ "Full Name": "Ada", "age": 36 })),
        record(json!({ "name": "Bob", "age": "41", "score": "" })),
    ];
    assert_eq!(fx.vault.import_tabular_file(t, good).unwrap(), 2);
    let page = fx.vault.get_data(t, 1, 10).unwrap();
    assert_eq!(page.metadata.row_count, 2);
    assert_eq!(page.data[0]["name"], json!("Ada"));
    assert_eq!(page.data[1]["score"], json!(null));
}

// ─── Test 5: Role limits ────────────────────────────────────────────────────

#[test]
fn test_record_permissions_by_role() {
    let fx = fixture();
    fx.activate_people_schema();
    let moderator = fx.login_as("mod@tabvault.test", Role::Moderator);
    let member = fx.login_as("member@tabvault.test", Role::User);
    let row = || record(json!({ "name": "Ada", "age": 36 }));

    fx.vault.add_record(&moderator, row()).unwrap();
    assert!(matches!(
        fx.vault.delete_record(&moderator, 0),
        Err(VaultError::PermissionDenied)
    ));
    assert!(matches!(
        fx.vault.import_tabular_file(&moderator, vec![row()]),
        Err(VaultError::PermissionDenied)
    ));
    assert!(matches!(
        fx.vault.create_schema(&moderator, "mine", vec![ColumnDef::new("a", ColumnType::Text, true)]),
        Err(VaultError::PermissionDenied)
    ));

    assert_eq!(fx.vault.get_data(&member, 1, 10).unwrap().data.len(), 1);
    assert!(fx.vault.list_schemas(&member).is_ok());
    assert!(matches!(
        fx.vault.add_record(&member, row()),
        Err(VaultError::PermissionDenied)
    ));
    assert_eq!(fx.row_count(), 1);
}

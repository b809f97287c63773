//! Named column schemas, each in its own encrypted file, plus the single
//! active schema that governs record validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::access::VaultContext;
use crate::audit::AuditOutcome;
use crate::error::{VaultError, VaultResult};
use crate::permissions::Operation;
use crate::session::SessionClaims;
use crate::storage::EncryptedFile;

const SCHEMA_VERSION: u32 = 1;
const SCHEMA_EXTENSION: &str = "enc";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    Text,
    Number,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    /// Header of the source spreadsheet column. Falls back to `name`.
    #[serde(default)]
    pub excel_column: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: &str, column_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            excel_column: name.to_string(),
            column_type,
            nullable,
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.excel_column = alias.to_string();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaMetadata {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schema {
    pub columns: Vec<ColumnDef>,
    pub metadata: SchemaMetadata,
}

impl Schema {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivationMetadata {
    pub activated_at: DateTime<Utc>,
    pub activated_by: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveSchema {
    pub schema: Schema,
    pub metadata: ActivationMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaInfo {
    pub name: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub columns: usize,
    pub active: bool,
}

#[derive(Debug, Deserialize)]
struct SchemaImport {
    columns: Vec<ColumnDef>,
}

pub struct SchemaStore {
    ctx: Arc<VaultContext>,
    dir: PathBuf,
    active: EncryptedFile,
}

impl SchemaStore {
    pub fn new(ctx: Arc<VaultContext>, dir: PathBuf, active: EncryptedFile) -> Self {
        Self { ctx, dir, active }
    }

    fn schema_file(&self, name: &str) -> EncryptedFile {
        EncryptedFile::new(self.dir.join(format!("{name}.{SCHEMA_EXTENSION}")))
    }

    /// Every encrypted file this store owns, active schema included.
    pub(crate) fn files(&self) -> VaultResult<Vec<EncryptedFile>> {
        let mut files: Vec<EncryptedFile> = self
            .schema_names()?
            .iter()
            .map(|name| self.schema_file(name))
            .collect();
        files.push(self.active.clone());
        Ok(files)
    }

    fn schema_names(&self) -> VaultResult<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(err.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path == self.active.path()
                || path.extension().and_then(|e| e.to_str()) != Some(SCHEMA_EXTENSION)
            {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if valid_name(stem) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn load_schema(&self, name: &str) -> VaultResult<Schema> {
        if !valid_name(name) {
            return Err(VaultError::NotFound(format!("schema {name}")));
        }
        let password = self.ctx.master_password();
        self.schema_file(name)
            .load(&self.ctx.engine, &password)?
            .ok_or_else(|| VaultError::NotFound(format!("schema {name}")))
    }

    /// The active schema without an authorization check, for record validation.
    pub(crate) fn active_schema(&self) -> VaultResult<Option<ActiveSchema>> {
        let password = self.ctx.master_password();
        self.active.load(&self.ctx.engine, &password)
    }

    pub fn create_schema(
        &self,
        token: &str,
        name: &str,
        columns: Vec<ColumnDef>,
    ) -> VaultResult<Schema> {
        let action = "schema.create";
        let claims = self
            .ctx
            .authorize(token, Operation::SchemaModify, action, Some(name))?;
        let result = self.insert_schema(&claims, name, columns);
        match &result {
            Ok(schema) => self.ctx.audit(
                &claims.email,
                action,
                AuditOutcome::Success,
                Some(name),
                json!({ "columns": schema.columns.len() }),
            ),
            Err(err) => self.ctx.audit_failure(&claims.email, action, Some(name), err),
        }
        result
    }

    fn insert_schema(
        &self,
        claims: &SessionClaims,
        name: &str,
        columns: Vec<ColumnDef>,
    ) -> VaultResult<Schema> {
        if !valid_name(name) {
            return Err(VaultError::validation(
                "name",
                "schema names must be non-empty and alphanumeric",
            ));
        }
        let columns = normalize_columns(columns)?;
        let file = self.schema_file(name);
        if file.exists() {
            return Err(VaultError::Conflict(format!("schema {name}")));
        }
        let schema = Schema {
            columns,
            metadata: SchemaMetadata {
                version: SCHEMA_VERSION,
                created_at: Utc::now(),
                created_by: claims.email.clone(),
                name: name.to_string(),
            },
        };
        let password = self.ctx.master_password();
        file.save(&self.ctx.engine, &password, &schema)?;
        info!(schema = name, columns = schema.columns.len(), "schema created");
        Ok(schema)
    }

    pub fn list_schemas(&self, token: &str) -> VaultResult<Vec<SchemaInfo>> {
        self.ctx.authorize(token, Operation::Read, "schema.list", None)?;
        let active_name = self.active_schema()?.map(|active| active.metadata.name);
        self.schema_names()?
            .iter()
            .map(|name| -> VaultResult<SchemaInfo> {
                let schema = self.load_schema(name)?;
                Ok(SchemaInfo {
                    active: active_name.as_deref() == Some(name.as_str()),
                    name: schema.metadata.name,
                    version: schema.metadata.version,
                    created_at: schema.metadata.created_at,
                    created_by: schema.metadata.created_by,
                    columns: schema.columns.len(),
                })
            })
            .collect()
    }

    pub fn get_schema(&self, token: &str, name: &str) -> VaultResult<Schema> {
        self.ctx.authorize(token, Operation::Read, "schema.get", Some(name))?;
        self.load_schema(name)
    }

    pub fn set_active_schema(&self, token: &str, name: &str) -> VaultResult<ActiveSchema> {
        let action = "schema.activate";
        let claims = self
            .ctx
            .authorize(token, Operation::SchemaModify, action, Some(name))?;
        let result = self.load_schema(name).and_then(|schema| {
            let active = ActiveSchema {
                schema,
                metadata: ActivationMetadata {
                    activated_at: Utc::now(),
                    activated_by: claims.email.clone(),
                    name: name.to_string(),
                },
            };
            let password = self.ctx.master_password();
            self.active.save(&self.ctx.engine, &password, &active)?;
            Ok(active)
        });
        match &result {
            Ok(_) => {
                info!(schema = name, "active schema changed");
                self.ctx
                    .audit(&claims.email, action, AuditOutcome::Success, Some(name), json!({}))
            }
            Err(err) => self.ctx.audit_failure(&claims.email, action, Some(name), err),
        }
        result
    }

    pub fn get_active_schema(&self, token: &str) -> VaultResult<Option<ActiveSchema>> {
        self.ctx.authorize(token, Operation::Read, "schema.active", None)?;
        self.active_schema()
    }

    /// Create `name` from a JSON file holding `{"columns": [...]}`.
    pub fn import_schema(&self, token: &str, name: &str, path: &Path) -> VaultResult<Schema> {
        let action = "schema.import";
        let claims = self
            .ctx
            .authorize(token, Operation::SchemaModify, action, Some(name))?;
        let result = fs::read_to_string(path)
            .map_err(VaultError::from)
            .and_then(|text| {
                serde_json::from_str::<SchemaImport>(&text)
                    .map_err(|err| VaultError::validation("file", err.to_string()))
            })
            .and_then(|import| self.insert_schema(&claims, name, import.columns));
        match &result {
            Ok(schema) => self.ctx.audit(
                &claims.email,
                action,
                AuditOutcome::Success,
                Some(name),
                json!({ "source": path.display().to_string(), "columns": schema.columns.len() }),
            ),
            Err(err) => self.ctx.audit_failure(&claims.email, action, Some(name), err),
        }
        result
    }

    /// Write `name` to `path` as plain, pretty-printed JSON.
    pub fn export_schema(&self, token: &str, name: &str, path: &Path) -> VaultResult<()> {
        let action = "schema.export";
        let claims = self.ctx.authorize(token, Operation::Read, action, Some(name))?;
        let schema = self.load_schema(name)?;
        fs::write(path, serde_json::to_string_pretty(&schema)?)?;
        debug!(schema = name, path = %path.display(), "schema exported");
        self.ctx.audit(
            &claims.email,
            action,
            AuditOutcome::Success,
            Some(name),
            json!({ "destination": path.display().to_string() }),
        );
        Ok(())
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric())
}

fn normalize_columns(columns: Vec<ColumnDef>) -> VaultResult<Vec<ColumnDef>> {
    if columns.is_empty() {
        return Err(VaultError::validation("columns", "at least one column is required"));
    }
    let mut seen = HashSet::new();
    columns
        .into_iter()
        .map(|mut column| {
            column.name = column.name.trim().to_string();
            if column.name.is_empty() {
                return Err(VaultError::validation("columns", "column names must not be empty"));
            }
            if !seen.insert(column.name.clone()) {
                return Err(VaultError::validation(
                    column.name.clone(),
                    "duplicate column name",
                ));
            }
            column.excel_column = column.excel_column.trim().to_string();
            if column.excel_column.is_empty() {
                column.excel_column = column.name.clone();
            }
            Ok(column)
        })
        .collect()
}

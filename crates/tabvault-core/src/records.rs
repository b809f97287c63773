//! The encrypted record table, validated against the active schema.
//!
//! Every mutation validates the complete result before anything is written,
//! so a rejected call leaves the data file exactly as it was.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Number, Value};
use std::sync::Arc;
use tracing::info;

use crate::access::VaultContext;
use crate::audit::AuditOutcome;
use crate::error::{VaultError, VaultResult};
use crate::permissions::Operation;
use crate::schemas::{ColumnDef, ColumnType, Schema, SchemaStore};
use crate::session::SessionClaims;
use crate::storage::EncryptedFile;

const DATA_VERSION: u32 = 1;

pub type Record = Map<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataMetadata {
    pub version: u32,
    pub last_updated: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
    pub row_count: usize,
    pub active_schema: Option<String>,
}

impl Default for DataMetadata {
    fn default() -> Self {
        Self {
            version: DATA_VERSION,
            last_updated: None,
            updated_by: None,
            row_count: 0,
            active_schema: None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DataDocument {
    data: Vec<Record>,
    metadata: DataMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pagination {
    pub total_records: usize,
    pub total_pages: usize,
    pub current_page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataPage {
    pub data: Vec<Record>,
    pub metadata: DataMetadata,
    pub pagination: Pagination,
}

pub struct RecordStore {
    ctx: Arc<VaultContext>,
    file: EncryptedFile,
    schemas: Arc<SchemaStore>,
}

impl RecordStore {
    pub fn new(ctx: Arc<VaultContext>, file: EncryptedFile, schemas: Arc<SchemaStore>) -> Self {
        Self { ctx, file, schemas }
    }

    pub(crate) fn file(&self) -> &EncryptedFile {
        &self.file
    }

    fn load(&self) -> VaultResult<DataDocument> {
        let password = self.ctx.master_password();
        Ok(self
            .file
            .load(&self.ctx.engine, &password)?
            .unwrap_or_default())
    }

    fn save(&self, doc: &mut DataDocument, claims: &SessionClaims, schema: Option<&Schema>) -> VaultResult<()> {
        doc.metadata.version = DATA_VERSION;
        doc.metadata.last_updated = Some(Utc::now());
        doc.metadata.updated_by = Some(claims.email.clone());
        doc.metadata.row_count = doc.data.len();
        if let Some(schema) = schema {
            doc.metadata.active_schema = Some(schema.name().to_string());
        }
        let password = self.ctx.master_password();
        self.file.save(&self.ctx.engine, &password, &*doc)
    }

    fn require_schema(&self) -> VaultResult<Schema> {
        self.schemas
            .active_schema()?
            .map(|active| active.schema)
            .ok_or(VaultError::NoActiveSchema)
    }

    /// Finish an authorized mutation: audit the outcome and pass it through.
    fn conclude<T>(
        &self,
        claims: &SessionClaims,
        action: &str,
        target: Option<&str>,
        result: VaultResult<T>,
        detail: impl FnOnce(&T) -> Value,
    ) -> VaultResult<T> {
        match &result {
            Ok(value) => {
                self.ctx
                    .audit(&claims.email, action, AuditOutcome::Success, target, detail(value))
            }
            Err(err) => self.ctx.audit_failure(&claims.email, action, target, err),
        }
        result
    }

    /// Append a record; returns its index.
    pub fn add_record(&self, token: &str, fields: Record) -> VaultResult<usize> {
        let action = "record.add";
        let claims = self.ctx.authorize(token, Operation::Write, action, None)?;
        let result = (|| -> VaultResult<usize> {
            let schema = self.require_schema()?;
            let record = validate_record(&schema, &fields, None)?;
            let mut doc = self.load()?;
            doc.data.push(record);
            self.save(&mut doc, &claims, Some(&schema))?;
            Ok(doc.data.len() - 1)
        })();
        self.conclude(&claims, action, None, result, |index| json!({ "index": index }))
    }

    /// Merge `fields` into the record at `index` and re-validate it.
    pub fn update_record(&self, token: &str, index: usize, fields: Record) -> VaultResult<Record> {
        let action = "record.update";
        let target = index.to_string();
        let claims = self
            .ctx
            .authorize(token, Operation::Write, action, Some(&target))?;
        let result = (|| -> VaultResult<Record> {
            let schema = self.require_schema()?;
            let mut doc = self.load()?;
            let existing = doc
                .data
                .get(index)
                .ok_or_else(|| VaultError::NotFound(format!("record {index}")))?;
            let mut merged = existing.clone();
            merged.extend(keyed_by_column(&schema, &fields));
            let record = validate_record(&schema, &merged, None)?;
            doc.data[index] = record.clone();
            self.save(&mut doc, &claims, Some(&schema))?;
            Ok(record)
        })();
        let changed: Vec<String> = fields.keys().cloned().collect();
        self.conclude(&claims, action, Some(&target), result, |_| json!({ "fields": changed }))
    }

    pub fn delete_record(&self, token: &str, index: usize) -> VaultResult<Record> {
        let action = "record.delete";
        let target = index.to_string();
        let claims = self
            .ctx
            .authorize(token, Operation::Delete, action, Some(&target))?;
        let result = (|| -> VaultResult<Record> {
            let mut doc = self.load()?;
            if index >= doc.data.len() {
                return Err(VaultError::NotFound(format!("record {index}")));
            }
            let removed = doc.data.remove(index);
            self.save(&mut doc, &claims, None)?;
            Ok(removed)
        })();
        self.conclude(&claims, action, Some(&target), result, |_| json!({}))
    }

    /// One page of records. Pages are numbered from 1.
    pub fn get_data(&self, token: &str, page: usize, page_size: usize) -> VaultResult<DataPage> {
        self.ctx.authorize(token, Operation::Read, "data.read", None)?;
        if page == 0 {
            return Err(VaultError::validation("page", "pages start at 1"));
        }
        if page_size == 0 {
            return Err(VaultError::validation("page_size", "must be positive"));
        }
        let doc = self.load()?;
        let total_records = doc.data.len();
        let data = doc
            .data
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .collect();
        Ok(DataPage {
            data,
            metadata: doc.metadata,
            pagination: Pagination {
                total_records,
                total_pages: total_records.div_ceil(page_size),
                current_page: page,
                page_size,
            },
        })
    }

    /// Replace the whole table with `rows`, already parsed from a spreadsheet.
    ///
    /// Each row may key its cells by column name or by the column's source
    /// header. One invalid row rejects the entire import.
    pub fn import_tabular_file(&self, token: &str, rows: Vec<Record>) -> VaultResult<usize> {
        let action = "record.import";
        let claims = self.ctx.authorize(token, Operation::Write, action, None)?;
        self.ctx.authorize(token, Operation::Delete, action, None)?;
        let result = (|| -> VaultResult<usize> {
            let schema = self.require_schema()?;
            let records = rows
                .iter()
                .enumerate()
                .map(|(i, row)| validate_record(&schema, row, Some(i + 1)))
                .collect::<VaultResult<Vec<_>>>()?;
            let mut doc = self.load()?;
            doc.data = records;
            self.save(&mut doc, &claims, Some(&schema))?;
            info!(rows = doc.data.len(), schema = schema.name(), "table replaced by import");
            Ok(doc.data.len())
        })();
        self.conclude(&claims, action, None, result, |rows| json!({ "rows": rows }))
    }
}

/// Coerce `input` into a record of exactly the schema's columns.
///
/// Unknown keys are dropped. `row` only decorates error field names.
pub fn validate_record(schema: &Schema, input: &Record, row: Option<usize>) -> VaultResult<Record> {
    let mut record = Record::new();
    for column in &schema.columns {
        let field = || match row {
            Some(row) => format!("row {row}: {}", column.name),
            None => column.name.clone(),
        };
        let raw = input
            .get(&column.name)
            .or_else(|| input.get(&column.excel_column));
        let value = match raw {
            Some(raw) => coerce(column, raw).map_err(|message| VaultError::validation(field(), message))?,
            None if column.nullable => Value::Null,
            None => return Err(VaultError::validation(field(), "required column is missing")),
        };
        if value.is_null() && !column.nullable {
            return Err(VaultError::validation(field(), "must not be null"));
        }
        record.insert(column.name.clone(), value);
    }
    Ok(record)
}

/// Rename cells keyed by a column's source header to the column name.
/// A cell keyed by the name itself wins over one keyed by the header.
fn keyed_by_column(schema: &Schema, fields: &Record) -> Record {
    let mut out = Record::new();
    for (key, value) in fields {
        if schema.column(key).is_some() {
            out.insert(key.clone(), value.clone());
            continue;
        }
        match schema.columns.iter().find(|c| &c.excel_column == key) {
            Some(column) if !fields.contains_key(&column.name) => {
                out.insert(column.name.clone(), value.clone());
            }
            Some(_) => {}
            None => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out
}

fn coerce(column: &ColumnDef, raw: &Value) -> Result<Value, String> {
    match (column.column_type, raw) {
        (_, Value::Null) => Ok(Value::Null),
        (ColumnType::Text, Value::String(_)) => Ok(raw.clone()),
        (ColumnType::Text, Value::Number(n)) => Ok(Value::String(n.to_string())),
        (ColumnType::Text, Value::Bool(b)) => Ok(Value::String(b.to_string())),
        (ColumnType::Number, Value::Number(_)) => Ok(raw.clone()),
        (ColumnType::Number, Value::String(s)) => parse_number(s),
        (ColumnType::Text, _) => Err("expected text".to_string()),
        (ColumnType::Number, _) => Err("expected a number".to_string()),
    }
}

fn parse_number(text: &str) -> Result<Value, String> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Value::Null);
    }
    if let Ok(int) = text.parse::<i64>() {
        return Ok(Value::from(int));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| format!("'{text}' is not a number"))
}
